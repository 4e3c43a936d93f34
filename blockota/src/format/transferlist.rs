// SPDX-FileCopyrightText: 2024-2026 blockota contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, num::ParseIntError};

use crate::format::{
    hashtree,
    rangeset::{self, RangeSet},
};

// `Display`, `Error`, and `From` are written out by hand instead of derived
// with thiserror because `MoveSizeMismatch` has a data field named `source`
// (the move's source block count). thiserror unconditionally treats a field
// with that name as the error's `source()`, which `u64` cannot be.
#[derive(Debug)]
pub enum Error {
    MissingHeader(&'static str),
    UnsupportedVersion(String),
    InvalidHeaderValue {
        field: &'static str,
        value: String,
        source: ParseIntError,
    },
    InvalidCommand {
        index: usize,
        line: String,
        source: Box<Error>,
    },
    UnknownCommand(String),
    UnsupportedCommand(&'static str),
    WrongArgCount,
    InvalidNumber(String, ParseIntError),
    InvalidStashReference(String),
    WrongSourceBlockCount { declared: u64, actual: u64 },
    MismatchedSourceLocation { data: u64, location: u64 },
    SourceLocationOutOfBounds { end: u64, blocks: u64 },
    MoveSizeMismatch { source: u64, target: u64 },
    FragmentedHashTree,
    UnsupportedHashAlgorithm(String),
    WrongRootDigestLength {
        algorithm: String,
        expected: usize,
        actual: usize,
    },
    InvalidHex(String, hex::FromHexError),
    WrongTotalBlocks { declared: u64, actual: u64 },
    RangeSet(rangeset::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingHeader(header) => {
                write!(f, "Transfer list is missing its {header} header line")
            }
            Self::UnsupportedVersion(version) => {
                write!(f, "Unsupported transfer list version: {version:?}")
            }
            Self::InvalidHeaderValue { field, value, .. } => {
                write!(f, "Invalid {field} header value: {value:?}")
            }
            Self::InvalidCommand { index, line, .. } => {
                write!(f, "Invalid command #{index}: {line:?}")
            }
            Self::UnknownCommand(op) => write!(f, "Unknown command: {op:?}"),
            Self::UnsupportedCommand(op) => write!(f, "Unsupported command: {op:?}"),
            Self::WrongArgCount => write!(f, "Invalid number of arguments"),
            Self::InvalidNumber(value, _) => write!(f, "Invalid numeric value: {value:?}"),
            Self::InvalidStashReference(token) => {
                write!(f, "Invalid stash reference: {token:?}")
            }
            Self::WrongSourceBlockCount { declared, actual } => {
                write!(
                    f,
                    "Source specification covers {actual} blocks, but declares {declared}",
                )
            }
            Self::MismatchedSourceLocation { data, location } => {
                write!(
                    f,
                    "Source ranges cover {data} blocks, but their location covers {location}",
                )
            }
            Self::SourceLocationOutOfBounds { end, blocks } => {
                write!(
                    f,
                    "Source location block {end} exceeds the {blocks}-block source buffer",
                )
            }
            Self::MoveSizeMismatch { source, target } => {
                write!(
                    f,
                    "move source covers {source} blocks, but the target covers {target}",
                )
            }
            Self::FragmentedHashTree => {
                write!(f, "Hash tree ranges must be a single contiguous range")
            }
            Self::UnsupportedHashAlgorithm(algorithm) => {
                write!(f, "Unsupported hash tree algorithm: {algorithm:?}")
            }
            Self::WrongRootDigestLength {
                algorithm,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Root digest has {actual} bytes, but {algorithm} digests have {expected}",
                )
            }
            Self::InvalidHex(value, _) => write!(f, "Invalid hex value: {value:?}"),
            Self::WrongTotalBlocks { declared, actual } => {
                write!(
                    f,
                    "Commands write {actual} blocks, but the header declares {declared}",
                )
            }
            Self::RangeSet(_) => write!(f, "Invalid range set"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidHeaderValue { source, .. } => Some(source),
            Self::InvalidCommand { source, .. } => Some(source),
            Self::InvalidNumber(_, source) => Some(source),
            Self::InvalidHex(_, source) => Some(source),
            Self::RangeSet(source) => Some(source),
            _ => None,
        }
    }
}

impl From<rangeset::Error> for Error {
    fn from(source: rangeset::Error) -> Self {
        Self::RangeSet(source)
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Target of a writing command: the blocks to write and the hex digest their
/// contents must have afterwards.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TargetInfo {
    pub hash: String,
    pub ranges: RangeSet,
}

/// A stash and its block ranges. For the `stash` command the ranges name
/// source blocks to save; inside a source specification they name where in
/// the assembled source buffer the stashed data belongs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StashInfo {
    pub id: String,
    pub ranges: RangeSet,
}

/// Where a command's source bytes come from and the hex digest the assembled
/// buffer must have.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourceInfo {
    pub hash: String,
    /// Blocks read from the device, or `None` for stash-only sources.
    pub ranges: Option<RangeSet>,
    /// Where the device blocks land in the assembled buffer. `None` means
    /// they fill it contiguously.
    pub location: Option<RangeSet>,
    pub stashes: Vec<StashInfo>,
    blocks: u64,
}

impl SourceInfo {
    /// Size of the assembled source buffer in blocks.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Whether the source reads any device blocks that the target overwrites.
    pub fn overlaps(&self, target: &TargetInfo) -> bool {
        self.ranges
            .as_ref()
            .is_some_and(|r| r.overlaps(&target.ranges))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PatchInfo {
    /// Byte offset into the patch stream.
    pub offset: u64,
    pub len: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HashTreeInfo {
    pub tree_ranges: RangeSet,
    pub source_ranges: RangeSet,
    pub algorithm: String,
    pub salt: Vec<u8>,
    pub root: Vec<u8>,
}

/// A fully parsed transfer list command. Every numeric field, range set, and
/// hex value has already been validated, so execution failures can only come
/// from the data itself.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    Abort,
    Zero {
        target: RangeSet,
    },
    New {
        target: RangeSet,
    },
    Move {
        target: TargetInfo,
        source: SourceInfo,
    },
    Bsdiff {
        patch: PatchInfo,
        target: TargetInfo,
        source: SourceInfo,
    },
    Imgdiff {
        patch: PatchInfo,
        target: TargetInfo,
        source: SourceInfo,
    },
    Stash {
        id: String,
        ranges: RangeSet,
    },
    Free {
        id: String,
    },
    ComputeHashTree {
        info: HashTreeInfo,
    },
}

impl Command {
    /// Parse a single command line.
    pub fn parse(line: &str) -> Result<Self> {
        let tokens = line.split(' ').collect::<Vec<_>>();
        let (op, args) = tokens
            .split_first()
            .map(|(op, args)| (*op, args))
            .unwrap_or(("", &[]));

        match op {
            "abort" => {
                if !args.is_empty() {
                    return Err(Error::WrongArgCount);
                }

                Ok(Self::Abort)
            }
            "zero" | "new" => {
                if args.len() != 1 {
                    return Err(Error::WrongArgCount);
                }

                let target = RangeSet::parse(args[0])?;

                if op == "zero" {
                    Ok(Self::Zero { target })
                } else {
                    Ok(Self::New { target })
                }
            }
            "stash" => {
                if args.len() != 2 {
                    return Err(Error::WrongArgCount);
                }

                Ok(Self::Stash {
                    id: args[0].to_owned(),
                    ranges: RangeSet::parse(args[1])?,
                })
            }
            "free" => {
                if args.len() != 1 {
                    return Err(Error::WrongArgCount);
                }

                Ok(Self::Free {
                    id: args[0].to_owned(),
                })
            }
            "move" => {
                let (hash, rest) = args.split_first().ok_or(Error::WrongArgCount)?;
                let (target, source) = parse_target_and_source(rest, hash, hash)?;

                // A move writes the source buffer to the target unchanged, so
                // the sizes must agree.
                if source.blocks() != target.ranges.blocks() {
                    return Err(Error::MoveSizeMismatch {
                        source: source.blocks(),
                        target: target.ranges.blocks(),
                    });
                }

                Ok(Self::Move { target, source })
            }
            "bsdiff" | "imgdiff" => {
                if args.len() < 4 {
                    return Err(Error::WrongArgCount);
                }

                let patch = PatchInfo {
                    offset: parse_u64(args[0])?,
                    len: parse_u64(args[1])?,
                };
                let (target, source) = parse_target_and_source(&args[4..], args[3], args[2])?;

                if op == "bsdiff" {
                    Ok(Self::Bsdiff {
                        patch,
                        target,
                        source,
                    })
                } else {
                    Ok(Self::Imgdiff {
                        patch,
                        target,
                        source,
                    })
                }
            }
            "compute_hash_tree" => {
                if args.len() != 5 {
                    return Err(Error::WrongArgCount);
                }

                let tree_ranges = RangeSet::parse(args[0])?;
                if tree_ranges.ranges().len() != 1 {
                    return Err(Error::FragmentedHashTree);
                }

                let source_ranges = RangeSet::parse(args[1])?;

                let algorithm = hashtree::ring_algorithm(args[2])
                    .map_err(|_| Error::UnsupportedHashAlgorithm(args[2].to_owned()))?;

                let salt =
                    hex::decode(args[3]).map_err(|e| Error::InvalidHex(args[3].to_owned(), e))?;
                let root =
                    hex::decode(args[4]).map_err(|e| Error::InvalidHex(args[4].to_owned(), e))?;

                if root.len() != algorithm.output_len() {
                    return Err(Error::WrongRootDigestLength {
                        algorithm: args[2].to_owned(),
                        expected: algorithm.output_len(),
                        actual: root.len(),
                    });
                }

                Ok(Self::ComputeHashTree {
                    info: HashTreeInfo {
                        tree_ranges,
                        source_ranges,
                        algorithm: args[2].to_owned(),
                        salt,
                        root,
                    },
                })
            }
            // Discarding blocks is flash-specific plumbing that this engine
            // does not perform. Rejecting the line loudly beats silently
            // skipping a command the generator expected to run.
            "erase" => Err(Error::UnsupportedCommand("erase")),
            _ => Err(Error::UnknownCommand(op.to_owned())),
        }
    }

    /// Blocks this command writes to the target when executed, which is what
    /// the header's declared total counts.
    pub fn written_blocks(&self) -> u64 {
        match self {
            Self::Zero { target } | Self::New { target } => target.blocks(),
            Self::Move { target, .. }
            | Self::Bsdiff { target, .. }
            | Self::Imgdiff { target, .. } => target.ranges.blocks(),
            Self::Abort | Self::Stash { .. } | Self::Free { .. } | Self::ComputeHashTree { .. } => {
                0
            }
        }
    }
}

fn parse_u64(token: &str) -> Result<u64> {
    token
        .parse()
        .map_err(|e| Error::InvalidNumber(token.to_owned(), e))
}

/// Parse the common tail of `move`/`bsdiff`/`imgdiff`:
///
///   `<tgt_ranges> <count> <src_ranges>`
///   `<tgt_ranges> <count> <src_ranges> <src_loc> [<id>:<ranges> ...]`
///   `<tgt_ranges> <count> - [<id>:<ranges> ...]`
fn parse_target_and_source(
    tokens: &[&str],
    target_hash: &str,
    source_hash: &str,
) -> Result<(TargetInfo, SourceInfo)> {
    if tokens.len() < 3 {
        return Err(Error::WrongArgCount);
    }

    let target = TargetInfo {
        hash: target_hash.to_owned(),
        ranges: RangeSet::parse(tokens[0])?,
    };

    let declared = parse_u64(tokens[1])?;

    let mut pos = 2;
    let mut ranges = None;
    let mut location = None;

    if tokens[pos] == "-" {
        pos += 1;
    } else {
        let parsed = RangeSet::parse(tokens[pos])?;
        pos += 1;

        if pos < tokens.len() {
            let parsed_location = RangeSet::parse(tokens[pos])?;
            pos += 1;

            if parsed_location.blocks() != parsed.blocks() {
                return Err(Error::MismatchedSourceLocation {
                    data: parsed.blocks(),
                    location: parsed_location.blocks(),
                });
            }

            location = Some(parsed_location);
        }

        ranges = Some(parsed);
    }

    let mut stashes = vec![];
    while pos < tokens.len() {
        let (id, loc) = tokens[pos]
            .split_once(':')
            .ok_or_else(|| Error::InvalidStashReference(tokens[pos].to_owned()))?;

        stashes.push(StashInfo {
            id: id.to_owned(),
            ranges: RangeSet::parse(loc)?,
        });
        pos += 1;
    }

    let actual = ranges.as_ref().map(RangeSet::blocks).unwrap_or(0)
        + stashes.iter().map(|s| s.ranges.blocks()).sum::<u64>();
    if actual != declared {
        return Err(Error::WrongSourceBlockCount { declared, actual });
    }

    // Every location must fit in the assembled buffer before anything is
    // read or written.
    let location_ends = location
        .iter()
        .chain(stashes.iter().map(|s| &s.ranges))
        .flat_map(|r| r.iter())
        .map(|r| r.end);
    for end in location_ends {
        if end > declared {
            return Err(Error::SourceLocationOutOfBounds {
                end,
                blocks: declared,
            });
        }
    }

    Ok((
        target,
        SourceInfo {
            hash: source_hash.to_owned(),
            ranges,
            location,
            stashes,
            blocks: declared,
        },
    ))
}

/// A parsed command along with its exact source line. The literal line is
/// what gets persisted in the progress record and compared on resume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandEntry {
    pub line: String,
    pub command: Command,
}

/// A parsed transfer list: the four-line header followed by one command per
/// line.
#[derive(Clone, Debug)]
pub struct TransferList {
    version: u32,
    total_blocks: u64,
    stash_max_entries: u64,
    stash_max_blocks: u64,
    commands: Vec<CommandEntry>,
}

impl TransferList {
    /// Parse a complete transfer list. All commands are validated up front,
    /// including that the writing commands cover exactly the declared number
    /// of target blocks.
    pub fn parse(data: &str) -> Result<Self> {
        let mut lines = data.split('\n').collect::<Vec<_>>();
        if lines.last() == Some(&"") {
            lines.pop();
        }

        let version_line = lines.first().ok_or(Error::MissingHeader("version"))?;
        let version = version_line
            .parse::<u32>()
            .ok()
            .filter(|v| (3..=4).contains(v))
            .ok_or_else(|| Error::UnsupportedVersion((*version_line).to_owned()))?;

        let total_blocks = header_u64(&lines, 1, "total blocks")?;
        let stash_max_entries = header_u64(&lines, 2, "max stash entries")?;
        let stash_max_blocks = header_u64(&lines, 3, "max stash blocks")?;

        let mut commands = Vec::with_capacity(lines.len().saturating_sub(4));
        for (index, line) in lines.iter().enumerate().skip(4) {
            let command = Command::parse(line).map_err(|e| Error::InvalidCommand {
                index: index - 4,
                line: (*line).to_owned(),
                source: Box::new(e),
            })?;

            commands.push(CommandEntry {
                line: (*line).to_owned(),
                command,
            });
        }

        let actual = commands
            .iter()
            .map(|c| c.command.written_blocks())
            .sum::<u64>();
        if actual != total_blocks {
            return Err(Error::WrongTotalBlocks {
                declared: total_blocks,
                actual,
            });
        }

        Ok(Self {
            version,
            total_blocks,
            stash_max_entries,
            stash_max_blocks,
            commands,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Total number of target blocks the writing commands produce.
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Maximum number of stash entries held at any one time.
    pub fn stash_max_entries(&self) -> u64 {
        self.stash_max_entries
    }

    /// Maximum number of blocks stashed at any one time.
    pub fn stash_max_blocks(&self) -> u64 {
        self.stash_max_blocks
    }

    pub fn commands(&self) -> &[CommandEntry] {
        &self.commands
    }
}

fn header_u64(lines: &[&str], index: usize, field: &'static str) -> Result<u64> {
    let line = lines.get(index).ok_or(Error::MissingHeader(field))?;

    line.parse().map_err(|e| Error::InvalidHeaderValue {
        field,
        value: (*line).to_owned(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const HASH_A: &str = "0101010101010101010101010101010101010101";
    const HASH_B: &str = "0202020202020202020202020202020202020202";

    fn parse_one(line: &str) -> Command {
        Command::parse(line).unwrap()
    }

    #[test]
    fn parse_full_list() {
        let text = format!(
            "4\n10\n2\n4\n\
             stash {HASH_A} 2,0,2\n\
             move {HASH_A} 2,0,2 2 2,2,4\n\
             bsdiff 0 35 {HASH_A} {HASH_B} 2,4,6 2 2,6,8\n\
             new 2,8,10\n\
             zero 2,10,12\n\
             imgdiff 35 40 {HASH_A} {HASH_B} 2,12,14 2 - {HASH_A}:2,0,2\n\
             free {HASH_A}\n"
        );

        let list = TransferList::parse(&text).unwrap();
        assert_eq!(list.version(), 4);
        assert_eq!(list.total_blocks(), 10);
        assert_eq!(list.stash_max_entries(), 2);
        assert_eq!(list.stash_max_blocks(), 4);
        assert_eq!(list.commands().len(), 7);

        // The exact line survives for the progress record.
        assert_eq!(
            list.commands()[1].line,
            format!("move {HASH_A} 2,0,2 2 2,2,4"),
        );

        assert_matches!(
            &list.commands()[2].command,
            Command::Bsdiff { patch, target, source } if patch.offset == 0
                && patch.len == 35
                && target.hash == HASH_B
                && source.hash == HASH_A
                && source.blocks() == 2
        );

        assert_matches!(
            &list.commands()[5].command,
            Command::Imgdiff { source, .. } if source.ranges.is_none()
                && source.stashes.len() == 1
                && source.stashes[0].id == HASH_A
        );
    }

    #[test]
    fn parse_mixed_source() {
        let command = parse_one(&format!(
            "move {HASH_A} 4,0,2,8,10 4 2,4,6 2,0,2 {HASH_B}:2,2,4"
        ));

        assert_matches!(command, Command::Move { target, source } => {
            assert_eq!(target.ranges.blocks(), 4);
            assert_eq!(source.blocks(), 4);
            assert_eq!(source.ranges.as_ref().unwrap().blocks(), 2);
            assert_eq!(source.location.as_ref().unwrap().blocks(), 2);
            assert_eq!(source.stashes.len(), 1);
        });
    }

    #[test]
    fn source_overlap() {
        let overlapping = parse_one(&format!("move {HASH_A} 2,1,3 2 2,2,4"));
        assert_matches!(overlapping, Command::Move { target, source } => {
            assert!(source.overlaps(&target));
        });

        let disjoint = parse_one(&format!("move {HASH_A} 2,1,3 2 2,3,5"));
        assert_matches!(disjoint, Command::Move { target, source } => {
            assert!(!source.overlaps(&target));
        });

        let stash_only = parse_one(&format!("move {HASH_A} 2,1,3 2 - {HASH_B}:2,0,2"));
        assert_matches!(stash_only, Command::Move { target, source } => {
            assert!(!source.overlaps(&target));
        });
    }

    #[test]
    fn parse_compute_hash_tree() {
        let command = parse_one(&format!(
            "compute_hash_tree 2,0,2 6,2,4,6,8,10,12 sha256 73616c74 {}",
            "ab".repeat(32),
        ));

        assert_matches!(command, Command::ComputeHashTree { info } => {
            assert_eq!(info.tree_ranges.blocks(), 2);
            assert_eq!(info.source_ranges.blocks(), 6);
            assert_eq!(info.algorithm, "sha256");
            assert_eq!(info.salt, b"salt");
            assert_eq!(info.root, [0xab; 32]);
        });

        assert_matches!(
            Command::parse("compute_hash_tree 4,0,1,2,3 2,4,6 sha256 00 0000"),
            Err(Error::FragmentedHashTree)
        );
        assert_matches!(
            Command::parse("compute_hash_tree 2,0,2 2,4,6 blake2 00 0000"),
            Err(Error::UnsupportedHashAlgorithm(_))
        );
        assert_matches!(
            Command::parse("compute_hash_tree 2,0,2 2,4,6 sha256 00 0000"),
            Err(Error::WrongRootDigestLength {
                expected: 32,
                actual: 2,
                ..
            })
        );
        assert_matches!(
            Command::parse(&format!(
                "compute_hash_tree 2,0,2 2,4,6 sha256 0x00 {}",
                "ab".repeat(32),
            )),
            Err(Error::InvalidHex(_, _))
        );
    }

    #[test]
    fn malformed_commands() {
        assert_matches!(Command::parse(""), Err(Error::UnknownCommand(_)));
        assert_matches!(
            Command::parse("discard 2,0,2"),
            Err(Error::UnknownCommand(_))
        );
        assert_matches!(
            Command::parse("erase 2,0,2"),
            Err(Error::UnsupportedCommand("erase"))
        );
        assert_matches!(Command::parse("abort now"), Err(Error::WrongArgCount));
        assert_matches!(Command::parse("zero"), Err(Error::WrongArgCount));
        assert_matches!(Command::parse("zero 3,0,2"), Err(Error::RangeSet(_)));
        assert_matches!(
            Command::parse(&format!("move {HASH_A} 2,0,2 x 2,2,4")),
            Err(Error::InvalidNumber(_, _))
        );
        assert_matches!(
            Command::parse(&format!("move {HASH_A} 2,0,2 3 2,2,4")),
            Err(Error::WrongSourceBlockCount {
                declared: 3,
                actual: 2,
            })
        );
        assert_matches!(
            Command::parse(&format!("move {HASH_A} 2,0,2 4 2,2,4 3,0,3 {HASH_B}:2,2,4")),
            Err(Error::MismatchedSourceLocation {
                data: 2,
                location: 3,
            })
        );
        assert_matches!(
            Command::parse(&format!("move {HASH_A} 2,0,2 4 4,4,8")),
            Err(Error::MoveSizeMismatch {
                source: 4,
                target: 2,
            })
        );
        assert_matches!(
            Command::parse(&format!("move {HASH_A} 2,0,2 2 - {HASH_B}")),
            Err(Error::InvalidStashReference(_))
        );
        assert_matches!(
            Command::parse(&format!("move {HASH_A} 2,0,2 2 - {HASH_B}:2,2,4")),
            Err(Error::SourceLocationOutOfBounds { end: 4, blocks: 2 })
        );
    }

    #[test]
    fn header_validation() {
        assert_matches!(TransferList::parse(""), Err(Error::MissingHeader("version")));
        assert_matches!(
            TransferList::parse("2\n0\n0\n0\n"),
            Err(Error::UnsupportedVersion(_))
        );
        assert_matches!(
            TransferList::parse("banana\n0\n0\n0\n"),
            Err(Error::UnsupportedVersion(_))
        );
        assert_matches!(
            TransferList::parse("4\n0\n0\n"),
            Err(Error::MissingHeader("max stash blocks"))
        );
        assert_matches!(
            TransferList::parse("4\nxyz\n0\n0\n"),
            Err(Error::InvalidHeaderValue { field: "total blocks", .. })
        );

        // An empty command list writing zero blocks is valid.
        let list = TransferList::parse("3\n0\n0\n0\n").unwrap();
        assert_eq!(list.version(), 3);
        assert!(list.commands().is_empty());
    }

    #[test]
    fn total_blocks_must_match() {
        assert_matches!(
            TransferList::parse("4\n4\n0\n0\nzero 2,0,2\n"),
            Err(Error::WrongTotalBlocks {
                declared: 4,
                actual: 2,
            })
        );

        TransferList::parse("4\n2\n0\n0\nzero 2,0,2\n").unwrap();
    }

    #[test]
    fn command_errors_carry_position() {
        let err = TransferList::parse("4\n2\n0\n0\nzero 2,0,2\nfrob 1,2\n").unwrap_err();

        assert_matches!(err, Error::InvalidCommand { index: 1, line, source } => {
            assert_eq!(line, "frob 1,2");
            assert_matches!(*source, Error::UnknownCommand(_));
        });
    }
}
