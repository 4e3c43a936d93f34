// SPDX-FileCopyrightText: 2024-2026 blockota contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Executor for parsed transfer lists. [`apply`] rewrites a target image
//! in place and can resume an interrupted run; [`verify_applied`] replays
//! the same list read-only to check whether the target state is consistent
//! with a previous run.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender},
    },
    thread,
    time::Duration,
};

use ring::digest;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    format::{
        bsdiff,
        hashtree::{self, HashTree},
        imgdiff,
        rangeset::{BLOCK_SIZE, RangeSet, SortedRangeSet},
        transferlist::{
            Command, CommandEntry, HashTreeInfo, PatchInfo, SourceInfo, TargetInfo, TransferList,
        },
    },
    stream::{ReadSeek, ReadWriteAt},
    util,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Update cannot be resumed")]
    NotResumable(#[source] Box<Error>),
    #[error("Received cancel signal")]
    Interrupted,
    #[error("Aborted by transfer list command")]
    Aborted,
    #[error("Progress record points at command #{index}, which does not match the transfer list")]
    RecordMismatch { index: usize },
    #[error("Command #{index} failed: {line:?}")]
    Command {
        index: usize,
        line: String,
        #[source]
        source: Box<Error>,
    },
    #[error("Source blocks hash to {actual}, but expected {expected}")]
    SourceHashMismatch { expected: String, actual: String },
    #[error("Patched blocks hash to {actual}, but expected {expected}")]
    TargetHashMismatch { expected: String, actual: String },
    #[error("Patch produced {actual} bytes, but the target ranges hold {expected}")]
    PatchSizeMismatch { expected: u64, actual: u64 },
    #[error("Failed to read new data stream")]
    NewDataSource(#[source] io::Error),
    #[error("New data stream ended with {missing} bytes still unwritten")]
    NewDataEnded { missing: u64 },
    #[error("No new data arrived within {timeout:?} with {missing} bytes still unwritten")]
    NewDataStalled { timeout: Duration, missing: u64 },
    #[error("Stash {id:?} is not currently held")]
    StashNotFound { id: String },
    #[error("Stash {id:?} content hashes to {actual}")]
    StashHashMismatch { id: String, actual: String },
    #[error("Stash {id:?} size {size} is not a multiple of the block size")]
    InvalidStashSize { id: String, size: u64 },
    #[error("Holding {count} stash entries would exceed the declared maximum of {max}")]
    StashEntryLimit { count: u64, max: u64 },
    #[error("Stashing {blocks} total blocks would exceed the declared maximum of {max}")]
    StashBlockLimit { blocks: u64, max: u64 },
    #[error("Hash tree has {tree} bytes, but its target ranges hold {ranges}")]
    HashTreeSize { tree: u64, ranges: u64 },
    #[error("Failed to apply bsdiff patch")]
    Bsdiff(#[from] bsdiff::Error),
    #[error("Failed to apply imgdiff patch")]
    Imgdiff(#[from] imgdiff::Error),
    #[error("Failed to compute hash tree")]
    HashTree(#[from] hashtree::Error),
    #[error("Failed to create directory: {0:?}")]
    DirCreate(PathBuf, #[source] io::Error),
    #[error("Failed to read directory: {0:?}")]
    DirRead(PathBuf, #[source] io::Error),
    #[error("Failed to sync directory: {0:?}")]
    DirSync(PathBuf, #[source] io::Error),
    #[error("Failed to read file: {0:?}")]
    FileRead(PathBuf, #[source] io::Error),
    #[error("Failed to write file: {0:?}")]
    FileWrite(PathBuf, #[source] io::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this failure invalidates the saved progress and stashes. A
    /// stale progress record or source blocks matching neither hash mean the
    /// on-disk state no longer corresponds to any point in the transfer list.
    fn unresumable(&self) -> bool {
        match self {
            Self::NotResumable(_)
            | Self::RecordMismatch { .. }
            | Self::SourceHashMismatch { .. } => true,
            Self::Command { source, .. } => source.unresumable(),
            _ => false,
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

const NEW_DATA_CHUNK_SIZE: usize = 65536;
const NEW_DATA_CHANNEL_DEPTH: usize = 4;

/// Tuning knobs for [`apply`].
#[derive(Clone, Debug)]
pub struct ApplyConfig {
    /// How long a `new` command waits for the next chunk of decoded data
    /// before declaring the producer stalled.
    pub starvation_timeout: Duration,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            starvation_timeout: Duration::from_secs(30),
        }
    }
}

fn sha1_hex(data: &[u8]) -> String {
    hex::encode(digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, data))
}

/// Read the blocks named by a range set into a packed buffer.
fn read_ranges(target: &dyn ReadWriteAt, ranges: &RangeSet) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; (ranges.blocks() * BLOCK_SIZE) as usize];
    let mut offset = 0;

    for range in ranges.iter() {
        let size = ((range.end - range.start) * BLOCK_SIZE) as usize;
        target.read_exact_at(&mut buf[offset..offset + size], range.start * BLOCK_SIZE)?;
        offset += size;
    }

    Ok(buf)
}

/// Write a packed buffer to the blocks named by a range set.
fn write_ranges(target: &dyn ReadWriteAt, ranges: &RangeSet, data: &[u8]) -> Result<()> {
    let mut offset = 0;

    for range in ranges.iter() {
        let size = ((range.end - range.start) * BLOCK_SIZE) as usize;
        target.write_all_at(&data[offset..offset + size], range.start * BLOCK_SIZE)?;
        offset += size;
    }

    Ok(())
}

/// Place packed blocks at the buffer locations named by a range set. `dest`
/// and `source` must be distinct buffers.
fn scatter_blocks(dest: &mut [u8], locations: &RangeSet, source: &[u8]) {
    let mut offset = 0;

    for range in locations.iter() {
        let size = ((range.end - range.start) * BLOCK_SIZE) as usize;
        let to = (range.start * BLOCK_SIZE) as usize;
        dest[to..to + size].copy_from_slice(&source[offset..offset + size]);
        offset += size;
    }
}

fn write_file_sync(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()
}

fn sync_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    File::open(path)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = path;

    Ok(())
}

/// Persisted progress marker: the index and exact text of the last fully
/// applied command, written atomically after the corresponding target writes
/// have been synced.
#[derive(Clone, Copy)]
struct ProgressRecord<'a> {
    path: &'a Path,
}

impl ProgressRecord<'_> {
    /// Load and validate the record against the current transfer list. A
    /// missing, unreadable, or malformed record is discarded. A well-formed
    /// record that does not literally match the command text at its index
    /// belongs to some other update and makes this one unresumable.
    fn load(&self, list: &TransferList) -> Result<Option<usize>> {
        let data = match fs::read_to_string(self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!("Discarding unreadable progress record {:?}: {e}", self.path);
                self.delete();
                return Ok(None);
            }
        };

        let parsed = data
            .trim()
            .split_once('\n')
            .filter(|(_, line)| !line.contains('\n'))
            .and_then(|(index, line)| Some((index.parse::<usize>().ok()?, line)));
        let Some((index, line)) = parsed else {
            warn!("Discarding malformed progress record {:?}", self.path);
            self.delete();
            return Ok(None);
        };

        match list.commands().get(index) {
            Some(entry) if entry.line == line => Ok(Some(index)),
            _ => Err(Error::RecordMismatch { index }),
        }
    }

    /// Persist a new record. Failures only degrade resumability, so they are
    /// logged instead of aborting the update.
    fn update(&self, index: usize, line: &str) {
        if let Err(e) = self.try_update(index, line) {
            warn!("Failed to persist progress record {:?}: {e}", self.path);
        }
    }

    fn try_update(&self, index: usize, line: &str) -> io::Result<()> {
        let mut tmp_os = self.path.as_os_str().to_owned();
        tmp_os.push(".tmp");
        let tmp_path = PathBuf::from(tmp_os);

        write_file_sync(&tmp_path, format!("{index}\n{line}").as_bytes())?;
        fs::rename(&tmp_path, self.path)?;
        sync_dir(util::parent_path(self.path))
    }

    fn delete(&self) {
        if let Err(e) = fs::remove_file(self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to delete progress record {:?}: {e}", self.path);
            }
        }
    }
}

/// On-disk stash directory plus in-memory accounting of which stash ids are
/// currently held. Files are named by the hex content hash of their data and
/// written atomically, so an interrupted run leaves either a valid stash or a
/// `.partial` file that gets cleaned up on the next open.
struct StashStore {
    dir: PathBuf,
    persist: bool,
    created_dir: bool,
    held: HashMap<String, u64>,
    source_ranges: HashMap<String, RangeSet>,
    held_blocks: u64,
    max_entries: u64,
    max_blocks: u64,
}

impl StashStore {
    fn open(dir: &Path, persist: bool, max_entries: u64, max_blocks: u64) -> Result<Self> {
        let mut created_dir = false;
        let mut held = HashMap::new();
        let mut held_blocks = 0;

        match fs::read_dir(dir) {
            Ok(iter) => {
                for entry in iter {
                    let entry = entry.map_err(|e| Error::DirRead(dir.to_owned(), e))?;
                    if !entry.file_type().is_ok_and(|t| t.is_file()) {
                        continue;
                    }

                    let path = entry.path();
                    if path.extension().is_some_and(|e| e == "partial") {
                        debug!("Deleting incomplete stash file {path:?}");
                        if let Err(e) = fs::remove_file(&path) {
                            warn!("Failed to delete {path:?}: {e}");
                        }
                        continue;
                    }

                    let Ok(name) = entry.file_name().into_string() else {
                        warn!("Ignoring unexpected stash file {path:?}");
                        continue;
                    };
                    let size = entry
                        .metadata()
                        .map_err(|e| Error::FileRead(path.clone(), e))?
                        .len();
                    let blocks = size / BLOCK_SIZE;

                    debug!("Found existing stash {name} with {blocks} blocks");
                    held.insert(name, blocks);
                    held_blocks += blocks;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(dir).map_err(|e| Error::DirCreate(dir.to_owned(), e))?;
                created_dir = true;
            }
            Err(e) => return Err(Error::DirRead(dir.to_owned(), e)),
        }

        Ok(Self {
            dir: dir.to_owned(),
            persist,
            created_dir,
            held,
            source_ranges: HashMap::new(),
            held_blocks,
            max_entries,
            max_blocks,
        })
    }

    fn file_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    /// Mark a stash id as held. The declared limits only apply to stashes
    /// the transfer list budgeted for, not to overlap stashes.
    fn hold(&mut self, id: &str, blocks: u64, enforce_limits: bool) -> Result<()> {
        if self.held.contains_key(id) {
            return Ok(());
        }

        if enforce_limits {
            let count = self.held.len() as u64 + 1;
            if count > self.max_entries {
                return Err(Error::StashEntryLimit {
                    count,
                    max: self.max_entries,
                });
            }

            let total = self.held_blocks + blocks;
            if total > self.max_blocks {
                return Err(Error::StashBlockLimit {
                    blocks: total,
                    max: self.max_blocks,
                });
            }
        }

        self.held.insert(id.to_owned(), blocks);
        self.held_blocks += blocks;

        Ok(())
    }

    /// Record the source ranges for a stash id so a read-only run can load
    /// the data from the image instead of a file.
    fn reserve(&mut self, id: &str, ranges: &RangeSet) -> Result<()> {
        self.source_ranges.insert(id.to_owned(), ranges.clone());
        self.hold(id, ranges.blocks(), true)
    }

    /// Write a stash file atomically. Returns true if a file with this id
    /// already existed. The id is the content hash, so an existing file is
    /// assumed to hold identical data.
    fn write(&mut self, id: &str, data: &[u8], enforce_limits: bool) -> Result<bool> {
        let blocks = data.len() as u64 / BLOCK_SIZE;
        let final_path = self.file_path(id);

        if final_path.exists() {
            self.hold(id, blocks, false)?;
            debug!("Skipping {blocks} existing blocks in {final_path:?}");
            return Ok(true);
        }

        self.hold(id, blocks, enforce_limits)?;

        let partial_path = self.dir.join(format!("{id}.partial"));
        write_file_sync(&partial_path, data)
            .map_err(|e| Error::FileWrite(partial_path.clone(), e))?;
        fs::rename(&partial_path, &final_path)
            .map_err(|e| Error::FileWrite(final_path.clone(), e))?;
        sync_dir(&self.dir).map_err(|e| Error::DirSync(self.dir.clone(), e))?;

        Ok(false)
    }

    /// Load a stash's data. A read-only run prefers re-reading the recorded
    /// source ranges from the image, since nothing was persisted.
    fn load(&self, target: &dyn ReadWriteAt, id: &str, verify: bool) -> Result<Vec<u8>> {
        if !self.persist {
            if let Some(ranges) = self.source_ranges.get(id) {
                let data = read_ranges(target, ranges)?;
                let actual = sha1_hex(&data);
                if actual != id {
                    return Err(Error::StashHashMismatch {
                        id: id.to_owned(),
                        actual,
                    });
                }
                return Ok(data);
            }
        }

        let path = self.file_path(id);
        let data = fs::read(&path).map_err(|e| Error::FileRead(path.clone(), e))?;

        if data.len() as u64 % BLOCK_SIZE != 0 {
            return Err(Error::InvalidStashSize {
                id: id.to_owned(),
                size: data.len() as u64,
            });
        }

        if verify {
            let actual = sha1_hex(&data);
            if actual != id {
                // The name is the content hash, so this file can never become
                // useful again.
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Failed to delete corrupt stash {path:?}: {e}");
                }
                return Err(Error::StashHashMismatch {
                    id: id.to_owned(),
                    actual,
                });
            }
        }

        Ok(data)
    }

    /// Release a held stash. Freeing an id that is not held is fatal, since
    /// it means the transfer list and the engine disagree about state.
    fn free(&mut self, id: &str) -> Result<()> {
        let Some(blocks) = self.held.remove(id) else {
            return Err(Error::StashNotFound { id: id.to_owned() });
        };

        self.held_blocks -= blocks;
        self.source_ranges.remove(id);

        if self.persist || self.created_dir {
            let path = self.file_path(id);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to delete stash file {path:?}: {e}");
                }
            }
        }

        Ok(())
    }

    /// Delete every stash file and then the directory itself. Leftovers are
    /// logged, not fatal.
    fn delete_all(&self) {
        debug!("Deleting stash directory {:?}", self.dir);

        let Ok(iter) = fs::read_dir(&self.dir) else {
            return;
        };

        for entry in iter.flatten() {
            if entry.file_type().is_ok_and(|t| t.is_file()) {
                let path = entry.path();
                if let Err(e) = fs::remove_file(&path) {
                    warn!("Failed to delete stash file {path:?}: {e}");
                }
            }
        }

        if let Err(e) = fs::remove_dir(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to delete stash directory {:?}: {e}", self.dir);
            }
        }
    }
}

/// Streams sequential bytes into the target at the positions given by a
/// range set.
struct RangeSink<'a> {
    target: &'a dyn ReadWriteAt,
    ranges: &'a RangeSet,
    range_index: usize,
    range_pos: u64,
    remaining: u64,
}

impl<'a> RangeSink<'a> {
    fn new(target: &'a dyn ReadWriteAt, ranges: &'a RangeSet) -> Self {
        Self {
            target,
            ranges,
            range_index: 0,
            range_pos: 0,
            remaining: ranges.blocks() * BLOCK_SIZE,
        }
    }

    fn missing(&self) -> u64 {
        self.remaining
    }

    fn finished(&self) -> bool {
        self.remaining == 0
    }

    /// Write as much of `data` as still fits. Returns the number of bytes
    /// consumed.
    fn fill(&mut self, data: &[u8]) -> Result<usize> {
        let mut consumed = 0;

        while consumed < data.len() && self.remaining > 0 {
            let range = &self.ranges.ranges()[self.range_index];
            let range_size = (range.end - range.start) * BLOCK_SIZE;
            let size = (range_size - self.range_pos).min((data.len() - consumed) as u64) as usize;
            let offset = range.start * BLOCK_SIZE + self.range_pos;

            self.target
                .write_all_at(&data[consumed..consumed + size], offset)?;

            consumed += size;
            self.range_pos += size as u64;
            self.remaining -= size as u64;

            if self.range_pos == range_size {
                self.range_index += 1;
                self.range_pos = 0;
            }
        }

        Ok(consumed)
    }
}

/// Consumer half of the new data channel. Chunks arrive in stream order and
/// leftovers carry over to the next `new` command.
struct NewDataFeed {
    rx: Receiver<io::Result<Vec<u8>>>,
    pending: Vec<u8>,
    pending_pos: usize,
    timeout: Duration,
}

impl NewDataFeed {
    fn new(rx: Receiver<io::Result<Vec<u8>>>, timeout: Duration) -> Self {
        Self {
            rx,
            pending: vec![],
            pending_pos: 0,
            timeout,
        }
    }

    /// Feed the sink until it has received its full share of the stream. The
    /// producer failing, stalling, or ending early are all distinct errors.
    fn write_to(&mut self, sink: &mut RangeSink) -> Result<()> {
        while !sink.finished() {
            if self.pending_pos < self.pending.len() {
                let n = sink.fill(&self.pending[self.pending_pos..])?;
                self.pending_pos += n;
                continue;
            }

            match self.rx.recv_timeout(self.timeout) {
                Ok(Ok(chunk)) => {
                    self.pending = chunk;
                    self.pending_pos = 0;
                }
                Ok(Err(e)) => return Err(Error::NewDataSource(e)),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(Error::NewDataStalled {
                        timeout: self.timeout,
                        missing: sink.missing(),
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::NewDataEnded {
                        missing: sink.missing(),
                    });
                }
            }
        }

        Ok(())
    }

    fn has_unused_data(&mut self) -> bool {
        self.pending_pos < self.pending.len() || self.rx.try_recv().is_ok()
    }
}

/// Producer half of the new data channel. Runs on its own thread; the
/// bounded channel provides backpressure against the consumer.
fn pump_new_data(mut reader: impl Read, tx: SyncSender<io::Result<Vec<u8>>>) {
    loop {
        let mut chunk = vec![0u8; NEW_DATA_CHUNK_SIZE];

        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                chunk.truncate(n);
                if tx.send(Ok(chunk)).is_err() {
                    // Consumer is gone.
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                let _ = tx.send(Err(e));
                break;
            }
        }
    }
}

enum SourceLoad {
    /// The target ranges already hash to the target digest; the command was
    /// completed by a previous run.
    AlreadyDone,
    Loaded(Vec<u8>),
}

struct Runner<'a> {
    list: &'a TransferList,
    target: &'a dyn ReadWriteAt,
    stash: &'a mut StashStore,
    record: ProgressRecord<'a>,
    feed: Option<NewDataFeed>,
    patch: Option<&'a mut dyn ReadSeek>,
    cancel_signal: &'a AtomicBool,
    write_mode: bool,
    resume_index: Option<usize>,
    wrote_any: bool,
    written: SortedRangeSet,
    free_after_write: Option<String>,
}

impl Runner<'_> {
    fn run(&mut self) -> Result<u64> {
        let list = self.list;

        for (index, entry) in list.commands().iter().enumerate() {
            if self.cancel_signal.load(Ordering::SeqCst) {
                return Err(Error::Interrupted);
            }

            // Writing commands have nothing to check in read-only mode.
            if !self.write_mode
                && matches!(
                    entry.command,
                    Command::Zero { .. } | Command::New { .. } | Command::ComputeHashTree { .. }
                )
            {
                debug!("Skipping command #{index} during verification: {:?}", entry.line);
                continue;
            }

            // `new` commands consume the data stream sequentially, so they
            // must run again even when resuming past them.
            if self.write_mode
                && self.resume_index.is_some_and(|resume| index <= resume)
                && !matches!(entry.command, Command::New { .. })
            {
                debug!("Skipping already applied command #{index}: {:?}", entry.line);
                continue;
            }

            let verified = self.execute(entry).map_err(|e| Error::Command {
                index,
                line: entry.line.clone(),
                source: Box::new(e),
            })?;

            if !self.write_mode
                && self.resume_index.is_some_and(|resume| index <= resume)
                && matches!(
                    entry.command,
                    Command::Move { .. } | Command::Bsdiff { .. } | Command::Imgdiff { .. }
                )
                && !verified
            {
                warn!("Command #{index} has not actually been applied; discarding stale record");
                self.record.delete();
                self.resume_index = None;
            }

            if self.write_mode {
                self.target.file_sync()?;
                self.record.update(index, &entry.line);
            }
        }

        Ok(self.written.blocks())
    }

    /// Run a single command. Returns whether the command's target was found
    /// to be already up to date (only ever true for move/bsdiff/imgdiff).
    fn execute(&mut self, entry: &CommandEntry) -> Result<bool> {
        match &entry.command {
            Command::Abort => Err(Error::Aborted),
            Command::Zero { target } => {
                self.zero(target)?;
                Ok(false)
            }
            Command::New { target } => {
                self.write_new(target)?;
                Ok(false)
            }
            Command::Move { target, source } => self.move_blocks(target, source),
            Command::Bsdiff {
                patch,
                target,
                source,
            } => self.patch_blocks(false, patch, target, source),
            Command::Imgdiff {
                patch,
                target,
                source,
            } => self.patch_blocks(true, patch, target, source),
            Command::Stash { id, ranges } => {
                self.stash_blocks(id, ranges)?;
                Ok(false)
            }
            Command::Free { id } => {
                self.stash.free(id)?;
                Ok(false)
            }
            Command::ComputeHashTree { info } => {
                self.hash_tree(info)?;
                Ok(false)
            }
        }
    }

    fn zero(&mut self, target: &RangeSet) -> Result<()> {
        debug!("Zeroing {} blocks", target.blocks());

        for range in target.iter() {
            let mut offset = range.start * BLOCK_SIZE;
            let end = range.end * BLOCK_SIZE;

            while offset < end {
                let size = (end - offset).min(util::ZEROS.len() as u64) as usize;
                self.target.write_all_at(&util::ZEROS[..size], offset)?;
                offset += size as u64;
            }
        }

        self.note_written(target);

        Ok(())
    }

    fn write_new(&mut self, target: &RangeSet) -> Result<()> {
        debug!("Writing {} blocks of new data", target.blocks());

        let mut sink = RangeSink::new(self.target, target);
        let Some(feed) = self.feed.as_mut() else {
            unreachable!("New data feed exists in write mode");
        };

        feed.write_to(&mut sink)?;

        self.note_written(target);

        Ok(())
    }

    fn move_blocks(&mut self, target: &TargetInfo, source: &SourceInfo) -> Result<bool> {
        let mut already_done = false;

        match self.load_source(target, source)? {
            SourceLoad::AlreadyDone => {
                self.note_already_done();
                already_done = true;
                debug!("Skipping {} already moved blocks", target.ranges.blocks());
            }
            SourceLoad::Loaded(buf) => {
                self.wrote_any = true;

                if self.write_mode {
                    debug!("Moving {} blocks", target.ranges.blocks());
                    write_ranges(self.target, &target.ranges, &buf)?;
                }
            }
        }

        self.finish_write()?;
        self.note_written(&target.ranges);

        Ok(already_done)
    }

    fn patch_blocks(
        &mut self,
        imgdiff: bool,
        patch: &PatchInfo,
        target: &TargetInfo,
        source: &SourceInfo,
    ) -> Result<bool> {
        let mut already_done = false;

        match self.load_source(target, source)? {
            SourceLoad::AlreadyDone => {
                self.note_already_done();
                already_done = true;
                debug!(
                    "Skipping {} blocks already patched to {}",
                    source.blocks(),
                    target.ranges.blocks(),
                );
            }
            SourceLoad::Loaded(buf) => {
                self.wrote_any = true;

                if self.write_mode {
                    debug!(
                        "Patching {} blocks to {}",
                        source.blocks(),
                        target.ranges.blocks(),
                    );

                    let patch_data = self.read_patch(patch)?;
                    let expected = target.ranges.blocks() * BLOCK_SIZE;
                    let mut output = Vec::with_capacity(expected as usize);

                    if imgdiff {
                        imgdiff::apply(&buf, &patch_data, None, &mut output, self.cancel_signal)?;
                    } else {
                        bsdiff::apply(&buf, &patch_data, &mut output, self.cancel_signal)?;
                    }

                    if output.len() as u64 != expected {
                        return Err(Error::PatchSizeMismatch {
                            expected,
                            actual: output.len() as u64,
                        });
                    }

                    let actual = sha1_hex(&output);
                    if actual != target.hash {
                        return Err(Error::TargetHashMismatch {
                            expected: target.hash.clone(),
                            actual,
                        });
                    }

                    write_ranges(self.target, &target.ranges, &output)?;
                }
            }
        }

        self.finish_write()?;
        self.note_written(&target.ranges);

        Ok(already_done)
    }

    fn stash_blocks(&mut self, id: &str, ranges: &RangeSet) -> Result<()> {
        // If the stash already exists with the right contents, don't touch
        // the source again. It may have been overwritten since it was first
        // saved.
        if self.stash.load(self.target, id, true).is_ok() {
            self.stash.hold(id, ranges.blocks(), false)?;
            return Ok(());
        }

        self.stash.reserve(id, ranges)?;

        let buf = read_ranges(self.target, ranges)?;
        let actual = sha1_hex(&buf);
        if actual != id {
            // Unexpected source contents. If this data is ever actually
            // needed, the consuming command fails its own source check.
            warn!("Source blocks for stash {id} hash to {actual}");
            return Ok(());
        }

        if self.write_mode {
            debug!("Stashing {} blocks to {id}", ranges.blocks());
            self.stash.write(id, &buf, false)?;
        }

        Ok(())
    }

    fn hash_tree(&mut self, info: &HashTreeInfo) -> Result<()> {
        debug!(
            "Computing {} hash tree over {} blocks",
            info.algorithm,
            info.source_ranges.blocks(),
        );

        let algorithm = hashtree::ring_algorithm(&info.algorithm)?;
        let source_data = read_ranges(self.target, &info.source_ranges)?;
        let tree = HashTree::new(BLOCK_SIZE as u32, algorithm, &info.salt).verify_root(
            &source_data,
            &info.root,
            self.cancel_signal,
        )?;

        let expected = info.tree_ranges.blocks() * BLOCK_SIZE;
        if tree.len() as u64 != expected {
            return Err(Error::HashTreeSize {
                tree: tree.len() as u64,
                ranges: expected,
            });
        }

        write_ranges(self.target, &info.tree_ranges, &tree)?;

        Ok(())
    }

    /// Check the target, then assemble and check the source, stashing it
    /// first if an in-place write could destroy it. Falls back to a
    /// previously stashed copy when recovering from an interrupted write.
    fn load_source(&mut self, target: &TargetInfo, source: &SourceInfo) -> Result<SourceLoad> {
        let target_data = read_ranges(self.target, &target.ranges)?;
        if sha1_hex(&target_data) == target.hash {
            return Ok(SourceLoad::AlreadyDone);
        }

        let buf = self.assemble_source(source)?;
        let actual = sha1_hex(&buf);

        if actual == source.hash {
            if self.write_mode && source.overlaps(target) {
                debug!(
                    "Stashing {} overlapping blocks to {}",
                    source.blocks(),
                    source.hash,
                );

                let existed = self.stash.write(&source.hash, &buf, false)?;
                if !existed {
                    self.free_after_write = Some(source.hash.clone());
                }
            }

            return Ok(SourceLoad::Loaded(buf));
        }

        if source.overlaps(target) {
            if let Ok(stashed) = self.stash.load(self.target, &source.hash, true) {
                // Recovering from an interrupted write. The stash may still
                // be needed, so it is not freed after this command.
                return Ok(SourceLoad::Loaded(stashed));
            }
        }

        Err(Error::SourceHashMismatch {
            expected: source.hash.clone(),
            actual,
        })
    }

    /// Build the source buffer from device ranges and stash references. A
    /// failed stash load leaves a hole; whether that matters is decided by
    /// the caller's hash check.
    fn assemble_source(&mut self, source: &SourceInfo) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; (source.blocks() * BLOCK_SIZE) as usize];

        if let Some(ranges) = &source.ranges {
            let data = read_ranges(self.target, ranges)?;

            if let Some(location) = &source.location {
                scatter_blocks(&mut buf, location, &data);
            } else {
                buf.copy_from_slice(&data);
            }
        }

        for stash in &source.stashes {
            match self.stash.load(self.target, &stash.id, false) {
                Ok(data) => {
                    let needed = (stash.ranges.blocks() * BLOCK_SIZE) as usize;
                    if data.len() < needed {
                        warn!(
                            "Stash {} has {} bytes, but {needed} are needed",
                            stash.id,
                            data.len(),
                        );
                        continue;
                    }

                    scatter_blocks(&mut buf, &stash.ranges, &data[..needed]);
                }
                Err(e) => {
                    warn!("Failed to load stash {}: {e}", stash.id);
                }
            }
        }

        Ok(buf)
    }

    fn read_patch(&mut self, info: &PatchInfo) -> Result<Vec<u8>> {
        let Some(stream) = self.patch.as_deref_mut() else {
            unreachable!("Patch stream exists in write mode");
        };

        stream.seek(SeekFrom::Start(info.offset))?;

        let mut data = vec![0u8; info.len as usize];
        stream.read_exact(&mut data)?;

        Ok(data)
    }

    /// Free the overlap stash once the write it protected has completed.
    fn finish_write(&mut self) -> Result<()> {
        if let Some(id) = self.free_after_write.take() {
            self.stash.free(&id)?;
        }

        Ok(())
    }

    fn note_already_done(&self) {
        if self.wrote_any {
            warn!("Commands executed out of order");
        }
    }

    /// Record target coverage for the completion summary. A valid list
    /// writes every target block exactly once, so the distinct-block count
    /// ends up equal to the declared total.
    fn note_written(&mut self, ranges: &RangeSet) {
        for range in ranges.iter() {
            self.written.insert(range.clone());
        }
    }
}

/// Apply a transfer list to the target, resuming from a previous interrupted
/// run when the saved progress record matches. `new_data` must yield the
/// decoded new data stream from its beginning even when resuming.
pub fn apply(
    list: &TransferList,
    target: &dyn ReadWriteAt,
    new_data: impl Read + Send,
    patch: &mut dyn ReadSeek,
    stash_dir: &Path,
    record_path: &Path,
    config: &ApplyConfig,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    info!(
        "Applying {} commands to write {} blocks",
        list.commands().len(),
        list.total_blocks(),
    );

    if list.total_blocks() == 0 {
        return Ok(());
    }

    let mut stash = StashStore::open(
        stash_dir,
        true,
        list.stash_max_entries(),
        list.stash_max_blocks(),
    )?;
    let record = ProgressRecord { path: record_path };

    let resume_index = match record.load(list) {
        Ok(index) => index,
        Err(e) => {
            record.delete();
            stash.delete_all();
            return Err(Error::NotResumable(Box::new(e)));
        }
    };
    if let Some(index) = resume_index {
        info!("Resuming update after command #{index}");
    }

    let result = thread::scope(|scope| {
        let (tx, rx) = mpsc::sync_channel(NEW_DATA_CHANNEL_DEPTH);
        scope.spawn(move || pump_new_data(new_data, tx));

        let mut runner = Runner {
            list,
            target,
            stash: &mut stash,
            record,
            feed: Some(NewDataFeed::new(rx, config.starvation_timeout)),
            patch: Some(patch),
            cancel_signal,
            write_mode: true,
            resume_index,
            wrote_any: false,
            written: SortedRangeSet::new(),
            free_after_write: None,
        };

        let result = runner.run();

        if result.is_ok() {
            if let Some(feed) = runner.feed.as_mut() {
                if feed.has_unused_data() {
                    warn!("New data stream still has data after the last command");
                }
            }
        }

        result
    });

    match result {
        Ok(written) => {
            info!("Wrote {written} blocks; expected {}", list.total_blocks());
            stash.delete_all();
            record.delete();
            Ok(())
        }
        Err(e) if e.unresumable() => {
            record.delete();
            stash.delete_all();
            Err(Error::NotResumable(Box::new(e)))
        }
        Err(e) => Err(e),
    }
}

/// Replay a transfer list read-only, checking that every move/patch command
/// either finds its target already up to date or can still load valid source
/// data. Success means the update is applied or can be safely resumed.
pub fn verify_applied(
    list: &TransferList,
    target: &dyn ReadWriteAt,
    stash_dir: &Path,
    record_path: &Path,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    info!("Verifying {} commands", list.commands().len());

    if list.total_blocks() == 0 {
        return Ok(());
    }

    let mut stash = StashStore::open(
        stash_dir,
        false,
        list.stash_max_entries(),
        list.stash_max_blocks(),
    )?;
    let record = ProgressRecord { path: record_path };

    let resume_index = match record.load(list) {
        Ok(index) => index,
        Err(e) => {
            record.delete();
            stash.delete_all();
            return Err(Error::NotResumable(Box::new(e)));
        }
    };

    let result = {
        let mut runner = Runner {
            list,
            target,
            stash: &mut stash,
            record,
            feed: None,
            patch: None,
            cancel_signal,
            write_mode: false,
            resume_index,
            wrote_any: false,
            written: SortedRangeSet::new(),
            free_after_write: None,
        };

        runner.run()
    };

    match result {
        Ok(_) => {
            if stash.created_dir {
                stash.delete_all();
            }
            info!("Verified target contents; the update can be applied or resumed");
            Ok(())
        }
        Err(e) if e.unresumable() => {
            record.delete();
            stash.delete_all();
            Err(Error::NotResumable(Box::new(e)))
        }
        Err(e) => {
            if stash.created_dir {
                stash.delete_all();
            }
            Err(e)
        }
    }
}
