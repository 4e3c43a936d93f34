// SPDX-FileCopyrightText: 2024-2026 blockota contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

/// This is only needed because `dyn Read + Seek` is not a valid construct in
/// Rust yet.
pub trait ReadSeek: Read + Seek {
    // https://github.com/rust-lang/rust/issues/145752
    fn issue_145752(&self) {}
}

impl<R: Read + Seek> ReadSeek for R {}

/// Extensions for file-like types to query the file size. No guarantees are
/// made about the state of the underlying file position after performing any
/// operation.
pub trait FileLen {
    fn file_len(&self) -> io::Result<u64>;
}

macro_rules! file_len_blanket_impl {
    ($type:ty) => {
        impl<F: ?Sized + FileLen> FileLen for $type {
            fn file_len(&self) -> io::Result<u64> {
                (**self).file_len()
            }
        }
    };
}

file_len_blanket_impl!(&F);
file_len_blanket_impl!(Arc<F>);
file_len_blanket_impl!(Box<F>);

/// Extensions for file-like types that support reads at specific offsets. No
/// guarantees are made about the state of the underlying file position after
/// performing any operation.
pub trait ReadAt: FileLen {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let n = self.read_at(buf, offset)?;
        if n != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "Expected to read {} bytes at {offset}, but reached EOF after {n} bytes",
                    buf.len(),
                ),
            ));
        }
        Ok(())
    }
}

macro_rules! read_at_blanket_impl {
    ($type:ty) => {
        impl<R: ?Sized + ReadAt> ReadAt for $type {
            fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
                (**self).read_at(buf, offset)
            }

            fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
                (**self).read_exact_at(buf, offset)
            }
        }
    };
}

read_at_blanket_impl!(&R);
read_at_blanket_impl!(Arc<R>);
read_at_blanket_impl!(Box<R>);

/// Extensions for file-like types that support writes at specific offsets. The
/// behavior is unspecified if writes would overlap. No guarantees are made
/// about the state of the underlying file position after performing any
/// operation.
pub trait WriteAt: FileLen {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let n = self.write_at(buf, offset)?;
        if n != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "Expected to write {} bytes at {offset}, but reached EOF after {n} bytes",
                    buf.len(),
                ),
            ));
        }
        Ok(())
    }

    fn file_flush(&self) -> io::Result<()>;

    /// Flush buffered data and then synchronize it to persistent storage.
    /// Progress tracking is only allowed to advance past a write once this has
    /// returned successfully for it.
    fn file_sync(&self) -> io::Result<()>;
}

macro_rules! write_at_blanket_impl {
    ($type:ty) => {
        impl<W: ?Sized + WriteAt> WriteAt for $type {
            fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
                (**self).write_at(buf, offset)
            }

            fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
                (**self).write_all_at(buf, offset)
            }

            fn file_flush(&self) -> io::Result<()> {
                (**self).file_flush()
            }

            fn file_sync(&self) -> io::Result<()> {
                (**self).file_sync()
            }
        }
    };
}

write_at_blanket_impl!(&W);
write_at_blanket_impl!(Arc<W>);
write_at_blanket_impl!(Box<W>);

/// This is only needed because `dyn ReadAt + WriteAt` is not a valid construct
/// in Rust yet.
pub trait ReadWriteAt: ReadAt + WriteAt {
    // https://github.com/rust-lang/rust/issues/145752
    fn issue_145752(&self) {}
}

impl<F: ReadAt + WriteAt> ReadWriteAt for F {}

/// Regular files support parallel reads.
impl ReadAt for File {
    /// Read data from offset. The kernel's file position *will* be changed.
    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        FileExt::seek_read(self, buf, offset)
    }

    /// Read data from offset. The kernel's file position will *not* be changed.
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        FileExt::read_at(self, buf, offset)
    }
}

/// Regular files support parallel writes.
impl WriteAt for File {
    /// Write data to offset. The kernel's file position *will* be changed.
    #[cfg(windows)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        FileExt::seek_write(self, buf, offset)
    }

    /// Write data to offset. The kernel's file position will *not* be changed.
    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        FileExt::write_at(self, buf, offset)
    }

    fn file_flush(&self) -> io::Result<()> {
        (&*self).flush()
    }

    fn file_sync(&self) -> io::Result<()> {
        self.sync_data()
    }
}

impl FileLen for File {
    fn file_len(&self) -> io::Result<u64> {
        (&*self).seek(SeekFrom::End(0))
    }
}

/// A file wrapper that implements [`ReadAt`] and [`WriteAt`] on top of
/// [`Read`], [`Write`], and [`Seek`] via a mutex that makes operations
/// single-threaded.
pub struct MutexFile<F>(Mutex<F>);

impl<F> MutexFile<F> {
    pub fn new(file: F) -> Self {
        Self(Mutex::new(file))
    }

    pub fn into_inner(self) -> F {
        match self.0.into_inner() {
            Ok(f) => f,
            Err(e) => e.into_inner(),
        }
    }
}

impl<F: Seek> FileLen for MutexFile<F> {
    fn file_len(&self) -> io::Result<u64> {
        let mut inner = self.0.lock().map_err(|_| poisoned_error())?;
        inner.seek(SeekFrom::End(0))
    }
}

impl<F: Read + Seek> ReadAt for MutexFile<F> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut inner = self.0.lock().map_err(|_| poisoned_error())?;
        let pos = inner.stream_position()?;

        inner.seek(SeekFrom::Start(offset))?;

        let result = inner.read(buf);

        inner.seek(SeekFrom::Start(pos))?;

        result
    }
}

impl<F: Write + Seek> WriteAt for MutexFile<F> {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut inner = self.0.lock().map_err(|_| poisoned_error())?;
        let pos = inner.stream_position()?;

        inner.seek(SeekFrom::Start(offset))?;

        let result = inner.write(buf);

        inner.seek(SeekFrom::Start(pos))?;

        result
    }

    fn file_flush(&self) -> io::Result<()> {
        let mut inner = self.0.lock().map_err(|_| poisoned_error())?;
        inner.flush()
    }

    fn file_sync(&self) -> io::Result<()> {
        self.file_flush()
    }
}

fn poisoned_error() -> io::Error {
    io::Error::other("Mutex is poisoned")
}

/// Returns an I/O error with the [`io::ErrorKind::Interrupted`] type if
/// `cancel_signal` is true. This should be called frequently in I/O loops for
/// cancellation to be responsive.
#[inline]
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Received cancel signal",
        ));
    }

    Ok(())
}

/// Copy exactly `size` bytes from `reader` to `writer`, invoking `inspect`
/// after every buffer read iteration. If either `reader` or `writer` reaches
/// EOF before `size` bytes are copied, an error is returned. The operation is
/// cancelled on the next loop iteration if `cancel_signal` is set to `true`.
pub fn copy_n_inspect(
    mut reader: impl Read,
    mut writer: impl Write,
    mut size: u64,
    mut inspect: impl FnMut(&[u8]),
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    let mut buf = [0u8; 16384];

    while size > 0 {
        check_cancel(cancel_signal)?;

        let to_read = size.min(buf.len() as u64) as usize;
        reader.read_exact(&mut buf[..to_read])?;

        inspect(&buf[..to_read]);

        writer.write_all(&buf[..to_read])?;

        size -= to_read as u64;
    }

    Ok(())
}

/// Copy exactly `size` bytes from `reader` to `writer`.
pub fn copy_n(
    reader: impl Read,
    writer: impl Write,
    size: u64,
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    copy_n_inspect(reader, writer, size, |_| {}, cancel_signal)
}

/// Copy data from `reader` to `writer` until `reader` reaches EOF, invoking
/// `inspect` after every buffer read iteration. If `writer` reaches EOF before
/// `reader` does, an error is returned. The operation is cancelled on the next
/// loop iteration if `cancel_signal` is set to `true`.
pub fn copy_inspect(
    mut reader: impl Read,
    mut writer: impl Write,
    mut inspect: impl FnMut(&[u8]),
    cancel_signal: &AtomicBool,
) -> io::Result<u64> {
    let mut buf = [0u8; 16384];
    let mut copied = 0;

    loop {
        check_cancel(cancel_signal)?;

        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }

        inspect(&buf[..n]);

        writer.write_all(&buf[..n])?;

        copied += n as u64;
    }

    Ok(copied)
}

/// Copy data from `reader` to `writer` until `reader` reaches EOF.
pub fn copy(reader: impl Read, writer: impl Write, cancel_signal: &AtomicBool) -> io::Result<u64> {
    copy_inspect(reader, writer, |_| {}, cancel_signal)
}

#[cfg(test)]
mod tests {
    use std::{
        io::{self, Cursor, Seek, SeekFrom},
        sync::atomic::{AtomicBool, Ordering},
    };

    use ring::digest;

    use super::*;

    const FOOBAR_SHA256: [u8; 32] = [
        0xc3, 0xab, 0x8f, 0xf1, 0x37, 0x20, 0xe8, 0xad, 0x90, 0x47, 0xdd, 0x39, 0x46, 0x6b, 0x3c,
        0x89, 0x74, 0xe5, 0x92, 0xc2, 0xfa, 0x38, 0x3d, 0x4a, 0x39, 0x60, 0x71, 0x4c, 0xae, 0xf0,
        0xc4, 0xf2,
    ];

    #[test]
    fn mutex_file_read_write_at() {
        let file = MutexFile::new(Cursor::new(b"foobar".to_vec()));

        let mut buf = [0u8; 3];
        file.read_exact_at(&mut buf, 3).unwrap();
        assert_eq!(&buf, b"bar");

        file.write_all_at(b"BAZ", 0).unwrap();
        assert_eq!(file.file_len().unwrap(), 6);

        file.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"BAZ");

        // Writes past EOF extend the file.
        file.write_all_at(b"!", 6).unwrap();
        assert_eq!(file.file_len().unwrap(), 7);

        assert_eq!(file.into_inner().into_inner(), b"BAZbar!");
    }

    #[test]
    fn mutex_file_preserves_position() {
        let mut cursor = Cursor::new(b"foobar".to_vec());
        cursor.seek(SeekFrom::Start(4)).unwrap();

        let file = MutexFile::new(cursor);

        let mut buf = [0u8; 2];
        file.read_exact_at(&mut buf, 0).unwrap();

        assert_eq!(file.into_inner().stream_position().unwrap(), 4);
    }

    #[test]
    fn copy_n_with_inspection() {
        let cancel_signal = AtomicBool::new(false);

        let mut context = digest::Context::new(&digest::SHA256);
        let mut target = Cursor::new(Vec::new());

        copy_n_inspect(
            Cursor::new(b"foobar!!!"),
            &mut target,
            6,
            |data| context.update(data),
            &cancel_signal,
        )
        .unwrap();

        assert_eq!(target.into_inner(), b"foobar");
        assert_eq!(context.finish().as_ref(), FOOBAR_SHA256);
    }

    #[test]
    fn copy_cancelled() {
        let cancel_signal = AtomicBool::new(true);

        let result = copy(Cursor::new(b"foobar"), io::sink(), &cancel_signal);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::Interrupted);

        cancel_signal.store(false, Ordering::SeqCst);

        let n = copy(Cursor::new(b"foobar"), io::sink(), &cancel_signal).unwrap();
        assert_eq!(n, 6);
    }
}
