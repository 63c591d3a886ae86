//! Exported resources: the [`Blocks`] abstraction over byte-addressable
//! backing objects, the [`Export`] descriptor, and the [`Registry`] consulted
//! during option negotiation.

#![deny(missing_docs)]
use color_eyre::eyre::{bail, ensure, WrapErr};
use color_eyre::Result;

use std::fs::File;
use std::io;
use std::os::unix::fs::{FileExt, FileTypeExt};
use std::sync::Mutex;

use crate::proto::{ProtocolError, TransmitFlags};

/// Reserved export name, resolved when a client requests the empty name.
pub const DEFAULT_EXPORT: &str = "default";

/// Blocks is a byte array that can be exported by this server, with a basic
/// read/write API that works on arbitrary offsets.
///
/// Blocks is implemented for unix files (using the underlying `pread` and
/// `pwrite` system calls, so connections sharing a handle never contend on
/// seek state) and for `Mutex<Vec<u8>>` for exporting an in-memory byte
/// array.
pub trait Blocks {
    /// Fill buf starting from off (reading `buf.len()` bytes)
    fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<()>;

    /// Write data from buf to self starting at off (writing `buf.len()` bytes)
    fn write_at(&self, buf: &[u8], off: u64) -> io::Result<()>;

    /// Get the size of this array (in bytes)
    fn size(&self) -> io::Result<u64>;
}

#[cfg(target_os = "linux")]
mod blkdev {
    //! Size query for block devices, where file metadata reports zero.

    use std::fs::File;
    use std::io;
    use std::os::unix::prelude::AsRawFd;

    use nix::ioctl_read;

    // BLKGETSIZE64 from <linux/fs.h>
    ioctl_read!(blkgetsize64, 0x12, 114, u64);

    pub fn size(f: &File) -> io::Result<u64> {
        let mut bytes: u64 = 0;
        unsafe { blkgetsize64(f.as_raw_fd(), &mut bytes)? };
        Ok(bytes)
    }
}

impl Blocks for File {
    fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<()> {
        FileExt::read_exact_at(self, buf, off)
    }

    fn write_at(&self, buf: &[u8], off: u64) -> io::Result<()> {
        FileExt::write_all_at(self, buf, off)
    }

    fn size(&self) -> io::Result<u64> {
        let meta = self.metadata()?;
        #[cfg(target_os = "linux")]
        if meta.file_type().is_block_device() {
            return blkdev::size(self);
        }
        Ok(meta.len())
    }
}

/// MemBlocks is a convenience for an in-memory implementation of Blocks using
/// an array of bytes.
pub type MemBlocks = Mutex<Vec<u8>>;

fn poisoned(_: impl std::error::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, "poisoned lock")
}

impl Blocks for MemBlocks {
    fn read_at(&self, buf: &mut [u8], off: u64) -> io::Result<()> {
        let data = self.lock().map_err(poisoned)?;
        let off = off as usize;
        if off + buf.len() > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "out-of-bounds read",
            ));
        }
        buf.copy_from_slice(&data[off..off + buf.len()]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], off: u64) -> io::Result<()> {
        let mut data = self.lock().map_err(poisoned)?;
        let off = off as usize;
        if off + buf.len() > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "out-of-bounds write",
            ));
        }
        data[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.lock().map_err(poisoned)?.len() as u64)
    }
}

/// A resource exported as a block device: a [`Blocks`] object plus the name,
/// size, and write policy advertised during negotiation.
#[derive(Debug)]
pub struct Export<F> {
    name: String,
    file: F,
    size: u64,
    read_only: bool,
}

impl<F: Blocks> Export<F> {
    /// Describe `file` for export under `name`.
    ///
    /// The backing size is queried once here and fixed for the lifetime of
    /// the export. Empty resources and names that cannot go on the wire are
    /// rejected.
    pub fn new<S: Into<String>>(name: S, file: F, read_only: bool) -> Result<Self> {
        let name = name.into();
        ensure!(
            !name.is_empty() && name.len() <= 255,
            "export name must be between 1 and 255 bytes: {name:?}"
        );
        ensure!(
            !name.as_bytes().contains(&0),
            "export name must not contain NUL: {name:?}"
        );
        let size = file
            .size()
            .wrap_err_with(|| format!("sizing export {name:?}"))?;
        ensure!(size > 0, "refusing to export zero-length resource {name:?}");
        Ok(Self {
            name,
            file,
            size,
            read_only,
        })
    }

    /// The name clients select this export by.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the backing object in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// True if writes to this export are refused.
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn transmit_flags(&self) -> TransmitFlags {
        let mut flags = TransmitFlags::HAS_FLAGS;
        if self.read_only {
            flags |= TransmitFlags::READ_ONLY;
        }
        flags
    }

    // Translate a request offset to a backing offset, wrapping modulo the
    // export size. The transfer must lie entirely within the export.
    fn translate(&self, off: u64, len: usize) -> Result<u64> {
        let off = off % self.size;
        ensure!(
            len as u64 <= self.size - off,
            ProtocolError::new(format!(
                "request for {len} bytes at {off} runs past the end of a {}-byte export",
                self.size
            ))
        );
        Ok(off)
    }

    pub(crate) fn read(&self, off: u64, buf: &mut [u8]) -> Result<()> {
        let off = self.translate(off, buf.len())?;
        self.file
            .read_at(buf, off)
            .wrap_err_with(|| format!("reading {} bytes at {off}", buf.len()))?;
        Ok(())
    }

    pub(crate) fn write(&self, off: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            bail!(ProtocolError::new(format!(
                "write to read-only export {:?}",
                self.name
            )));
        }
        let off = self.translate(off, data.len())?;
        self.file
            .write_at(data, off)
            .wrap_err_with(|| format!("writing {} bytes at {off}", data.len()))?;
        Ok(())
    }
}

/// Immutable mapping from export name to descriptor, shared by reference
/// with every connection.
#[derive(Debug)]
pub struct Registry<F> {
    exports: Vec<Export<F>>,
}

impl<F: Blocks> Registry<F> {
    /// Build a registry from `exports`, rejecting duplicate names. LIST
    /// replies preserve the order given here.
    pub fn from_exports(exports: Vec<Export<F>>) -> Result<Self> {
        for (i, export) in exports.iter().enumerate() {
            ensure!(
                !exports[..i].iter().any(|e| e.name() == export.name()),
                "duplicate export name {:?}",
                export.name()
            );
        }
        Ok(Self { exports })
    }

    /// Exact-match, case-sensitive lookup.
    pub fn lookup(&self, name: &str) -> Option<&Export<F>> {
        self.exports.iter().find(|e| e.name() == name)
    }

    /// Export names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.exports.iter().map(|e| e.name())
    }
}
