use std::fmt::Debug;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, error, warn};

use crate::Error;

/// Random-access storage holding a volume
pub trait BlockDevice: Read + Write + Seek + Debug {
    /// Make written data durable
    fn sync(&mut self) -> std::io::Result<()> {
        self.flush()
    }
}

impl BlockDevice for File {
    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_all()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    ReadOnly,
    #[default]
    ReadWrite,
    /// Read-write if possible, read-only otherwise
    Any,
}

/// Opened block device with its access mode and size
#[derive(Debug)]
pub struct Device {
    inner: Box<dyn BlockDevice>,
    mode: Mode,
    size: u64,
}

#[cfg(target_os = "linux")]
const BLKROGET: libc::c_ulong = 0x125E;

#[cfg(target_os = "linux")]
fn is_write_protected(file: &File) -> bool {
    use std::os::unix::io::AsRawFd;
    let mut ro: libc::c_int = 0;
    // kernel still allows read-write opens after "blockdev --setro" but fails writes
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKROGET as _, &mut ro) };
    rc == 0 && ro != 0
}

#[cfg(not(target_os = "linux"))]
fn is_write_protected(_file: &File) -> bool {
    false
}

fn open_rw(path: &Path) -> std::io::Result<File> {
    let file = File::options().read(true).write(true).open(path)?;
    if is_write_protected(&file) {
        return Err(std::io::Error::from_raw_os_error(libc::EROFS));
    }
    Ok(file)
}

fn open_ro(path: &Path) -> std::io::Result<File> {
    File::options().read(true).open(path)
}

#[cfg(unix)]
fn check_file_type(file: &File, path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::FileTypeExt;
    let kind = file.metadata()?.file_type();
    if kind.is_block_device() || kind.is_char_device() || kind.is_file() {
        Ok(())
    } else {
        error!("'{}' is neither a device, nor a regular file", path.display());
        Err(Error::InvalidArgument)
    }
}

#[cfg(not(unix))]
fn check_file_type(file: &File, path: &Path) -> Result<(), Error> {
    if file.metadata()?.is_file() {
        Ok(())
    } else {
        error!("'{}' is not a regular file", path.display());
        Err(Error::InvalidArgument)
    }
}

impl Device {
    /// Open a device or image file, [`Mode::Any`] falls back to read-only
    pub fn open(path: impl AsRef<Path>, mode: Mode) -> Result<Self, Error> {
        let path = path.as_ref();
        let (file, mode) = match mode {
            Mode::ReadOnly => (
                open_ro(path).map_err(|e| {
                    error!("Failed to open '{}' in read-only mode: {e}", path.display());
                    e
                })?,
                Mode::ReadOnly,
            ),
            Mode::ReadWrite => (
                open_rw(path).map_err(|e| {
                    error!("Failed to open '{}' in read-write mode: {e}", path.display());
                    e
                })?,
                Mode::ReadWrite,
            ),
            Mode::Any => match open_rw(path) {
                Ok(file) => (file, Mode::ReadWrite),
                Err(_) => {
                    let file = open_ro(path).map_err(|e| {
                        error!("Failed to open '{}': {e}", path.display());
                        e
                    })?;
                    warn!("'{}' is write-protected, mounting read-only", path.display());
                    (file, Mode::ReadOnly)
                }
            },
        };
        check_file_type(&file, path)?;
        Self::new(Box::new(file), mode)
    }

    /// Wrap an already opened device, [`Mode::Any`] is treated as read-write
    pub fn new(inner: Box<dyn BlockDevice>, mode: Mode) -> Result<Self, Error> {
        let mut inner = inner;
        let size = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        let mode = match mode {
            Mode::Any => Mode::ReadWrite,
            mode => mode,
        };
        debug!("Opened device of {size} bytes in {mode:?} mode");
        Ok(Self { inner, mode, size })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn seek(&mut self, offset: u64) -> Result<u64, Error> {
        Ok(self.inner.seek(SeekFrom::Start(offset))?)
    }

    /// Read at the current position
    pub fn read(&mut self, buffer: &mut [u8]) -> Result<usize, Error> {
        Ok(self.inner.read(buffer)?)
    }

    /// Write at the current position
    pub fn write(&mut self, buffer: &[u8]) -> Result<usize, Error> {
        if self.mode == Mode::ReadOnly {
            return Err(Error::ReadOnly);
        }
        Ok(self.inner.write(buffer)?)
    }

    /// Fill `buffer` from `offset`
    pub fn pread(&mut self, buffer: &mut [u8], offset: u64) -> Result<(), Error> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.read_exact(buffer)?;
        Ok(())
    }

    /// Write all of `buffer` at `offset`
    pub fn pwrite(&mut self, buffer: &[u8], offset: u64) -> Result<(), Error> {
        if self.mode == Mode::ReadOnly {
            return Err(Error::ReadOnly);
        }
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.write_all(buffer)?;
        Ok(())
    }

    pub fn fsync(&mut self) -> Result<(), Error> {
        if self.mode == Mode::ReadOnly {
            return Ok(());
        }
        self.inner.sync().map_err(|e| {
            error!("Fsync failed: {e}");
            Error::from(e)
        })
    }

    /// Flush pending writes and release the underlying device
    pub fn close(mut self) -> Result<Box<dyn BlockDevice>, Error> {
        self.fsync()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn positional_io() {
        let mut device = Device::new(Box::new(Cursor::new(vec![0u8; 4096])), Mode::Any).unwrap();
        assert_eq![device.mode(), Mode::ReadWrite];
        assert_eq![device.size(), 4096];
        device.pwrite(b"exfat", 1000).unwrap();
        let mut buffer = [0u8; 5];
        device.pread(&mut buffer, 1000).unwrap();
        assert_eq![&buffer, b"exfat"];
        device.seek(1001).unwrap();
        assert_eq![device.read(&mut buffer[..2]).unwrap(), 2];
        assert_eq![&buffer[..2], b"xf"];
        assert![device.pread(&mut buffer, 4094).is_err()];
    }

    #[test]
    fn read_only_refuses_writes() {
        let mut device =
            Device::new(Box::new(Cursor::new(vec![0u8; 512])), Mode::ReadOnly).unwrap();
        assert![matches![device.pwrite(&[1], 0), Err(Error::ReadOnly)]];
        assert![matches![device.write(&[1]), Err(Error::ReadOnly)]];
        assert![device.fsync().is_ok()];
    }

    #[test]
    fn open_image_file() {
        let path = std::env::temp_dir().join(format!("exfat-device-{}", std::process::id()));
        std::fs::write(&path, vec![0u8; 1024]).unwrap();
        let device = Device::open(&path, Mode::Any).unwrap();
        assert_eq![device.size(), 1024];
        assert![device.close().is_ok()];
        let device = Device::open(&path, Mode::ReadOnly).unwrap();
        assert_eq![device.mode(), Mode::ReadOnly];
        std::fs::remove_file(&path).unwrap();
        assert![Device::open(&path, Mode::ReadOnly).is_err()];
    }
}
