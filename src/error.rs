use std::fmt::Display;

#[derive(Debug)]
pub enum Error {
    /// Underlying device failure
    Io(std::io::Error),
    /// Boot sector does not carry an exFAT signature
    NotExfat,
    /// Valid exFAT, but a revision or geometry this engine does not handle
    Unsupported,
    /// On-disk structures contradict each other
    Corrupted,
    /// A cluster chain leads outside the cluster heap
    InvalidCluster(u32),
    NotFound,
    Exists,
    NotDirectory,
    IsDirectory,
    NotEmpty,
    InvalidArgument,
    InvalidName,
    NameTooLong,
    NoSpace,
    ReadOnly,
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "{e}"),
            Self::NotExfat => write!(f, "exFAT file system is not found"),
            Self::Unsupported => write!(f, "unsupported exFAT volume"),
            Self::Corrupted => write!(f, "file system is corrupted"),
            Self::InvalidCluster(c) => write!(f, "invalid cluster {c:#x}"),
            Self::NotFound => write!(f, "no such file or directory"),
            Self::Exists => write!(f, "file exists"),
            Self::NotDirectory => write!(f, "not a directory"),
            Self::IsDirectory => write!(f, "is a directory"),
            Self::NotEmpty => write!(f, "directory not empty"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::InvalidName => write!(f, "invalid file name"),
            Self::NameTooLong => write!(f, "file name too long"),
            Self::NoSpace => write!(f, "no space left on device"),
            Self::ReadOnly => write!(f, "read-only file system"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Errno a frontend should reply with
impl From<Error> for libc::c_int {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::NotExfat | Error::Unsupported | Error::Corrupted => libc::EIO,
            Error::InvalidCluster(_) => libc::EIO,
            Error::NotFound | Error::InvalidName => libc::ENOENT,
            Error::Exists => libc::EEXIST,
            Error::NotDirectory => libc::ENOTDIR,
            Error::IsDirectory => libc::EISDIR,
            Error::NotEmpty => libc::ENOTEMPTY,
            Error::InvalidArgument => libc::EINVAL,
            Error::NameTooLong => libc::ENAMETOOLONG,
            Error::NoSpace => libc::ENOSPC,
            Error::ReadOnly => libc::EROFS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn errno_mapping() {
        assert_eq![libc::c_int::from(Error::NoSpace), libc::ENOSPC];
        assert_eq![libc::c_int::from(Error::InvalidName), libc::ENOENT];
        assert_eq![libc::c_int::from(Error::InvalidCluster(7)), libc::EIO];
        let io = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq![libc::c_int::from(Error::from(io)), libc::EACCES];
    }
}
