//! Generic file open with a substitute stream for failed reads.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::str::FromStr;

use thiserror::Error;

/// Access requested by a mode string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// `r`
    Read,
    /// `w`: create and truncate.
    Write,
    /// `a`: create and append.
    Append,
    /// `x`: create, failing if the file exists.
    CreateNew,
}

/// Parsed open mode: one of `r`/`w`/`a`/`x`, optionally `+`, optionally
/// `b` (binary) or `t` (text, the default).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode {
    pub access: Access,
    pub update: bool,
    pub binary: bool,
}

impl FileMode {
    pub const READ: Self = Self {
        access: Access::Read,
        update: false,
        binary: false,
    };
    pub const READ_BINARY: Self = Self {
        access: Access::Read,
        update: false,
        binary: true,
    };
    pub const WRITE: Self = Self {
        access: Access::Write,
        update: false,
        binary: false,
    };
    pub const WRITE_BINARY: Self = Self {
        access: Access::Write,
        update: false,
        binary: true,
    };

    /// Whether a failed open may be replaced by an empty stream.
    ///
    /// `r+` counts: it is primarily a read.
    #[must_use]
    pub fn is_read_mode(self) -> bool {
        self.access == Access::Read
    }

    fn options(self) -> OpenOptions {
        let mut options = OpenOptions::new();
        match self.access {
            Access::Read => {
                options.read(true).write(self.update);
            }
            Access::Write => {
                options.write(true).create(true).truncate(true).read(self.update);
            }
            Access::Append => {
                options.append(true).create(true).read(self.update);
            }
            Access::CreateNew => {
                options.write(true).create_new(true).read(self.update);
            }
        }
        options
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let access = match self.access {
            Access::Read => 'r',
            Access::Write => 'w',
            Access::Append => 'a',
            Access::CreateNew => 'x',
        };
        write!(f, "{access}")?;
        if self.update {
            write!(f, "+")?;
        }
        if self.binary {
            write!(f, "b")?;
        }
        Ok(())
    }
}

/// Rejected mode string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid file mode {mode:?}")]
pub struct FileModeParseError {
    mode: String,
}

impl FromStr for FileMode {
    type Err = FileModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FileModeParseError { mode: s.to_string() };
        let mut access = None;
        let mut update = false;
        let mut binary = None;

        for c in s.chars() {
            match c {
                'r' | 'w' | 'a' | 'x' if access.is_none() => {
                    access = Some(match c {
                        'r' => Access::Read,
                        'w' => Access::Write,
                        'a' => Access::Append,
                        _ => Access::CreateNew,
                    });
                }
                '+' if !update => update = true,
                'b' if binary.is_none() => binary = Some(true),
                't' if binary.is_none() => binary = Some(false),
                _ => return Err(invalid()),
            }
        }

        Ok(Self {
            access: access.ok_or_else(invalid)?,
            update,
            binary: binary.unwrap_or(false),
        })
    }
}

/// Stream handed out in place of a file whose read-mode open failed.
///
/// Reads hit end of stream immediately. Writes fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmptyStream {
    binary: bool,
}

impl EmptyStream {
    #[must_use]
    pub fn new(binary: bool) -> Self {
        Self { binary }
    }

    #[must_use]
    pub fn is_binary(&self) -> bool {
        self.binary
    }
}

impl Read for EmptyStream {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}

impl Write for EmptyStream {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "substitute stream is not writable",
        ))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Result of [`IoProvider::open`](super::IoProvider::open).
#[derive(Debug)]
pub enum OpenedFile {
    Disk(File),
    Substitute(EmptyStream),
}

impl OpenedFile {
    /// Whether the open failed and an empty stream was handed out instead.
    #[must_use]
    pub fn is_substitute(&self) -> bool {
        matches!(self, Self::Substitute(_))
    }
}

impl Read for OpenedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Disk(file) => file.read(buf),
            Self::Substitute(stream) => stream.read(buf),
        }
    }
}

impl Write for OpenedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Disk(file) => file.write(buf),
            Self::Substitute(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Disk(file) => file.flush(),
            Self::Substitute(stream) => stream.flush(),
        }
    }
}

/// Performs the actual open behind an [`IoProvider`](super::IoProvider).
pub trait FileOpener: Send + Sync + fmt::Debug {
    /// Opens `path` with `mode`.
    fn open(&self, path: &Path, mode: FileMode) -> io::Result<File>;
}

/// Opens files on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskOpener;

impl FileOpener for DiskOpener {
    fn open(&self, path: &Path, mode: FileMode) -> io::Result<File> {
        mode.options().open(path)
    }
}
