//! Standard-input neutralizer.
//!
//! The host never supplies interactive input, and a prompt that waits for it
//! hangs forever. [`NullStdin`] is an input stream that is always at end of
//! stream: reads return nothing, it is never a terminal, it reports zero
//! bytes available, and iterating over its lines yields nothing.

use std::io::{self, BufRead, IsTerminal, Read};

use serde::Serialize;
use tracing::warn;

/// File descriptor reported by [`NullStdin::fileno`].
pub const STDIN_FILENO: i32 = 0;

/// Always-exhausted replacement for standard input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NullStdin;

impl NullStdin {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Bytes readable without blocking. Always 0.
    #[must_use]
    pub fn available(&self) -> usize {
        0
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        false
    }

    #[must_use]
    pub fn fileno(&self) -> i32 {
        STDIN_FILENO
    }

    #[must_use]
    pub fn encoding(&self) -> &'static str {
        "utf-8"
    }

    #[must_use]
    pub fn errors(&self) -> &'static str {
        "strict"
    }

    #[must_use]
    pub fn readable(&self) -> bool {
        true
    }

    #[must_use]
    pub fn seekable(&self) -> bool {
        false
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        false
    }

    #[must_use]
    pub fn closed(&self) -> bool {
        false
    }

    pub fn close(&self) {}
}

impl Read for NullStdin {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}

impl BufRead for NullStdin {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        Ok(&[])
    }

    fn consume(&mut self, _amt: usize) {}
}

impl IntoIterator for NullStdin {
    type Item = String;
    type IntoIter = std::iter::Empty<String>;

    fn into_iter(self) -> Self::IntoIter {
        std::iter::empty()
    }
}

/// Which input policy is in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StdinPolicy {
    Native,
    Neutralized,
}

/// Standard input as seen by downstream code.
#[derive(Debug)]
pub enum InputStream {
    Native(io::Stdin),
    Neutralized(NullStdin),
}

impl InputStream {
    /// Builds the stream for `policy`, logging once when neutralizing.
    #[must_use]
    pub fn for_policy(policy: StdinPolicy) -> Self {
        match policy {
            StdinPolicy::Native => Self::Native(io::stdin()),
            StdinPolicy::Neutralized => {
                warn!("standard input replaced with an always-empty stream");
                Self::Neutralized(NullStdin)
            }
        }
    }

    #[must_use]
    pub fn policy(&self) -> StdinPolicy {
        match self {
            Self::Native(_) => StdinPolicy::Native,
            Self::Neutralized(_) => StdinPolicy::Neutralized,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Native(stdin) => stdin.is_terminal(),
            Self::Neutralized(stdin) => stdin.is_terminal(),
        }
    }

    /// Reads one line into `buf`, returning the bytes read (0 at end of stream).
    ///
    /// # Errors
    ///
    /// Native standard input may fail; the neutralized stream never does.
    pub fn read_line(&mut self, buf: &mut String) -> io::Result<usize> {
        match self {
            Self::Native(stdin) => stdin.read_line(buf),
            Self::Neutralized(stdin) => stdin.read_line(buf),
        }
    }

    /// Remaining lines. Empty for the neutralized stream.
    pub fn lines(self) -> Box<dyn Iterator<Item = io::Result<String>>> {
        match self {
            Self::Native(stdin) => Box::new(stdin.lines()),
            Self::Neutralized(stdin) => Box::new(stdin.lines()),
        }
    }
}

impl Read for InputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Native(stdin) => stdin.read(buf),
            Self::Neutralized(stdin) => stdin.read(buf),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_null_stdin_reads_nothing() {
        let mut stdin = NullStdin::new();
        let mut buf = [0u8; 16];
        assert_eq!(stdin.read(&mut buf).unwrap(), 0);
        let mut line = String::new();
        assert_eq!(stdin.read_line(&mut line).unwrap(), 0);
        assert!(line.is_empty());
    }

    #[test]
    fn test_null_stdin_iterates_as_exhausted() {
        assert_eq!(NullStdin.into_iter().count(), 0);
        assert_eq!(NullStdin.lines().count(), 0);
    }

    #[test]
    fn test_null_stdin_reports_file_properties() {
        let stdin = NullStdin;
        assert!(!stdin.is_terminal());
        assert_eq!(stdin.available(), 0);
        assert_eq!(stdin.fileno(), 0);
        assert_eq!(stdin.encoding(), "utf-8");
        assert_eq!(stdin.errors(), "strict");
        assert!(stdin.readable());
        assert!(!stdin.seekable());
        assert!(!stdin.writable());
        stdin.close();
        assert!(!stdin.closed());
    }

    #[test]
    fn test_neutralized_input_stream() {
        let mut input = InputStream::for_policy(StdinPolicy::Neutralized);
        assert_eq!(input.policy(), StdinPolicy::Neutralized);
        assert!(!input.is_terminal());
        let mut line = String::new();
        assert_eq!(input.read_line(&mut line).unwrap(), 0);
        assert_eq!(input.lines().count(), 0);
    }
}
