//! I/O provider: socket `recv`/`send`, URL fetch and file open.
//!
//! [`NativeIo`] passes every call straight through. [`ResilientIo`] absorbs
//! the transient faults a restricted host produces:
//!
//! - `recv`/`send`: connection reset, broken pipe or unexpected end of
//!   stream yield `Ok(0)`, indistinguishable from a graceful peer close
//! - `open` in read mode: an OS-level fault or unexpected end of stream
//!   yields an empty substitute stream
//! - `open` in write mode under the same faults: re-raised as
//!   [`FaultClass::WriteFault`]
//! - `fetch`: classified and logged, always re-raised
//!
//! Anything else is [`FaultClass::Unexpected`] and re-raised unchanged.

mod error;
mod fetch;
mod file;
mod socket;

use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

pub use error::{FaultClass, FetchError, IoFault};
pub use fetch::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_READ_TIMEOUT_SECS, FetchClient, FetchResponse, USER_AGENT,
};
pub use file::{Access, DiskOpener, EmptyStream, FileMode, FileModeParseError, FileOpener, OpenedFile};
pub use socket::GuardedStream;

/// Classifies a socket fault: the stream faults are transient, the rest unexpected.
#[must_use]
pub fn classify_stream_fault(error: &io::Error) -> FaultClass {
    match error.kind() {
        io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => {
            FaultClass::Transient
        }
        _ => FaultClass::Unexpected,
    }
}

/// Classifies a failed open.
///
/// Unexpected end of stream and OS-level faults are anticipated: transient
/// for read modes, a write fault otherwise. Errors that did not come from the
/// OS (for example a path with an interior NUL) are unexpected.
#[must_use]
pub fn classify_open_fault(error: &io::Error, mode: FileMode) -> FaultClass {
    let anticipated =
        error.kind() == io::ErrorKind::UnexpectedEof || error.raw_os_error().is_some();
    match (anticipated, mode.is_read_mode()) {
        (true, true) => FaultClass::Transient,
        (true, false) => FaultClass::WriteFault,
        (false, _) => FaultClass::Unexpected,
    }
}

/// The intercepted I/O entry points.
#[async_trait]
pub trait IoProvider: Send + Sync + fmt::Debug {
    /// Short label for reports.
    fn name(&self) -> &'static str;

    /// Reads from a socket-like stream.
    ///
    /// # Errors
    ///
    /// Errors the provider does not absorb are returned unchanged.
    fn recv(&self, socket: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes to a socket-like stream, returning how many bytes were sent.
    ///
    /// # Errors
    ///
    /// Errors the provider does not absorb are returned unchanged.
    fn send(&self, socket: &mut dyn Write, data: &[u8]) -> io::Result<usize>;

    /// Opens `path` with `mode`.
    ///
    /// # Errors
    ///
    /// Returns the classified [`IoFault`] for failures the provider does not
    /// absorb.
    fn open(&self, path: &Path, mode: FileMode) -> Result<OpenedFile, IoFault>;

    /// Fetches `url`.
    ///
    /// # Errors
    ///
    /// Every fetch failure is returned.
    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError>;
}

/// Pass-through provider for unconstrained hosts.
#[derive(Debug, Clone)]
pub struct NativeIo {
    client: FetchClient,
    opener: Arc<dyn FileOpener>,
}

impl NativeIo {
    #[must_use]
    pub fn new(client: FetchClient) -> Self {
        Self {
            client,
            opener: Arc::new(DiskOpener),
        }
    }

    /// Opens files through `opener` instead of the local filesystem.
    #[must_use]
    pub fn with_opener(mut self, opener: Arc<dyn FileOpener>) -> Self {
        self.opener = opener;
        self
    }
}

#[async_trait]
impl IoProvider for NativeIo {
    fn name(&self) -> &'static str {
        "native"
    }

    fn recv(&self, socket: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
        socket.read(buf)
    }

    fn send(&self, socket: &mut dyn Write, data: &[u8]) -> io::Result<usize> {
        socket.write(data)
    }

    fn open(&self, path: &Path, mode: FileMode) -> Result<OpenedFile, IoFault> {
        self.opener
            .open(path, mode)
            .map(OpenedFile::Disk)
            .map_err(|source| {
                let class = classify_open_fault(&source, mode);
                IoFault::new(class, "open", path.display().to_string(), source)
            })
    }

    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        self.client.fetch(url).await
    }
}

/// Provider that absorbs transient faults.
#[derive(Debug, Clone)]
pub struct ResilientIo {
    client: FetchClient,
    opener: Arc<dyn FileOpener>,
}

impl ResilientIo {
    #[must_use]
    pub fn new(client: FetchClient) -> Self {
        Self {
            client,
            opener: Arc::new(DiskOpener),
        }
    }

    /// Opens files through `opener` instead of the local filesystem.
    #[must_use]
    pub fn with_opener(mut self, opener: Arc<dyn FileOpener>) -> Self {
        self.opener = opener;
        self
    }
}

#[async_trait]
impl IoProvider for ResilientIo {
    fn name(&self) -> &'static str {
        "resilient"
    }

    fn recv(&self, socket: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
        socket.read(buf).or_else(|error| match classify_stream_fault(&error) {
            FaultClass::Transient => {
                warn!(error = %error, "socket recv fault absorbed, returning empty read");
                Ok(0)
            }
            class => {
                warn!(%class, error = %error, "socket recv fault");
                Err(error)
            }
        })
    }

    fn send(&self, socket: &mut dyn Write, data: &[u8]) -> io::Result<usize> {
        socket.write(data).or_else(|error| match classify_stream_fault(&error) {
            FaultClass::Transient => {
                warn!(error = %error, bytes = data.len(), "socket send fault absorbed, reporting 0 bytes sent");
                Ok(0)
            }
            class => {
                warn!(%class, error = %error, "socket send fault");
                Err(error)
            }
        })
    }

    fn open(&self, path: &Path, mode: FileMode) -> Result<OpenedFile, IoFault> {
        let source = match self.opener.open(path, mode) {
            Ok(file) => return Ok(OpenedFile::Disk(file)),
            Err(source) => source,
        };
        let class = classify_open_fault(&source, mode);
        if class == FaultClass::Transient {
            warn!(
                path = %path.display(),
                %mode,
                error = %source,
                "file open fault absorbed, substituting empty stream"
            );
            return Ok(OpenedFile::Substitute(EmptyStream::new(mode.binary)));
        }
        warn!(path = %path.display(), %mode, %class, error = %source, "file open fault");
        Err(IoFault::new(class, "open", path.display().to_string(), source))
    }

    async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
        self.client.fetch(url).await.inspect_err(|error| {
            warn!(url, class = %error.class(), error = %error, "fetch fault, re-raising");
        })
    }
}

/// Selects the provider once at start-up.
///
/// # Errors
///
/// [`FetchError::Client`] if the HTTP client cannot be built.
pub fn provider(
    resilient: bool,
    connect_timeout_secs: u64,
    read_timeout_secs: u64,
) -> Result<Arc<dyn IoProvider>, FetchError> {
    let client = FetchClient::new(connect_timeout_secs, read_timeout_secs)?;
    let provider: Arc<dyn IoProvider> = if resilient {
        Arc::new(ResilientIo::new(client))
    } else {
        Arc::new(NativeIo::new(client))
    };
    debug!(provider = provider.name(), "I/O provider selected");
    Ok(provider)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    /// Stream whose every call fails with the given kind.
    struct Faulty(io::ErrorKind);

    impl Read for Faulty {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(self.0))
        }
    }

    impl Write for Faulty {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(self.0))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn resilient() -> ResilientIo {
        ResilientIo::new(FetchClient::new(1, 1).unwrap())
    }

    fn native() -> NativeIo {
        NativeIo::new(FetchClient::new(1, 1).unwrap())
    }

    #[test]
    fn test_classify_stream_fault() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::UnexpectedEof,
        ] {
            assert_eq!(classify_stream_fault(&io::Error::from(kind)), FaultClass::Transient);
        }
        assert_eq!(
            classify_stream_fault(&io::Error::from(io::ErrorKind::PermissionDenied)),
            FaultClass::Unexpected
        );
    }

    #[test]
    fn test_classify_open_fault_by_mode() {
        let os = io::Error::from_raw_os_error(libc::EIO);
        assert_eq!(classify_open_fault(&os, FileMode::READ), FaultClass::Transient);
        assert_eq!(classify_open_fault(&os, FileMode::WRITE), FaultClass::WriteFault);
        let eof = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert_eq!(classify_open_fault(&eof, FileMode::READ_BINARY), FaultClass::Transient);
        let other = io::Error::new(io::ErrorKind::InvalidInput, "bad path");
        assert_eq!(classify_open_fault(&other, FileMode::READ), FaultClass::Unexpected);
    }

    #[test]
    fn test_resilient_recv_absorbs_reset() {
        let mut buf = [0u8; 8];
        let n = resilient()
            .recv(&mut Faulty(io::ErrorKind::ConnectionReset), &mut buf)
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_resilient_send_absorbs_broken_pipe() {
        let n = resilient()
            .send(&mut Faulty(io::ErrorKind::BrokenPipe), b"payload")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_resilient_recv_reraises_unexpected() {
        let mut buf = [0u8; 8];
        let err = resilient()
            .recv(&mut Faulty(io::ErrorKind::PermissionDenied), &mut buf)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_native_recv_passes_faults_through() {
        let mut buf = [0u8; 8];
        let err = native()
            .recv(&mut Faulty(io::ErrorKind::ConnectionReset), &mut buf)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn test_resilient_open_missing_file_for_read_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = resilient()
            .open(&dir.path().join("missing.txt"), FileMode::READ)
            .unwrap();
        assert!(file.is_substitute());
        let mut text = String::new();
        assert_eq!(file.read_to_string(&mut text).unwrap(), 0);
    }

    #[test]
    fn test_resilient_open_for_write_in_missing_dir_reraises() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-such-dir").join("out.bin");
        let fault = resilient().open(&path, FileMode::WRITE_BINARY).unwrap_err();
        assert_eq!(fault.class, FaultClass::WriteFault);
        assert_eq!(fault.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_native_open_missing_file_reraises() {
        let dir = tempfile::tempdir().unwrap();
        let fault = native()
            .open(&dir.path().join("missing.txt"), FileMode::READ)
            .unwrap_err();
        assert_eq!(fault.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_guarded_stream_uses_provider() {
        let provider: Arc<dyn IoProvider> = Arc::new(resilient());
        let mut stream = GuardedStream::new(Faulty(io::ErrorKind::UnexpectedEof), provider);
        let mut buf = Vec::new();
        assert_eq!(stream.read_to_end(&mut buf).unwrap(), 0);
    }
}
