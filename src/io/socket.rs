use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use super::IoProvider;

/// A byte stream whose reads and writes go through an [`IoProvider`].
///
/// Wrap a `TcpStream` (or anything `Read + Write`) to get the provider's
/// `recv`/`send` behaviour through the standard traits.
pub struct GuardedStream<S> {
    inner: S,
    provider: Arc<dyn IoProvider>,
}

impl<S> GuardedStream<S> {
    pub fn new(inner: S, provider: Arc<dyn IoProvider>) -> Self {
        Self { inner, provider }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: fmt::Debug> fmt::Debug for GuardedStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardedStream")
            .field("inner", &self.inner)
            .field("provider", &self.provider.name())
            .finish()
    }
}

impl<S: Read> Read for GuardedStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.provider.recv(&mut self.inner, buf)
    }
}

impl<S: Write> Write for GuardedStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.provider.send(&mut self.inner, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
