//! Scriptable stand-in for the C library.

use std::io;
use std::sync::Mutex;

use downloader_compat::probe::{HostPrimitives, MappedRegion, OpenFlags, SemHandle, ShmHandle};

/// Host whose calls all fail with `ENOSYS`, the way bionic's stubs do, and
/// which records every call it receives.
#[derive(Debug, Default)]
pub struct FakeHost {
    calls: Mutex<Vec<&'static str>>,
}

impl FakeHost {
    pub fn broken() -> Self {
        Self::default()
    }

    /// Calls received so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn enosys<T>(&self, call: &'static str) -> io::Result<T> {
        self.calls.lock().unwrap().push(call);
        Err(io::Error::from_raw_os_error(libc::ENOSYS))
    }
}

impl HostPrimitives for FakeHost {
    fn sem_open(&self, _: &str, _: OpenFlags, _: u32, _: u32) -> io::Result<SemHandle> {
        self.enosys("sem_open")
    }
    fn sem_wait(&self, _: &SemHandle) -> io::Result<()> {
        self.enosys("sem_wait")
    }
    fn sem_trywait(&self, _: &SemHandle) -> io::Result<()> {
        self.enosys("sem_trywait")
    }
    fn sem_post(&self, _: &SemHandle) -> io::Result<()> {
        self.enosys("sem_post")
    }
    fn sem_close(&self, _: SemHandle) -> io::Result<()> {
        self.enosys("sem_close")
    }
    fn sem_unlink(&self, _: &str) -> io::Result<()> {
        self.enosys("sem_unlink")
    }
    fn shm_open(&self, _: &str, _: OpenFlags, _: u32) -> io::Result<ShmHandle> {
        self.enosys("shm_open")
    }
    fn shm_resize(&self, _: &ShmHandle, _: usize) -> io::Result<()> {
        self.enosys("shm_resize")
    }
    fn shm_len(&self, _: &ShmHandle) -> io::Result<usize> {
        self.enosys("shm_len")
    }
    fn shm_map(&self, _: &ShmHandle, _: usize) -> io::Result<MappedRegion> {
        self.enosys("shm_map")
    }
    fn shm_close(&self, _: ShmHandle) -> io::Result<()> {
        self.enosys("shm_close")
    }
    fn shm_unlink(&self, _: &str) -> io::Result<()> {
        self.enosys("shm_unlink")
    }
    fn fork_and_reap(&self) -> io::Result<()> {
        self.enosys("fork")
    }
}
