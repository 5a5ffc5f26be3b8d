//! Host primitive seam.
//!
//! Everything that touches POSIX semaphores, shared memory objects or
//! `fork` goes through [`HostPrimitives`]. The prober, the native named
//! semaphores and native shared memory all take an implementation of this
//! trait, which lets tests stand in a host whose `sem_open` is broken.

use std::io;

/// Flags accepted by [`HostPrimitives::sem_open`] and [`HostPrimitives::shm_open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    /// Create the object if it does not exist (`O_CREAT`).
    pub create: bool,
    /// Fail if the object already exists (`O_EXCL`, only meaningful with `create`).
    pub exclusive: bool,
}

impl OpenFlags {
    /// Open an existing object.
    pub const EXISTING: Self = Self {
        create: false,
        exclusive: false,
    };

    /// `O_CREAT`.
    pub const CREATE: Self = Self {
        create: true,
        exclusive: false,
    };

    /// `O_CREAT | O_EXCL`.
    pub const CREATE_EXCLUSIVE: Self = Self {
        create: true,
        exclusive: true,
    };

    #[cfg(unix)]
    fn bits(self) -> libc::c_int {
        let mut bits = 0;
        if self.create {
            bits |= libc::O_CREAT;
        }
        if self.exclusive {
            bits |= libc::O_EXCL;
        }
        bits
    }
}

/// Handle value, tagged with the host that issued it.
#[derive(Debug, PartialEq, Eq)]
enum Raw<T> {
    /// Issued by another [`HostPrimitives`] implementation; never dereferenced here.
    Token(T),
    /// A live `sem_t*` or descriptor issued by [`LibcHost`].
    Libc(T),
}

/// Handle to an opened named semaphore.
///
/// Only [`LibcHost`] can issue handles it will pass to the C library. Other
/// hosts wrap their own values with [`SemHandle::token`]; `LibcHost` refuses
/// those with `InvalidInput`.
#[derive(Debug, PartialEq, Eq)]
pub struct SemHandle(Raw<usize>);

impl SemHandle {
    /// Wraps a value chosen by a host other than [`LibcHost`].
    #[must_use]
    pub fn token(value: usize) -> Self {
        Self(Raw::Token(value))
    }

    /// The wrapped value, if this handle was created with [`SemHandle::token`].
    #[must_use]
    pub fn as_token(&self) -> Option<usize> {
        match self.0 {
            Raw::Token(value) => Some(value),
            Raw::Libc(_) => None,
        }
    }
}

/// Handle to an opened shared memory object. Issued the same way as [`SemHandle`].
#[derive(Debug, PartialEq, Eq)]
pub struct ShmHandle(Raw<i32>);

impl ShmHandle {
    /// Wraps a value chosen by a host other than [`LibcHost`].
    #[must_use]
    pub fn token(value: i32) -> Self {
        Self(Raw::Token(value))
    }

    /// The wrapped value, if this handle was created with [`ShmHandle::token`].
    #[must_use]
    pub fn as_token(&self) -> Option<i32> {
        match self.0 {
            Raw::Token(value) => Some(value),
            Raw::Libc(_) => None,
        }
    }
}

#[cfg(unix)]
fn foreign_handle() -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        "handle was not issued by the C library host",
    )
}

/// A read/write mapping of a shared memory object. Unmapped on drop.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is exclusively owned by this value; all access goes
// through `&self`/`&mut self` borrows, so the usual aliasing rules apply.
unsafe impl Send for MappedRegion {}
// SAFETY: shared access only hands out `&[u8]`.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Length of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping is zero-length.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The mapped bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: `ptr` is a live mapping of exactly `len` bytes owned by self.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// The mapped bytes, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.len == 0 {
            return &mut [];
        }
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if self.len > 0 {
            unmap(self.ptr, self.len);
        }
    }
}

#[cfg(unix)]
fn unmap(ptr: *mut u8, len: usize) {
    // SAFETY: `ptr`/`len` came from a successful mmap and are unmapped once.
    unsafe {
        libc::munmap(ptr.cast(), len);
    }
}

#[cfg(not(unix))]
fn unmap(_ptr: *mut u8, _len: usize) {}

/// OS-level primitives the compatibility layer probes and, when they work, uses.
pub trait HostPrimitives: Send + Sync + std::fmt::Debug {
    /// `sem_open(name, flags, mode, value)`.
    fn sem_open(&self, name: &str, flags: OpenFlags, mode: u32, value: u32)
    -> io::Result<SemHandle>;
    /// `sem_wait`; blocks until the count is positive.
    fn sem_wait(&self, sem: &SemHandle) -> io::Result<()>;
    /// `sem_trywait`; fails with `WouldBlock` when the count is zero.
    fn sem_trywait(&self, sem: &SemHandle) -> io::Result<()>;
    /// `sem_post`.
    fn sem_post(&self, sem: &SemHandle) -> io::Result<()>;
    /// `sem_close`.
    fn sem_close(&self, sem: SemHandle) -> io::Result<()>;
    /// `sem_unlink`.
    fn sem_unlink(&self, name: &str) -> io::Result<()>;

    /// `shm_open(name, O_RDWR | flags, mode)`.
    fn shm_open(&self, name: &str, flags: OpenFlags, mode: u32) -> io::Result<ShmHandle>;
    /// `ftruncate` the object to `len` bytes.
    fn shm_resize(&self, shm: &ShmHandle, len: usize) -> io::Result<()>;
    /// Current size of the object (`fstat`).
    fn shm_len(&self, shm: &ShmHandle) -> io::Result<usize>;
    /// Map `len` bytes of the object read/write, shared.
    fn shm_map(&self, shm: &ShmHandle, len: usize) -> io::Result<MappedRegion>;
    /// Close the descriptor.
    fn shm_close(&self, shm: ShmHandle) -> io::Result<()>;
    /// `shm_unlink`.
    fn shm_unlink(&self, name: &str) -> io::Result<()>;

    /// Fork a child that exits immediately and reap it.
    fn fork_and_reap(&self) -> io::Result<()>;
}

/// [`HostPrimitives`] backed by the C library.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcHost;

#[cfg(unix)]
fn c_name(name: &str) -> io::Result<std::ffi::CString> {
    std::ffi::CString::new(name).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("name contains an interior NUL byte: {name:?}"),
        )
    })
}

#[cfg(unix)]
fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(unix)]
fn sem_ptr(sem: &SemHandle) -> io::Result<*mut libc::sem_t> {
    match sem.0 {
        Raw::Libc(ptr) => Ok(ptr as *mut libc::sem_t),
        Raw::Token(_) => Err(foreign_handle()),
    }
}

#[cfg(unix)]
fn shm_fd(shm: &ShmHandle) -> io::Result<libc::c_int> {
    match shm.0 {
        Raw::Libc(fd) => Ok(fd),
        Raw::Token(_) => Err(foreign_handle()),
    }
}

#[cfg(all(unix, not(target_os = "android"), any(target_os = "linux", target_os = "freebsd")))]
fn raw_shm_open(name: &std::ffi::CStr, oflag: libc::c_int, mode: u32) -> io::Result<libc::c_int> {
    // SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
    let fd = unsafe { libc::shm_open(name.as_ptr(), oflag, mode as libc::mode_t) };
    if fd == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd)
    }
}

#[cfg(all(
    unix,
    not(target_os = "android"),
    not(any(target_os = "linux", target_os = "freebsd"))
))]
fn raw_shm_open(name: &std::ffi::CStr, oflag: libc::c_int, mode: u32) -> io::Result<libc::c_int> {
    // SAFETY: as above; the variadic mode argument is passed promoted to c_uint.
    let fd = unsafe { libc::shm_open(name.as_ptr(), oflag, mode as libc::c_uint) };
    if fd == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd)
    }
}

#[cfg(target_os = "android")]
fn raw_shm_open(_name: &std::ffi::CStr, _oflag: libc::c_int, _mode: u32) -> io::Result<libc::c_int> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "shm_open is not provided by bionic",
    ))
}

#[cfg(unix)]
impl HostPrimitives for LibcHost {
    fn sem_open(
        &self,
        name: &str,
        flags: OpenFlags,
        mode: u32,
        value: u32,
    ) -> io::Result<SemHandle> {
        let name = c_name(name)?;
        // SAFETY: valid C string; mode and value are passed as c_uint per the
        // variadic calling convention.
        let sem = unsafe {
            libc::sem_open(
                name.as_ptr(),
                flags.bits(),
                mode as libc::c_uint,
                value as libc::c_uint,
            )
        };
        if sem.is_null() || sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(SemHandle(Raw::Libc(sem as usize)))
    }

    fn sem_wait(&self, sem: &SemHandle) -> io::Result<()> {
        let ptr = sem_ptr(sem)?;
        loop {
            // SAFETY: `Raw::Libc` handles only come from a successful sem_open
            // and are consumed by sem_close.
            match check(unsafe { libc::sem_wait(ptr) }) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                other => return other,
            }
        }
    }

    fn sem_trywait(&self, sem: &SemHandle) -> io::Result<()> {
        let ptr = sem_ptr(sem)?;
        // SAFETY: as above.
        check(unsafe { libc::sem_trywait(ptr) })
    }

    fn sem_post(&self, sem: &SemHandle) -> io::Result<()> {
        let ptr = sem_ptr(sem)?;
        // SAFETY: as above.
        check(unsafe { libc::sem_post(ptr) })
    }

    fn sem_close(&self, sem: SemHandle) -> io::Result<()> {
        let ptr = sem_ptr(&sem)?;
        // SAFETY: the handle is consumed, so it is closed at most once.
        check(unsafe { libc::sem_close(ptr) })
    }

    fn sem_unlink(&self, name: &str) -> io::Result<()> {
        let name = c_name(name)?;
        // SAFETY: valid C string.
        check(unsafe { libc::sem_unlink(name.as_ptr()) })
    }

    fn shm_open(&self, name: &str, flags: OpenFlags, mode: u32) -> io::Result<ShmHandle> {
        let name = c_name(name)?;
        raw_shm_open(&name, libc::O_RDWR | flags.bits(), mode).map(|fd| ShmHandle(Raw::Libc(fd)))
    }

    fn shm_resize(&self, shm: &ShmHandle, len: usize) -> io::Result<()> {
        let len = libc::off_t::try_from(len).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "shared memory size too large")
        })?;
        let fd = shm_fd(shm)?;
        // SAFETY: plain syscall on a descriptor this host opened.
        check(unsafe { libc::ftruncate(fd, len) })
    }

    fn shm_len(&self, shm: &ShmHandle) -> io::Result<usize> {
        let fd = shm_fd(shm)?;
        // SAFETY: zeroed stat is a valid out-parameter for fstat.
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: `stat` is a valid, writable out-parameter.
        check(unsafe { libc::fstat(fd, &mut stat) })?;
        usize::try_from(stat.st_size)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "negative object size"))
    }

    fn shm_map(&self, shm: &ShmHandle, len: usize) -> io::Result<MappedRegion> {
        let fd = shm_fd(shm)?;
        if len == 0 {
            return Ok(MappedRegion {
                ptr: std::ptr::null_mut(),
                len: 0,
            });
        }
        // SAFETY: mapping a descriptor we own; the result is checked below.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(MappedRegion {
            ptr: ptr.cast(),
            len,
        })
    }

    fn shm_close(&self, shm: ShmHandle) -> io::Result<()> {
        let fd = shm_fd(&shm)?;
        // SAFETY: the handle is consumed, so the descriptor is closed once.
        check(unsafe { libc::close(fd) })
    }

    fn shm_unlink(&self, name: &str) -> io::Result<()> {
        #[cfg(target_os = "android")]
        {
            let _ = name;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "shm_unlink is not provided by bionic",
            ))
        }
        #[cfg(not(target_os = "android"))]
        {
            let name = c_name(name)?;
            // SAFETY: valid C string.
            check(unsafe { libc::shm_unlink(name.as_ptr()) })
        }
    }

    fn fork_and_reap(&self) -> io::Result<()> {
        // SAFETY: the child only calls the async-signal-safe `_exit`.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(io::Error::last_os_error()),
            0 => {
                // SAFETY: terminate the child without running destructors or atexit hooks.
                unsafe { libc::_exit(0) }
            }
            child => {
                let mut status: libc::c_int = 0;
                loop {
                    // SAFETY: `status` is a valid out-parameter; `child` is our child.
                    let rc = unsafe { libc::waitpid(child, &mut status, 0) };
                    if rc != -1 {
                        break;
                    }
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(err);
                    }
                }
                if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 {
                    Ok(())
                } else {
                    Err(io::Error::other(format!(
                        "probe child exited abnormally (wait status {status})"
                    )))
                }
            }
        }
    }
}

#[cfg(not(unix))]
fn unsupported<T>(what: &str) -> io::Result<T> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{what} is not available on this platform"),
    ))
}

#[cfg(not(unix))]
impl HostPrimitives for LibcHost {
    fn sem_open(&self, _: &str, _: OpenFlags, _: u32, _: u32) -> io::Result<SemHandle> {
        unsupported("sem_open")
    }
    fn sem_wait(&self, _: &SemHandle) -> io::Result<()> {
        unsupported("sem_wait")
    }
    fn sem_trywait(&self, _: &SemHandle) -> io::Result<()> {
        unsupported("sem_trywait")
    }
    fn sem_post(&self, _: &SemHandle) -> io::Result<()> {
        unsupported("sem_post")
    }
    fn sem_close(&self, _: SemHandle) -> io::Result<()> {
        unsupported("sem_close")
    }
    fn sem_unlink(&self, _: &str) -> io::Result<()> {
        unsupported("sem_unlink")
    }
    fn shm_open(&self, _: &str, _: OpenFlags, _: u32) -> io::Result<ShmHandle> {
        unsupported("shm_open")
    }
    fn shm_resize(&self, _: &ShmHandle, _: usize) -> io::Result<()> {
        unsupported("ftruncate")
    }
    fn shm_len(&self, _: &ShmHandle) -> io::Result<usize> {
        unsupported("fstat")
    }
    fn shm_map(&self, _: &ShmHandle, _: usize) -> io::Result<MappedRegion> {
        unsupported("mmap")
    }
    fn shm_close(&self, _: ShmHandle) -> io::Result<()> {
        unsupported("close")
    }
    fn shm_unlink(&self, _: &str) -> io::Result<()> {
        unsupported("shm_unlink")
    }
    fn fork_and_reap(&self) -> io::Result<()> {
        unsupported("fork")
    }
}
