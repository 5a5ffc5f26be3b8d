//! Descriptor diagnostic disabler.
//!
//! Android's fdsan aborts the process when a descriptor owned by one layer
//! is closed by another, a pattern common in libraries written for desktop
//! hosts. Once it fires nothing downstream can recover, so this must run
//! before anything opens or closes a descriptor.

use serde::Serialize;
use tracing::{debug, warn};

/// Environment toggle read by the host runtime and by [`crate::config`].
pub const FDSAN_ENV: &str = "ANDROID_FDSAN_DISABLED";

/// What [`disable_descriptor_diagnostic`] managed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticOutcome {
    /// The runtime error level was lowered.
    Disabled,
    /// The runtime hook does not exist here; the environment flag is exported.
    EnvironmentOnly,
    /// Neither the runtime hook nor the environment flag is in place.
    Unavailable,
    /// Configuration kept the diagnostic on.
    LeftEnabled,
}

impl std::fmt::Display for DiagnosticOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "disabled"),
            Self::EnvironmentOnly => write!(f, "environment only"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::LeftEnabled => write!(f, "left enabled"),
        }
    }
}

/// Exports `ANDROID_FDSAN_DISABLED=1` for the host runtime and any child
/// process.
///
/// # Safety
///
/// No other thread may read or write the process environment while this
/// runs. Call it from `main` before any thread or async runtime is started.
pub unsafe fn export_diagnostic_env() {
    // SAFETY: upheld by the caller.
    unsafe { std::env::set_var(FDSAN_ENV, "1") };
}

/// Calls `android_fdsan_set_error_level(DISABLED)` where the runtime
/// provides it.
///
/// Never writes the environment; the flag is exported separately by
/// [`export_diagnostic_env`].
pub fn disable_descriptor_diagnostic() -> DiagnosticOutcome {
    if set_runtime_error_level() {
        DiagnosticOutcome::Disabled
    } else if env_flag_exported() {
        DiagnosticOutcome::EnvironmentOnly
    } else {
        DiagnosticOutcome::Unavailable
    }
}

fn env_flag_exported() -> bool {
    std::env::var_os(FDSAN_ENV).is_some_and(|value| !value.is_empty() && value != "0")
}

#[cfg(any(target_os = "android", target_os = "linux"))]
fn set_runtime_error_level() -> bool {
    type SetErrorLevel = unsafe extern "C" fn(libc::c_int) -> libc::c_int;
    const FDSAN_ERROR_LEVEL_DISABLED: libc::c_int = 0;

    // SAFETY: RTLD_DEFAULT with a NUL-terminated name.
    let symbol = unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"android_fdsan_set_error_level".as_ptr()) };
    if symbol.is_null() {
        debug!("android_fdsan_set_error_level not present");
        return false;
    }
    // SAFETY: bionic declares the function as taking and returning an
    // int-sized enum.
    let set_error_level = unsafe { std::mem::transmute::<*mut libc::c_void, SetErrorLevel>(symbol) };
    // SAFETY: plain call into libc with a valid enum value.
    let previous = unsafe { set_error_level(FDSAN_ERROR_LEVEL_DISABLED) };
    debug!(previous, "fdsan error level lowered");
    true
}

#[cfg(not(any(target_os = "android", target_os = "linux")))]
fn set_runtime_error_level() -> bool {
    false
}

/// Closes `fd`, never touching stdin/stdout/stderr and never failing.
///
/// A standard descriptor is released without being closed. Returns whether
/// the descriptor was actually closed.
#[cfg(unix)]
pub fn close_descriptor(fd: std::os::fd::OwnedFd) -> bool {
    use std::os::fd::IntoRawFd;

    let fd = fd.into_raw_fd();
    if (0..=2).contains(&fd) {
        debug!(fd, "refusing to close a standard descriptor");
        return false;
    }
    // SAFETY: `fd` came from an `OwnedFd` whose ownership was released above,
    // so nothing else closes or uses it.
    if unsafe { libc::close(fd) } == -1 {
        let error = std::io::Error::last_os_error();
        warn!(fd, error = %error, "close failed, ignoring");
        return false;
    }
    true
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_display() {
        assert_eq!(DiagnosticOutcome::Disabled.to_string(), "disabled");
        assert_eq!(DiagnosticOutcome::LeftEnabled.to_string(), "left enabled");
    }

    #[test]
    fn test_disable_descriptor_diagnostic_leaves_environment_untouched() {
        let before = std::env::var_os(FDSAN_ENV);
        let outcome = disable_descriptor_diagnostic();
        assert_eq!(std::env::var_os(FDSAN_ENV), before);
        assert_ne!(outcome, DiagnosticOutcome::LeftEnabled);
        #[cfg(not(target_os = "android"))]
        assert_ne!(outcome, DiagnosticOutcome::Disabled);
    }

    #[cfg(unix)]
    #[test]
    fn test_close_descriptor_keeps_standard_streams_open() {
        use std::os::fd::FromRawFd;

        // SAFETY: close_descriptor releases standard descriptors unclosed,
        // so fd 2 stays owned by the process.
        let stderr = unsafe { std::os::fd::OwnedFd::from_raw_fd(2) };
        assert!(!close_descriptor(stderr));
        // SAFETY: F_GETFD only queries the descriptor flags.
        assert_ne!(unsafe { libc::fcntl(2, libc::F_GETFD) }, -1);
    }

    #[cfg(unix)]
    #[test]
    fn test_close_descriptor_closes_owned_fd() {
        let file = tempfile::tempfile().unwrap();
        assert!(close_descriptor(file.into()));
    }

    #[cfg(unix)]
    #[test]
    fn test_closing_a_duplicate_leaves_the_original_usable() {
        use std::io::{Read, Seek, SeekFrom, Write};
        use std::os::fd::AsFd;

        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"still here").unwrap();
        let duplicate = file.as_fd().try_clone_to_owned().unwrap();
        assert!(close_descriptor(duplicate));

        file.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "still here");
    }
}
