//! Process-control capability used by the countermeasures.
//!
//! The side-effecting counterpart of
//! [`Environment`](crate::protector::environment::Environment):
//! everything that changes how this process looks from the outside goes
//! through [`ProcessControl`], so countermeasure logic can be exercised
//! without renaming the test runner.

use std::io;
use std::sync::Mutex;

/// Linux limits the short process name to 16 bytes including the NUL
pub const SHORT_NAME_MAX: usize = 15;

/// Directives the countermeasures issue against the current process.
pub trait ProcessControl: Send + Sync {
    /// Mark the process non-dumpable so tracers cannot attach.
    fn set_non_dumpable(&self) -> io::Result<()>;

    /// Change the externally visible short name.
    fn set_process_name(&self, name: &str) -> io::Result<()>;

    /// Overwrite the externally visible command line.
    fn overwrite_cmdline(&self, decoy: &str) -> io::Result<()>;
}

/// Truncate `name` to the kernel's short-name limit on a char boundary.
pub fn short_name(name: &str) -> &str {
    if name.len() <= SHORT_NAME_MAX {
        return name;
    }
    let mut end = SHORT_NAME_MAX;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

// ============================================================================
// PLATFORM IMPLEMENTATION
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessControl;

impl SystemProcessControl {
    pub fn new() -> Self {
        SystemProcessControl
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl ProcessControl for SystemProcessControl {
    fn set_non_dumpable(&self) -> io::Result<()> {
        // SAFETY: PR_SET_DUMPABLE takes a plain integer argument; the unused
        // arguments must be zero.
        let rc = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0 as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn set_process_name(&self, name: &str) -> io::Result<()> {
        let name = short_name(name);

        // The thread-group leader's comm is what `ps` shows for the process
        if std::fs::write("/proc/self/comm", name.as_bytes()).is_ok() {
            return Ok(());
        }

        let c_name = std::ffi::CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: `c_name` is NUL-terminated and at most 16 bytes long, and
        // outlives the call.
        let rc = unsafe { libc::prctl(libc::PR_SET_NAME, c_name.as_ptr() as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn overwrite_cmdline(&self, decoy: &str) -> io::Result<()> {
        use std::io::Write;

        let mut cmdline = std::fs::OpenOptions::new().write(true).open("/proc/self/cmdline")?;
        cmdline.write_all(decoy.as_bytes())?;
        cmdline.write_all(&[0])
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl ProcessControl for SystemProcessControl {
    fn set_non_dumpable(&self) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn set_process_name(&self, _name: &str) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn overwrite_cmdline(&self, _decoy: &str) -> io::Result<()> {
        Err(io::ErrorKind::Unsupported.into())
    }
}

// ============================================================================
// RECORDING IMPLEMENTATION
// ============================================================================

/// A directive received by [`RecordingProcessControl`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    NonDumpable,
    ProcessName(String),
    Cmdline(String),
}

/// Records directives instead of applying them. Can be told to refuse them
/// all, the way an unprivileged sandbox would.
#[derive(Debug, Default)]
pub struct RecordingProcessControl {
    directives: Mutex<Vec<Directive>>,
    refuse: bool,
}

impl RecordingProcessControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every directive fails with `PermissionDenied` (still recorded).
    pub fn refusing() -> Self {
        RecordingProcessControl {
            directives: Mutex::new(Vec::new()),
            refuse: true,
        }
    }

    pub fn directives(&self) -> Vec<Directive> {
        self.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Directive) -> bool) -> usize {
        self.lock().iter().filter(|d| predicate(d)).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Directive>> {
        self.directives.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, directive: Directive) -> io::Result<()> {
        self.lock().push(directive);
        if self.refuse {
            Err(io::ErrorKind::PermissionDenied.into())
        } else {
            Ok(())
        }
    }
}

impl ProcessControl for RecordingProcessControl {
    fn set_non_dumpable(&self) -> io::Result<()> {
        self.record(Directive::NonDumpable)
    }

    fn set_process_name(&self, name: &str) -> io::Result<()> {
        self.record(Directive::ProcessName(short_name(name).to_string()))
    }

    fn overwrite_cmdline(&self, decoy: &str) -> io::Result<()> {
        self.record(Directive::Cmdline(decoy.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_name_truncation() {
        assert_eq!(short_name("zygote"), "zygote");
        assert_eq!(short_name("surfaceflinger"), "surfaceflinger");
        assert_eq!(short_name("system_server_with_suffix"), "system_server_w");
        assert_eq!(short_name("ääääääääää").len(), 14);
    }

    #[test]
    fn test_recording_control() {
        let control = RecordingProcessControl::new();
        control.set_non_dumpable().unwrap();
        control.set_process_name("media").unwrap();
        control.overwrite_cmdline("system_server").unwrap();

        assert_eq!(
            control.directives(),
            vec![
                Directive::NonDumpable,
                Directive::ProcessName("media".into()),
                Directive::Cmdline("system_server".into()),
            ]
        );
    }

    #[test]
    fn test_refusing_control_still_records() {
        let control = RecordingProcessControl::refusing();
        assert!(control.set_non_dumpable().is_err());
        assert_eq!(control.count(|d| *d == Directive::NonDumpable), 1);
    }
}
