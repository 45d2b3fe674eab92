//! Environment capability used by the probes.
//!
//! Probes never touch the filesystem, system properties or the dynamic loader
//! directly; they go through [`Environment`]. [`SystemEnvironment`] is the
//! platform-backed implementation, [`MockEnvironment`] a scriptable one for
//! exercising probe logic with synthetic inputs.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Read-only view of the process's execution environment.
pub trait Environment: Send + Sync {
    /// Read at most `limit` bytes from `path`.
    fn read_file(&self, path: &str, limit: usize) -> io::Result<Vec<u8>>;

    /// Value of a system configuration property, `None` when unset.
    fn read_property(&self, name: &str) -> Option<String>;

    fn path_exists(&self, path: &str) -> bool;

    /// Try to load a shared library by name. The handle is released before
    /// returning; only the outcome is reported.
    fn load_library(&self, name: &str) -> bool;

    /// Run the fixed timing workload and report how long it took.
    fn time_workload(&self, iterations: u32) -> Duration {
        run_reference_workload(iterations)
    }
}

/// Deterministic CPU-bound workload measured with the monotonic clock.
pub fn run_reference_workload(iterations: u32) -> Duration {
    let start = Instant::now();

    let mut sum = 0u64;
    for i in 0..iterations as u64 {
        sum = std::hint::black_box(sum.wrapping_add(i.wrapping_mul(i)));
    }
    std::hint::black_box(sum);

    start.elapsed()
}

// ============================================================================
// PLATFORM IMPLEMENTATION
// ============================================================================

/// Where non-Android builds look for `key=value` system properties
const BUILD_PROP_PATH: &str = "/system/build.prop";
const BUILD_PROP_LIMIT: usize = 64 * 1024;

/// `PROP_VALUE_MAX` from `<sys/system_properties.h>`
#[cfg(target_os = "android")]
const PROP_VALUE_MAX: usize = 92;

/// Environment backed by the real OS.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEnvironment;

impl SystemEnvironment {
    pub fn new() -> Self {
        SystemEnvironment
    }

    #[cfg(target_os = "android")]
    fn system_property(name: &str) -> Option<String> {
        let name = std::ffi::CString::new(name).ok()?;
        let mut value = [0 as libc::c_char; PROP_VALUE_MAX];

        // SAFETY: `name` is NUL-terminated and `value` has the PROP_VALUE_MAX
        // capacity the bionic API requires.
        let len = unsafe { libc::__system_property_get(name.as_ptr(), value.as_mut_ptr()) };
        if len <= 0 {
            return None;
        }

        let bytes: Vec<u8> = value[..len as usize].iter().map(|&c| c as u8).collect();
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    #[cfg(not(target_os = "android"))]
    fn system_property(&self, name: &str) -> Option<String> {
        let content = self.read_file(BUILD_PROP_PATH, BUILD_PROP_LIMIT).ok()?;
        let content = String::from_utf8_lossy(&content);
        lookup_build_prop(&content, name)
    }
}

impl Environment for SystemEnvironment {
    fn read_file(&self, path: &str, limit: usize) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        File::open(path)?.take(limit as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn read_property(&self, name: &str) -> Option<String> {
        #[cfg(target_os = "android")]
        {
            Self::system_property(name)
        }
        #[cfg(not(target_os = "android"))]
        {
            self.system_property(name)
        }
    }

    fn path_exists(&self, path: &str) -> bool {
        std::fs::symlink_metadata(path).is_ok()
    }

    fn load_library(&self, name: &str) -> bool {
        // SAFETY: loading runs the library's initializers. The names probed
        // are fixed framework libraries that are only present when the
        // framework is already injected into this process.
        match unsafe { libloading::Library::new(name) } {
            Ok(library) => {
                drop(library);
                true
            }
            Err(_) => false,
        }
    }
}

/// Find `name` in a `build.prop` style document.
fn lookup_build_prop(content: &str, name: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

// ============================================================================
// SCRIPTABLE IMPLEMENTATION
// ============================================================================

#[derive(Debug, Default)]
struct MockState {
    files: HashMap<String, Vec<u8>>,
    properties: HashMap<String, String>,
    paths: HashSet<String>,
    libraries: HashSet<String>,
    workload_time: Option<Duration>,
}

/// In-memory environment. Every field can be changed between calls, and every
/// query is counted so tests can assert that nothing was probed.
#[derive(Debug, Default)]
pub struct MockEnvironment {
    state: Mutex<MockState>,
    queries: AtomicUsize,
}

impl MockEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, content: impl Into<Vec<u8>>) -> Self {
        self.set_file(path, content);
        self
    }

    pub fn with_property(self, name: &str, value: &str) -> Self {
        self.set_property(name, value);
        self
    }

    pub fn with_path(self, path: &str) -> Self {
        self.add_path(path);
        self
    }

    pub fn with_library(self, name: &str) -> Self {
        self.add_library(name);
        self
    }

    /// Report this duration for every timing workload instead of measuring.
    pub fn with_workload_time(self, elapsed: Duration) -> Self {
        self.set_workload_time(elapsed);
        self
    }

    pub fn set_file(&self, path: &str, content: impl Into<Vec<u8>>) {
        self.lock().files.insert(path.to_string(), content.into());
    }

    pub fn remove_file(&self, path: &str) {
        self.lock().files.remove(path);
    }

    pub fn set_property(&self, name: &str, value: &str) {
        self.lock().properties.insert(name.to_string(), value.to_string());
    }

    pub fn clear_properties(&self) {
        self.lock().properties.clear();
    }

    pub fn add_path(&self, path: &str) {
        self.lock().paths.insert(path.to_string());
    }

    pub fn remove_path(&self, path: &str) {
        self.lock().paths.remove(path);
    }

    pub fn add_library(&self, name: &str) {
        self.lock().libraries.insert(name.to_string());
    }

    pub fn set_workload_time(&self, elapsed: Duration) {
        self.lock().workload_time = Some(elapsed);
    }

    /// Total number of capability calls served so far.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A panicking test thread must not wedge the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn count(&self) {
        self.queries.fetch_add(1, Ordering::SeqCst);
    }
}

impl Environment for MockEnvironment {
    fn read_file(&self, path: &str, limit: usize) -> io::Result<Vec<u8>> {
        self.count();
        match self.lock().files.get(path) {
            Some(content) => Ok(content[..content.len().min(limit)].to_vec()),
            None => Err(io::Error::new(io::ErrorKind::NotFound, path.to_string())),
        }
    }

    fn read_property(&self, name: &str) -> Option<String> {
        self.count();
        self.lock().properties.get(name).cloned()
    }

    fn path_exists(&self, path: &str) -> bool {
        self.count();
        self.lock().paths.contains(path)
    }

    fn load_library(&self, name: &str) -> bool {
        self.count();
        self.lock().libraries.contains(name)
    }

    fn time_workload(&self, iterations: u32) -> Duration {
        self.count();
        let scripted = self.lock().workload_time;
        scripted.unwrap_or_else(|| run_reference_workload(iterations))
    }
}
