//! Environment probes.
//!
//! Each probe is a side-effect-free function of an [`Environment`] that
//! returns `true` only on positive evidence. Anything inconclusive (missing
//! file, unreadable field, denied permission) is logged and reported as
//! "no threat".

use std::time::Duration;

use log::debug;

use crate::error::inconclusive;
use crate::protector::environment::Environment;
use crate::Result;

// ============================================================================
// DETECTION TABLES
// ============================================================================

pub const STATUS_PATH: &str = "/proc/self/status";
pub const MAPS_PATH: &str = "/proc/self/maps";

/// Field in the status pseudo-file holding the tracer's PID
const TRACER_FIELD: &str = "TracerPid:";

/// The status file is small; TracerPid sits in its first few hundred bytes
const STATUS_READ_LIMIT: usize = 4 * 1024;

/// Upper bound on how much of the mappings listing is scanned per probe
const MAPS_READ_LIMIT: usize = 4 * 1024 * 1024;

/// Shared libraries only loadable when a hooking framework is installed
pub const HOOK_LIBRARIES: &[&str] = &["libxposed_art.so", "libsubstrate.so"];

/// Substrings that mark an injected instrumentation agent in the mappings
pub const HOOK_MAPPING_MARKERS: &[&str] = &["frida", "gum-js-loop"];

/// On-disk artifacts of Xposed, Frida and Substrate installs
pub const HOOK_FILES: &[&str] = &[
    "/system/framework/XposedBridge.jar",
    "/system/lib/libxposed_art.so",
    "/system/lib64/libxposed_art.so",
    "/system/xposed.prop",
    "/data/local/tmp/frida-server",
    "/data/local/tmp/re.frida.server",
    "/system/lib/libfrida-gadget.so",
    "/system/lib64/libfrida-gadget.so",
    "/system/bin/frida-server",
    "/system/lib/libsubstrate.so",
    "/system/lib64/libsubstrate.so",
    "/data/app/com.saurik.substrate",
];

/// Files left behind by the Magisk root manager
pub const MAGISK_PATHS: &[&str] = &[
    "/sbin/.magisk",
    "/sbin/.core",
    "/data/adb/magisk",
    "/cache/.disable_magisk",
    "/dev/.magisk.db",
];

/// Set (to anything) while MagiskHide is active
pub const MAGISK_HIDE_PROPERTY: &str = "ro.magisk.hide";

/// Properties whose values betray an emulated device
pub const EMULATOR_PROPERTIES: &[&str] = &[
    "ro.hardware",
    "ro.product.model",
    "ro.product.manufacturer",
    "ro.kernel.qemu",
    "ro.bootloader",
    "ro.bootmode",
    "ro.build.characteristics",
];

/// Known emulator vendor/product values, matched as case-sensitive substrings
pub const EMULATOR_VALUES: &[&str] = &[
    "goldfish",
    "ranchu",
    "sdk",
    "sdk_gphone",
    "emulator",
    "Genymotion",
    "vbox",
    "nox",
    "bluestacks",
    "android_x86",
];

/// Files that only exist under hardware emulators
pub const EMULATOR_FILES: &[&str] = &[
    "/dev/socket/qemud",
    "/dev/qemu_pipe",
    "/system/lib/libc_malloc_debug_qemu.so",
    "/sys/qemu_trace",
    "/system/bin/qemu-props",
    "/dev/socket/genyd",
    "/dev/socket/baseband_genyd",
];

/// Container and hypervisor guest markers
pub const VIRTUALIZATION_FILES: &[&str] = &["/.dockerenv", "/dev/lxc", "/dev/vboxguest", "/dev/vboxuser"];

// ============================================================================
// TRACER
// ============================================================================

/// True iff the status pseudo-file reports a non-zero tracer PID.
pub fn is_being_traced(env: &dyn Environment) -> bool {
    match read_tracer_pid(env) {
        Ok(0) => false,
        Ok(pid) => {
            debug!("Tracer attached (TracerPid: {})", pid);
            true
        }
        Err(e) => {
            debug!("Tracer probe: {}", e);
            false
        }
    }
}

fn read_tracer_pid(env: &dyn Environment) -> Result<i64> {
    let status = env.read_file(STATUS_PATH, STATUS_READ_LIMIT)?;
    parse_tracer_pid(&String::from_utf8_lossy(&status))
}

/// Extract the tracer PID from the text of a status pseudo-file.
///
/// Only a line starting with the field name counts; the `Name:` line is the
/// process's own comm and may contain the same text.
pub fn parse_tracer_pid(status: &str) -> Result<i64> {
    let value = status
        .lines()
        .find_map(|line| line.strip_prefix(TRACER_FIELD))
        .map(str::trim)
        .ok_or_else(|| inconclusive!("tracer", "no {} field", TRACER_FIELD))?;

    value
        .parse::<i64>()
        .map_err(|_| inconclusive!("tracer", "unparsable {} value '{}'", TRACER_FIELD, value))
}

// ============================================================================
// HOOKING FRAMEWORKS
// ============================================================================

/// OR of the library-load check, the artifact files, the mappings scan and
/// the Magisk sub-probe.
pub fn has_hook_framework(env: &dyn Environment) -> bool {
    if let Some(library) = HOOK_LIBRARIES.iter().find(|lib| env.load_library(lib)) {
        debug!("Hook framework library loadable: {}", library);
        return true;
    }

    if let Some(file) = HOOK_FILES.iter().find(|file| env.path_exists(file)) {
        debug!("Hook framework artifact present: {}", file);
        return true;
    }

    match scan_mappings(env) {
        Ok(Some(marker)) => {
            debug!("Hook framework mapped into process: {}", marker);
            return true;
        }
        Ok(None) => {}
        Err(e) => debug!("Mappings scan: {}", e),
    }

    detect_magisk(env)
}

fn scan_mappings(env: &dyn Environment) -> Result<Option<&'static str>> {
    let maps = env.read_file(MAPS_PATH, MAPS_READ_LIMIT)?;
    let maps = String::from_utf8_lossy(&maps);

    Ok(HOOK_MAPPING_MARKERS.iter().copied().find(|marker| maps.contains(marker)))
}

/// Root-manager artifacts: known files or the MagiskHide property.
pub fn detect_magisk(env: &dyn Environment) -> bool {
    if let Some(path) = MAGISK_PATHS.iter().find(|path| env.path_exists(path)) {
        debug!("Detected Magisk file: {}", path);
        return true;
    }

    env.read_property(MAGISK_HIDE_PROPERTY)
        .is_some_and(|value| !value.is_empty())
}

// ============================================================================
// EMULATOR
// ============================================================================

/// Full (unmemoized) emulator probe. Callers on a hot path should go through
/// [`EmulatorCache`](crate::protector::emulator_cache::EmulatorCache).
pub fn detect_emulator(env: &dyn Environment) -> bool {
    for property in EMULATOR_PROPERTIES {
        let Some(value) = env.read_property(property) else {
            continue;
        };

        if EMULATOR_VALUES.iter().any(|marker| value.contains(marker)) {
            debug!("Emulator detected via property {} = {}", property, value);
            return true;
        }
    }

    if let Some(file) = EMULATOR_FILES.iter().find(|file| env.path_exists(file)) {
        debug!("Emulator detected via file: {}", file);
        return true;
    }

    false
}

// ============================================================================
// VIRTUALIZATION
// ============================================================================

pub fn detect_virtual_environment(env: &dyn Environment) -> bool {
    match VIRTUALIZATION_FILES.iter().find(|file| env.path_exists(file)) {
        Some(file) => {
            debug!("Virtual environment detected via file: {}", file);
            true
        }
        None => false,
    }
}

// ============================================================================
// TIMING
// ============================================================================

/// Runs the fixed workload and flags it when it overruns `threshold`.
///
/// Single-stepping and heavy instrumentation inflate the run time, but so does
/// a slow or loaded device. Treat this as one weak signal among several.
pub fn detect_timing_anomaly(env: &dyn Environment, iterations: u32, threshold: Duration) -> bool {
    let elapsed = env.time_workload(iterations);
    if elapsed > threshold {
        debug!("Timing anomaly: workload took {:?} (threshold {:?})", elapsed, threshold);
        true
    } else {
        false
    }
}
