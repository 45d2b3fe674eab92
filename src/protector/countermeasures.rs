//! Countermeasures taken once a threat signal has been seen.
//!
//! All of them are fire-and-forget: the platform refusing a directive is
//! logged and reported through a `false` return, never as a panic or an
//! error crossing into the host. Every method is safe to call repeatedly and
//! from several threads at once.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use rand::RngCore;
use serde::Serialize;

use crate::protector::entropy::DecoyEntropy;
use crate::protector::process_control::ProcessControl;
use crate::Error;

/// Plausible system process names, used in rotation
pub const SPOOF_TARGETS: &[&str] = &["system_server", "zygote", "media", "surfaceflinger"];

/// Command line written by `hide_process_info`
pub const DECOY_CMDLINE: &str = "system_server";

/// Counters of countermeasures issued since the executor was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CountermeasureStats {
    pub attach_blocks: u64,
    pub attach_refused: u64,
    pub noise_buffers: u64,
    pub noise_bytes: u64,
    pub identity_spoofs: u64,
}

pub struct CountermeasureExecutor {
    control: Arc<dyn ProcessControl>,
    noise_buffer_size: usize,
    spoof_cursor: AtomicUsize,

    attach_blocks: AtomicU64,
    attach_refused: AtomicU64,
    noise_buffers: AtomicU64,
    noise_bytes: AtomicU64,
    identity_spoofs: AtomicU64,
}

impl CountermeasureExecutor {
    pub fn new(control: Arc<dyn ProcessControl>, noise_buffer_size: usize) -> Self {
        CountermeasureExecutor {
            control,
            noise_buffer_size,
            spoof_cursor: AtomicUsize::new(0),
            attach_blocks: AtomicU64::new(0),
            attach_refused: AtomicU64::new(0),
            noise_buffers: AtomicU64::new(0),
            noise_bytes: AtomicU64::new(0),
            identity_spoofs: AtomicU64::new(0),
        }
    }

    /// Mark the process non-dumpable. Idempotent; `false` if refused.
    pub fn block_attach(&self) -> bool {
        self.attach_blocks.fetch_add(1, Ordering::Relaxed);

        match self.control.set_non_dumpable() {
            Ok(()) => {
                debug!("Disabled ptrace attachment");
                true
            }
            Err(source) => {
                self.attach_refused.fetch_add(1, Ordering::Relaxed);
                warn!("{}", Error::CountermeasureRefused { action: "block_attach", source });
                false
            }
        }
    }

    /// Leak a buffer of pseudo-random bytes for the rest of the process
    /// lifetime. Each call adds another one.
    pub fn obfuscate_memory(&self) -> &'static [u8] {
        let mut noise = vec![0u8; self.noise_buffer_size].into_boxed_slice();
        DecoyEntropy::generator().fill_bytes(&mut noise);

        let leaked: &'static [u8] = std::hint::black_box(Box::leak(noise));

        self.noise_buffers.fetch_add(1, Ordering::Relaxed);
        self.noise_bytes.fetch_add(leaked.len() as u64, Ordering::Relaxed);
        leaked
    }

    /// Take on the next name from [`SPOOF_TARGETS`] and, best-effort, the
    /// matching command line.
    pub fn spoof_identity(&self) -> bool {
        let index = self.spoof_cursor.fetch_add(1, Ordering::Relaxed) % SPOOF_TARGETS.len();
        let target = SPOOF_TARGETS[index];

        let renamed = self.spoof_process_name(target);
        self.overwrite_cmdline(target);
        renamed
    }

    /// Change the short process name to `name` (truncated to 15 bytes).
    pub fn spoof_process_name(&self, name: &str) -> bool {
        self.identity_spoofs.fetch_add(1, Ordering::Relaxed);

        match self.control.set_process_name(name) {
            Ok(()) => {
                debug!("Process name changed to: {}", name);
                true
            }
            Err(source) => {
                warn!("{}", Error::CountermeasureRefused { action: "spoof_process_name", source });
                false
            }
        }
    }

    /// Identity-masking entry point for the host. Only the current process
    /// can be masked; the return value reports that an attempt was made.
    pub fn hide_process_info(&self, pid: i32) -> bool {
        if u32::try_from(pid).ok() != Some(std::process::id()) {
            debug!("hide_process_info: pid {} is not this process, masking self", pid);
        }

        self.overwrite_cmdline(DECOY_CMDLINE);
        true
    }

    pub fn stats(&self) -> CountermeasureStats {
        CountermeasureStats {
            attach_blocks: self.attach_blocks.load(Ordering::Relaxed),
            attach_refused: self.attach_refused.load(Ordering::Relaxed),
            noise_buffers: self.noise_buffers.load(Ordering::Relaxed),
            noise_bytes: self.noise_bytes.load(Ordering::Relaxed),
            identity_spoofs: self.identity_spoofs.load(Ordering::Relaxed),
        }
    }

    fn overwrite_cmdline(&self, decoy: &str) {
        if let Err(source) = self.control.overwrite_cmdline(decoy) {
            // Usually denied without root
            debug!("{}", Error::CountermeasureRefused { action: "overwrite_cmdline", source });
        }
    }
}
