//! # Runtime Protection
//!
//! Probes, countermeasures and the background monitor, tied together by
//! [`Protector`]. A host creates one `Protector`, calls
//! [`Protector::initialize_protection`] once and then queries it whenever a
//! sensitive operation is about to run.

pub mod config;
pub mod countermeasures;
pub mod emulator_cache;
pub mod entropy;
pub mod environment;
pub mod monitor;
pub mod probes;
pub mod process_control;
pub mod security_level;

#[cfg(feature = "jni")]
pub mod jni_bridge;

use std::sync::{Arc, Mutex};

use log::{error, info};
use serde::Serialize;

pub use config::ProtectionConfig;
pub use countermeasures::CountermeasureStats;
pub use environment::{Environment, MockEnvironment, SystemEnvironment};
pub use monitor::{MonitorContext, MonitorLoop};
pub use process_control::{ProcessControl, RecordingProcessControl, SystemProcessControl};
pub use security_level::SecurityLevel;

/// Which threat signals were raised. `emulator` and `virtualized` come from
/// the heavy probes and are `false` on ticks that skip them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ThreatVerdict {
    pub traced: bool,
    pub hooked: bool,
    pub timing_anomaly: bool,
    pub emulator: bool,
    pub virtualized: bool,
}

impl ThreatVerdict {
    pub fn is_threat(&self) -> bool {
        self.traced || self.hooked || self.timing_anomaly || self.emulator || self.virtualized
    }
}

/// Host-facing handle over one monitor context.
pub struct Protector {
    context: Arc<MonitorContext>,
    monitor: MonitorLoop,
    /// Serializes initialization so the level is derived once per start
    init_lock: Mutex<()>,
}

impl Protector {
    /// Protector over the real process and platform.
    pub fn new(config: ProtectionConfig) -> Self {
        Self::with_capabilities(config, Arc::new(SystemEnvironment::new()), Arc::new(SystemProcessControl::new()))
    }

    pub fn with_capabilities(
        config: ProtectionConfig,
        env: Arc<dyn Environment>,
        control: Arc<dyn ProcessControl>,
    ) -> Self {
        let context = Arc::new(MonitorContext::new(config, env, control));
        Protector {
            monitor: MonitorLoop::new(Arc::clone(&context)),
            context,
            init_lock: Mutex::new(()),
        }
    }

    /// Block attach, derive the initial level from the environment and start
    /// the monitor loop.
    ///
    /// Idempotent: while the loop runs, further calls return `true` and leave
    /// the level alone. Returns `false` if the attach block was refused or the
    /// monitor thread could not be spawned.
    pub fn initialize_protection(&self) -> bool {
        let _init = self.init_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.monitor.is_running() {
            return true;
        }

        info!("Initializing native security components");
        let attach_blocked = self.context.countermeasures().block_attach();
        self.context.derive_initial_level();

        match self.monitor.start() {
            Ok(_) => attach_blocked,
            Err(e) => {
                error!("Failed to start security monitor: {}", e);
                false
            }
        }
    }

    /// Clamp `level` to 1..=3 and store it. Picked up by the next tick.
    pub fn set_security_level(&self, level: i32) -> SecurityLevel {
        let stored = self.context.level().set_raw(level);
        info!("Security level set to {}", stored);
        stored
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.context.level().current()
    }

    /// Level-gated: tracer and hooks always, timing from `Enhanced`, emulator
    /// at `Maximum`.
    pub fn is_being_analyzed(&self) -> bool {
        self.context.is_being_analyzed()
    }

    pub fn is_running_in_emulator(&self) -> bool {
        self.context.is_running_in_emulator()
    }

    pub fn has_hook_framework(&self) -> bool {
        self.context.has_hook_framework()
    }

    pub fn hide_process_info(&self, pid: i32) -> bool {
        self.context.countermeasures().hide_process_info(pid)
    }

    pub fn spoof_process_name(&self, name: &str) -> bool {
        self.context.countermeasures().spoof_process_name(name)
    }

    /// Every probe once, regardless of level.
    pub fn current_verdict(&self) -> ThreatVerdict {
        self.context.full_verdict()
    }

    pub fn stats(&self) -> CountermeasureStats {
        self.context.countermeasures().stats()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.is_running()
    }

    /// Completed monitor ticks.
    pub fn ticks(&self) -> u64 {
        self.monitor.ticks()
    }

    pub fn context(&self) -> &Arc<MonitorContext> {
        &self.context
    }

    /// Stop the monitor loop. Countermeasures already applied stay in effect.
    pub fn shutdown_protection(&self) {
        self.monitor.stop();
    }
}

/// Create a [`Protector`] over the real platform, with the default or a
/// given [`ProtectionConfig`].
#[macro_export]
macro_rules! setup_protection {
    () => {
        $crate::protector::Protector::new($crate::protector::ProtectionConfig::default())
    };
    ($config:expr) => {
        $crate::protector::Protector::new($config)
    };
}

pub use crate::setup_protection;
