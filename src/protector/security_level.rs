//! Security level and the level → policy mapping.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::protector::config::ProtectionConfig;

/// Protection level. Higher levels probe more often, treat more signals as
/// analysis, and answer threats with heavier countermeasures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(u8)]
pub enum SecurityLevel {
    Normal = 1,
    Enhanced = 2,
    Maximum = 3,
}

impl SecurityLevel {
    /// Clamp an arbitrary host-supplied integer to the nearest level.
    pub fn clamped(raw: i32) -> Self {
        match raw {
            i32::MIN..=1 => SecurityLevel::Normal,
            2 => SecurityLevel::Enhanced,
            _ => SecurityLevel::Maximum,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    fn from_u8(raw: u8) -> Self {
        Self::clamped(raw as i32)
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

/// Countermeasures applied on every tick that saw a threat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CountermeasurePolicy {
    pub obfuscate_memory: bool,
    pub block_attach: bool,
}

/// Holds the current level. Never escalates on its own.
#[derive(Debug)]
pub struct SecurityLevelController {
    level: AtomicU8,
}

impl Default for SecurityLevelController {
    fn default() -> Self {
        Self::new(SecurityLevel::Normal)
    }
}

impl SecurityLevelController {
    pub fn new(initial: SecurityLevel) -> Self {
        SecurityLevelController {
            level: AtomicU8::new(initial as u8),
        }
    }

    pub fn current(&self) -> SecurityLevel {
        SecurityLevel::from_u8(self.level.load(Ordering::SeqCst))
    }

    pub fn set(&self, level: SecurityLevel) {
        self.level.store(level as u8, Ordering::SeqCst);
    }

    /// Clamp and store a raw level; returns what was stored.
    pub fn set_raw(&self, raw: i32) -> SecurityLevel {
        let level = SecurityLevel::clamped(raw);
        self.set(level);
        level
    }

    /// Move from `from` to `to` only if the level is still `from`.
    pub fn escalate_from(&self, from: SecurityLevel, to: SecurityLevel) -> bool {
        self.level
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn sleep_interval(level: SecurityLevel, config: &ProtectionConfig) -> Duration {
        match level {
            SecurityLevel::Maximum => config.maximum_interval,
            SecurityLevel::Enhanced => config.enhanced_interval,
            SecurityLevel::Normal => config.normal_interval,
        }
    }

    pub fn policy(level: SecurityLevel) -> CountermeasurePolicy {
        match level {
            SecurityLevel::Maximum => CountermeasurePolicy {
                obfuscate_memory: true,
                block_attach: true,
            },
            SecurityLevel::Enhanced => CountermeasurePolicy {
                obfuscate_memory: false,
                block_attach: true,
            },
            SecurityLevel::Normal => CountermeasurePolicy::default(),
        }
    }
}
