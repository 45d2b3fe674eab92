//! # fguard
//!
//! In-process runtime self-protection monitor. A background loop inspects the
//! process's own execution environment for tracers, hooking frameworks,
//! emulators and containers, and reacts by running countermeasures whose
//! intensity follows a three-step security level.
//!
//! Everything is best-effort: probes default to "no threat" when the
//! environment cannot be read, and countermeasures log and carry on when the
//! platform refuses them.
//!
//! ```no_run
//! use fguard::protector::{Protector, ProtectionConfig};
//!
//! let protector = Protector::new(ProtectionConfig::default());
//! protector.initialize_protection();
//!
//! if protector.is_being_analyzed() {
//!     // refuse the sensitive feature
//! }
//!
//! protector.shutdown_protection();
//! ```

pub mod error;
pub mod protector;

pub use error::{Error, Result};
pub use protector::{Protector, ProtectionConfig, SecurityLevel, ThreatVerdict};
