use thiserror::Error;

/// Errors raised inside the monitor.
///
/// None of these cross the host boundary on a probe or countermeasure path:
/// probes collapse them to "no threat" and countermeasures to a `false`
/// return, after logging. Only configuration loading and starting the
/// background loop hand an `Error` back to the caller.
///
/// # Error Categories
///
/// ## Probe inconclusive
/// - [`Error::ProbeInconclusive`] - evidence could not be read or parsed
/// - [`Error::Io`] - raw capability failure (missing file, denied permission)
///
/// ## Countermeasure ineffective
/// - [`Error::CountermeasureRefused`] - the platform rejected the directive
///
/// ## Host-facing
/// - [`Error::Config`] - a JSON configuration could not be deserialized
/// - [`Error::Spawn`] - the monitor thread could not be created
#[derive(Error, Debug)]
pub enum Error {
    /// A probe could not reach a verdict from the evidence it read.
    #[error("probe '{probe}' inconclusive: {reason}")]
    ProbeInconclusive {
        /// Name of the probe
        probe: &'static str,
        /// What was missing or malformed
        reason: String,
    },

    /// An environment read failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The platform refused a protection directive.
    #[error("countermeasure '{action}' refused: {source}")]
    CountermeasureRefused {
        /// Name of the countermeasure
        action: &'static str,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// The background monitor thread could not be spawned.
    #[error("failed to spawn monitor thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

macro_rules! inconclusive {
    ($probe:expr, $msg:expr) => {
        crate::Error::ProbeInconclusive {
            probe: $probe,
            reason: $msg.to_string(),
        }
    };

    ($probe:expr, $fmt:expr, $($arg:tt)*) => {
        crate::Error::ProbeInconclusive {
            probe: $probe,
            reason: format!($fmt, $($arg)*),
        }
    };
}

pub(crate) use inconclusive;
