//! Structured logging setup (SPEC_FULL §2.1): initialised once at process
//! start from the `-v` flag, overridable by `RUST_LOG`.

use tracing_subscriber::EnvFilter;

/// The verbosity levels spec §6's `-v` flag accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    None,
    Error,
    Warning,
    Info,
    Debug,
}

impl Verbosity {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(Verbosity::None),
            "error" => Some(Verbosity::Error),
            "warning" | "warn" => Some(Verbosity::Warning),
            "info" => Some(Verbosity::Info),
            "debug" => Some(Verbosity::Debug),
            _ => None,
        }
    }

    fn directive(self) -> &'static str {
        match self {
            Verbosity::None => "off",
            Verbosity::Error => "error",
            Verbosity::Warning => "warn",
            Verbosity::Info => "info",
            Verbosity::Debug => "debug",
        }
    }
}

/// Initialise the global `tracing` subscriber. `RUST_LOG`, if set, wins
/// over `verbosity`; `Verbosity::None` disables output entirely unless
/// `RUST_LOG` overrides it.
pub fn init(verbosity: Verbosity) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.directive()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
