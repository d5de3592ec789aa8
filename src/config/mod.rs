//! Ambient configuration surface (SPEC_FULL §2): logging setup and the
//! dashboard block registry. Stage-level parameter schema and binding
//! lives in [`crate::core::params`] since it's a core contract, not an
//! ambient concern.

pub mod dashboard;
pub mod logging;

pub use dashboard::DashboardRegistry;
pub use logging::Verbosity;
