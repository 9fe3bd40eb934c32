//! pulsegrid-guard: protection for calls to upstream dependencies.
//!
//! A [`CircuitBreaker`] stops calls to a failing dependency and probes it
//! again after a recovery timeout; a [`QuotaTracker`] enforces a per-period
//! call budget. Both persist through a [`GuardRepository`] and the
//! [`GuardRegistry`] groups them by dependency id.
//!
//! [`GuardRepository`]: pulsegrid_state::GuardRepository

pub mod breaker;
pub mod error;
pub mod quota;
pub mod registry;

pub use breaker::CircuitBreaker;
pub use error::{GuardError, GuardResult};
pub use quota::QuotaTracker;
pub use registry::{Admission, GuardRegistry, GuardSnapshot};
