// SPDX-License-Identifier: MIT
//! Gateway health check system.
//!
//! Provides [`HealthReporter`] that aggregates multiple [`SystemHealthCheck`]
//! implementations into a single [`HealthReport`].
//!
//! # Included checks
//! - [`DatabaseHealthCheck`] — verifies the persistence layer can round-trip and reports its profile
//! - [`StorageHealthCheck`] — verifies the data directory is writable
//! - [`UpstreamHealthCheck`] — reports the upstream circuit breaker's state
//!
//! # Usage
//! ```rust,no_run
//! use mcp_gateway::health::{
//!     reporter::HealthReporter,
//!     checks::{DatabaseHealthCheck, StorageHealthCheck, UpstreamHealthCheck},
//! };
//!
//! let reporter = HealthReporter::new()
//!     .with_check(DatabaseHealthCheck::new(persistence))
//!     .with_check(StorageHealthCheck::new(&data_dir))
//!     .with_check(UpstreamHealthCheck::new(breaker));
//!
//! let report = reporter.get_health_report().await;
//! println!("overall: {}", report.status);
//! ```

pub mod checks;
pub mod reporter;

// Convenience re-exports.
pub use checks::{
    CheckResult, CheckStatus, DatabaseHealthCheck, StorageHealthCheck, SystemHealthCheck,
    UpstreamHealthCheck,
};
pub use reporter::{HealthReport, HealthReporter};
