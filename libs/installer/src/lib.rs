//! Convergent installer for the Orkestra control plane, its console and its backing stores.
//!
//! [`converge::converge`] drives the whole flow. Each step detects the current state of the
//! resource it owns and decides whether to install, keep, repair or reinstall it, so a run
//! can start from a pristine cluster or from the leftovers of a failed one.

pub mod backoff;
pub mod bootstrap;
pub mod cluster;
pub mod context;
pub mod converge;
pub mod diagnose;
pub mod error;
pub mod helm;
pub mod lock;
pub mod pki;
pub mod probe;
pub mod readiness;
pub mod release;
pub mod report;
pub mod secret;
pub mod settings;
pub mod store;
pub mod teardown;
pub mod telemetry;
pub mod values;
pub mod vault;

#[cfg(test)]
pub(crate) mod fake;
