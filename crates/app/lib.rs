//! # courier-app - Demonstration jobs
//!
//! Environment-driven [`Settings`], the demonstration task [`registry`] and
//! the periodic [`beat_schedule`], shared by the `courier` binary and the
//! end-to-end tests.

pub mod schedule;
pub mod settings;
pub mod tasks;

pub use schedule::beat_schedule;
pub use settings::Settings;
pub use tasks::registry;

/// Namespace every application queue lives under.
pub const NAMESPACE: &str = "courier_app";
