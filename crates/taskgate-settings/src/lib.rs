//! # taskgate-settings
//!
//! Configuration for the taskgate gateway: compiled defaults, an optional
//! JSON settings file deep-merged over them, and environment variable
//! overrides applied last.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{load_settings, load_settings_from_path};
pub use types::{BusSettings, GatewaySettings, LoggingSettings, QuerySettings, ServerSettings};
