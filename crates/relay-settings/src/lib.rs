//! # relay-settings
//!
//! Configuration for a relay process, loaded from layered sources (in
//! priority order, lowest first):
//!
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **Settings file**: optional JSON file, deep-merged over defaults
//! 3. **Environment variables**: `PORT`, `HOST`, `CORS_ORIGIN`,
//!    `REDIS_ENDPOINT`, `RELAY_*`
//!
//! CLI flags are applied on top by the binary.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, apply_overrides_from, deep_merge, load_settings};
pub use types::*;
