//! Well-known names shared by every relay process.

/// Shared counter key holding the total connection count.
pub const CONNECTION_COUNT_KEY: &str = "chat:connection-count";

/// Topic carrying the new total after every increment/decrement.
pub const CONNECTION_COUNT_UPDATED_TOPIC: &str = "chat:connection-count-updated";

/// Topic carrying raw chat text.
pub const NEW_MESSAGE_TOPIC: &str = "chat:new-message";

/// Default upper bound on chat text length, in characters.
pub const DEFAULT_MAX_MESSAGE_CHARS: usize = 255;

/// Current crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
