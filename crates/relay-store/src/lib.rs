//! # relay-store
//!
//! The two external collaborators every relay process shares:
//!
//! - [`CounterStore`]: one integer key with atomic increment/decrement
//! - [`BroadcastChannel`]: named topics with publish/subscribe
//!
//! Two bindings implement both traits:
//!
//! | binding         | use |
//! |-----------------|-----|
//! | [`MemoryStore`] | tests and single-host demos; clones share state |
//! | [`RedisStore`]  | production; RESP2 over TCP |

#![deny(unsafe_code)]

pub mod memory;
pub mod redis;
pub mod resp;
pub mod traits;

pub use memory::MemoryStore;
pub use redis::{RedisEndpoint, RedisStore};
pub use traits::{BroadcastChannel, CounterStore, RelayStore, Subscription};
