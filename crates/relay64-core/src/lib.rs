//! relay64-core: the pure half of the relay64 TCP relay.
//!
//! Provides the IPv6-to-IPv4 address synthesis scheme, the destination
//! filter that keeps the relay away from internal address space, and the
//! error types shared with the server crate.

pub mod error;
pub mod filter;
pub mod translate;

// Re-export commonly used items at crate root.
pub use error::{RelayError, RelayResult};
pub use filter::{classify, is_allowed, DenyReason, Verdict};
pub use translate::{translate, translate_endpoint, TranslateError};
