//! Gateway module: accepting IPv6 connections and relaying them to the
//! IPv4 target embedded in their destination address.
//!
//! # Submodule Architecture
//!
//! - **[`listener`]**: The [`ListenerSet`] binds one TCP listener per
//!   configured port and spawns a handler task for every accepted
//!   connection. Ports bind independently; one failing does not stop the
//!   others.
//!
//! - **[`forwarder`]**: The [`ConnectionHandler`] runs the per-connection
//!   pipeline: read the connection's addresses, synthesize the target with
//!   [`relay64_core::translate`], vet it with [`relay64_core::filter`], dial
//!   it through a [`Dialer`], and relay.
//!
//! - **[`relay`]**: The [`Relay`] copies bytes both ways, one task per
//!   direction, and closes both streams when done.
//!
//! # Data Flow
//!
//! ```text
//! TcpListener::accept (listener.rs)
//!   → ConnectionHandler::handle
//!       → ConnectionContext::establish   (translate + filter)
//!       → Dialer::dial
//!       → Relay::run → upstream / downstream pump tasks
//! ```

pub mod forwarder;
pub mod listener;
pub mod relay;

#[cfg(test)]
pub(crate) mod testing;

pub use forwarder::{ConnectionHandler, Dialer};
pub use listener::ListenerSet;
pub use relay::Relay;
