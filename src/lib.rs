//! peerbeam is a rendezvous relay for browser-to-browser file transfer.
//!
//! Peers hold their files locally and register them over a persistent
//! WebSocket control channel; downloaders fetch over plain HTTP and the
//! relay pipes bytes between the two without ever persisting them. Opaque
//! tokens are the only addressing scheme: files, sessions, and redirects
//! are all bearer capabilities.

#![warn(missing_docs)]

pub mod cleanup;
pub mod config;
pub mod download;
pub mod error;
pub mod http;
pub mod limits;
pub mod peer;
pub mod peers;
pub mod pipe;
pub mod protocol;
pub mod range;
pub mod server;
pub mod stream;
pub mod token;
pub mod transfers;
pub mod ws;

pub use config::Config;
pub use error::{RelayError, Result};
pub use server::{run, Relay};
