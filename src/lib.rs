//! # uRPC
//!
//! A small-footprint remote-procedure-call runtime with UDP, TCP and
//! shared-memory transports behind one wire protocol, one `DataBuffer`
//! parameter-packing container, and one worker-thread server engine.

pub mod cli;
pub mod client;
pub mod databuffer;
pub mod error;
pub mod resolver;
#[cfg(unix)]
pub mod sem;
pub mod server;
pub mod session;
pub mod transport;
pub mod wire;

pub use client::{Client, ClientConfig};
pub use error::{Status, WireError};
pub use server::{Server, ServerBuilder, ServerConfig};

/// The current version of the uRPC runtime.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
