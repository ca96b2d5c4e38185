#![forbid(unsafe_code)]

//! Core types shared across the tunnel daemon workspace: the owned packet
//! buffer, peer addresses, configuration, and the crate-wide error type.

pub mod addr;
pub mod buffer;
pub mod config;
pub mod error;

pub use addr::PeerAddress;
pub use buffer::Buffer;
pub use config::{Config, Mode, PeerConfig};
pub use error::{Error, Result};
