#![forbid(unsafe_code)]

pub mod tun;
pub mod udp;

pub use tun::{MemoryTun, TunDevice};
pub use udp::UdpPool;
