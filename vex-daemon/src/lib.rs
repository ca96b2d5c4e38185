#![forbid(unsafe_code)]

//! Core of the `vexd` tunnel daemon: peer/task/handshake state from
//! `vex-proto`, methods from `vex-crypto`, and transport from
//! `vex-transport`, wired together by a single-threaded event loop.

pub mod clock;
pub mod daemon;
pub mod methods;

pub use daemon::Daemon;
pub use vex_core::Config;

use vex_transport::{MemoryTun, TunDevice, UdpPool};

/// Run a daemon instance to completion (it never returns under normal
/// operation; the event loop runs until a terminal I/O error occurs).
///
/// Opening the real OS TUN/TAP device is outside this crate's scope (the
/// daemon only depends on the [`TunDevice`] contract); this entry point
/// plugs in an in-memory stand-in until a platform-specific adapter is
/// wired in by a caller.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let methods = methods::build_registry(&config);
    let udp = UdpPool::bind(config.bind_v4, config.bind_v6)?;
    let tun: Box<dyn TunDevice> = Box::new(MemoryTun::new(config.mtu));

    let daemon = Daemon::new(config, methods, udp, tun);
    daemon.run().await
}
