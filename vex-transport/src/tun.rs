//! TUN/TAP device contract (spec §6). Opening the OS-specific device is
//! explicitly out of scope (spec §1); this module only fixes the trait
//! boundary the event loop programs against, plus an in-memory stand-in
//! used by the daemon's integration tests.

use std::collections::VecDeque;
use std::io;

/// A source/sink of whole frames: Ethernet frames in TAP mode, raw IP
/// packets in TUN mode (spec §6). Non-blocking: `try_read_frame` returns
/// `Ok(None)` rather than parking when nothing is queued, matching the
/// event loop's cooperative poll contract (spec §5).
pub trait TunDevice: Send {
    fn mtu(&self) -> u16;
    fn try_read_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// In-memory TUN/TAP stand-in: frames pushed onto `inbound` are yielded by
/// `try_read_frame`; frames passed to `write_frame` are collected into
/// `outbound` for assertions. Used by `vex-daemon`'s scenario tests, which
/// can't open a real OS device.
#[derive(Default)]
pub struct MemoryTun {
    mtu: u16,
    inbound: VecDeque<Vec<u8>>,
    pub outbound: Vec<Vec<u8>>,
}

impl MemoryTun {
    pub fn new(mtu: u16) -> Self {
        Self {
            mtu,
            inbound: VecDeque::new(),
            outbound: Vec::new(),
        }
    }

    pub fn push_inbound(&mut self, frame: Vec<u8>) {
        self.inbound.push_back(frame);
    }
}

impl TunDevice for MemoryTun {
    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn try_read_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let Some(frame) = self.inbound.pop_front() else {
            return Ok(None);
        };
        if frame.len() > buf.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "frame larger than buffer"));
        }
        buf[..frame.len()].copy_from_slice(&frame);
        Ok(Some(frame.len()))
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.outbound.push(frame.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_pushed_frames_in_order() {
        let mut tun = MemoryTun::new(1500);
        tun.push_inbound(vec![1, 2, 3]);
        tun.push_inbound(vec![4, 5]);

        let mut buf = [0u8; 16];
        let n = tun.try_read_frame(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
        let n = tun.try_read_frame(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..n], &[4, 5]);
        assert!(tun.try_read_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn collects_written_frames() {
        let mut tun = MemoryTun::new(1500);
        tun.write_frame(&[9, 9]).unwrap();
        assert_eq!(tun.outbound, vec![vec![9, 9]]);
    }
}
