//! Abstract AEAD method layer (spec §4.6): the daemon treats a method as an
//! opaque value with a stable name, packet-size/overhead accounting, and
//! encrypt/decrypt entry points. The header it prepends is
//! `flags:u8 || nonce:u48` (`COMMON_HEADBYTES` = 7, per
//! `methods/common.h`); any MAC tag lives in the method's tail space.

use vex_core::Buffer;

use crate::aead::{expand_nonce, AeadCipher, AeadKey};
use crate::error::Result;
use crate::session::NONCE_BYTES;

/// `flags:u8` + `nonce:u48`.
pub const COMMON_HEADBYTES: usize = 1 + NONCE_BYTES;

/// Handshake-indicator flag bit (spec §6, "Wire: data packet").
pub const FLAG_HANDSHAKE: u8 = 1;

pub trait Method: Send + Sync {
    /// Stable wire name, as advertised in handshake record 12/14.
    fn name(&self) -> &str;

    fn max_packet_size(&self, mtu: u16) -> usize {
        mtu as usize
    }

    /// Bytes this method needs before the payload when encrypting.
    fn head_space(&self) -> usize {
        COMMON_HEADBYTES
    }

    /// Bytes this method needs after the payload when encrypting (AEAD tag).
    fn tail_space(&self) -> usize {
        0
    }

    /// Whether the daemon must enforce at most one floating peer for this
    /// method (spec §4.6: the `null` method's `n_floating <= 1` rule).
    fn single_floating_only(&self) -> bool {
        false
    }

    fn encrypt(
        &self,
        nonce: &[u8; NONCE_BYTES],
        flags: u8,
        buffer: &mut Buffer,
    ) -> Result<()>;

    /// Decrypt in place, returning the nonce and flags read from the
    /// packet header.
    fn decrypt(&self, buffer: &mut Buffer) -> Result<([u8; NONCE_BYTES], u8)>;
}

/// No-op method used for testing (spec §4.6): packages the payload
/// unchanged and only prepends the common header so nonce/flags still
/// round-trip, matching `method_null.c`'s behavior of calling the receive
/// path directly with the buffer untouched.
pub struct NullMethod;

impl Method for NullMethod {
    fn name(&self) -> &str {
        "null"
    }

    fn tail_space(&self) -> usize {
        0
    }

    fn single_floating_only(&self) -> bool {
        true
    }

    fn encrypt(&self, nonce: &[u8; NONCE_BYTES], flags: u8, buffer: &mut Buffer) -> Result<()> {
        buffer.pull_head_from(nonce, NONCE_BYTES);
        let flag_byte = [flags];
        buffer.pull_head_from(&flag_byte, 1);
        Ok(())
    }

    fn decrypt(&self, buffer: &mut Buffer) -> Result<([u8; NONCE_BYTES], u8)> {
        let mut flags = [0u8; 1];
        buffer.push_head_to(&mut flags, 1);
        let mut nonce = [0u8; NONCE_BYTES];
        buffer.push_head_to(&mut nonce, NONCE_BYTES);
        Ok((nonce, flags[0]))
    }
}

/// ChaCha20-Poly1305 AEAD method (the one concrete construction this
/// workspace ships, spec §1 treats all others as opaque peers of this one).
pub struct AeadMethod {
    name: String,
    cipher: AeadCipher,
}

impl AeadMethod {
    pub fn new(name: impl Into<String>, key: AeadKey) -> Self {
        Self {
            name: name.into(),
            cipher: AeadCipher::new(&key),
        }
    }
}

impl Method for AeadMethod {
    fn name(&self) -> &str {
        &self.name
    }

    fn tail_space(&self) -> usize {
        16
    }

    fn encrypt(&self, nonce: &[u8; NONCE_BYTES], flags: u8, buffer: &mut Buffer) -> Result<()> {
        let aad = [flags];
        let ciphertext = self
            .cipher
            .seal(expand_nonce(nonce), &aad, buffer.as_slice())?;
        // Replace payload with ciphertext (which includes the tag) then
        // prepend the common header.
        let head_space = buffer.head_space();
        let mut fresh = Buffer::alloc(ciphertext.len(), head_space, 0);
        fresh.as_mut_slice().copy_from_slice(&ciphertext);
        fresh.pull_head_from(nonce, NONCE_BYTES);
        fresh.pull_head_from(&[flags], 1);
        *buffer = fresh;
        Ok(())
    }

    fn decrypt(&self, buffer: &mut Buffer) -> Result<([u8; NONCE_BYTES], u8)> {
        let mut flag_byte = [0u8; 1];
        buffer.push_head_to(&mut flag_byte, 1);
        let mut nonce = [0u8; NONCE_BYTES];
        buffer.push_head_to(&mut nonce, NONCE_BYTES);
        let aad = flag_byte;
        let plaintext = self
            .cipher
            .open(expand_nonce(&nonce), &aad, buffer.as_slice())?;
        *buffer = Buffer::from_vec(plaintext);
        Ok((nonce, flag_byte[0]))
    }
}
