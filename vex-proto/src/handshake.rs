//! TLV handshake codec (spec §4.4, §3), grounded on `handshake.c`.
//!
//! Wire format: `reserved:u8=0 || tlv_total_len:u16 LE || reserved:u8=0`
//! followed by concatenated `type:u16 LE || len:u16 LE || value` records.

use std::collections::BTreeMap;
use std::ops::Range;

use vex_crypto::{handshake_mac, HANDSHAKE_MAC_LEN};

use crate::error::{Error, Result};

pub const RECORD_HANDSHAKE_TYPE: u16 = 0;
pub const RECORD_REPLY_CODE: u16 = 1;
pub const RECORD_ERROR_DETAIL: u16 = 2;
pub const RECORD_FLAGS: u16 = 3;
pub const RECORD_MODE: u16 = 4;
pub const RECORD_PROTOCOL_NAME: u16 = 5;
pub const RECORD_MTU: u16 = 11;
pub const RECORD_METHOD_NAME: u16 = 12;
pub const RECORD_VERSION_NAME: u16 = 13;
pub const RECORD_METHOD_LIST: u16 = 14;
pub const RECORD_TLV_MAC: u16 = 15;
pub const RECORD_MAX: u16 = 16;

pub const HANDSHAKE_INIT: u8 = 1;
pub const HANDSHAKE_REPLY: u8 = 2;
pub const HANDSHAKE_FINISH: u8 = 3;

pub const REPLY_SUCCESS: u8 = 0;
pub const REPLY_MANDATORY_MISSING: u8 = 1;
pub const REPLY_UNACCEPTABLE_VALUE: u8 = 2;

pub const MODE_TAP: u8 = 0;
pub const MODE_TUN: u8 = 1;

const HEADER_LEN: usize = 4;

/// A decoded set of TLV records keyed by type; duplicates overwrite
/// (spec §4.4: "duplicates overwrite on decode").
#[derive(Debug, Default, Clone)]
pub struct Records {
    map: BTreeMap<u16, Vec<u8>>,
}

impl Records {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, ty: u16, value: impl Into<Vec<u8>>) {
        self.map.insert(ty, value.into());
    }

    pub fn set_u8(&mut self, ty: u16, value: u8) {
        self.set(ty, vec![value]);
    }

    pub fn set_u16(&mut self, ty: u16, value: u16) {
        self.set(ty, value.to_le_bytes().to_vec());
    }

    /// Indexing a missing record returns zero-length (spec §4.4).
    pub fn get(&self, ty: u16) -> &[u8] {
        self.map.get(&ty).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn has(&self, ty: u16) -> bool {
        self.map.contains_key(&ty)
    }

    pub fn get_u8(&self, ty: u16) -> Option<u8> {
        let v = self.get(ty);
        (v.len() == 1).then(|| v[0])
    }

    pub fn get_u16(&self, ty: u16) -> Option<u16> {
        let v = self.get(ty);
        (v.len() == 2).then(|| u16::from_le_bytes([v[0], v[1]]))
    }

    pub fn get_str(&self, ty: u16) -> Option<&str> {
        std::str::from_utf8(self.get(ty)).ok()
    }

    /// Encode records in insertion/type order into a handshake packet with
    /// the 4-byte header. Any record 15 already present is dropped; use
    /// [`Records::encode_signed`] to produce a MAC-authenticated packet.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for (&ty, value) in &self.map {
            if ty == RECORD_TLV_MAC {
                continue;
            }
            encode_record(&mut body, ty, value);
        }

        let mut packet = Vec::with_capacity(HEADER_LEN + body.len());
        packet.push(0);
        packet.extend_from_slice(&(body.len() as u16).to_le_bytes());
        packet.push(0);
        packet.extend_from_slice(&body);
        packet
    }

    /// Parse records out of a handshake packet, stopping silently at a
    /// short/malformed trailer (spec §4.4: "silently stop at malformed
    /// trailers"). Records with type `>= RECORD_MAX` are ignored.
    pub fn decode(packet: &[u8]) -> Result<Self> {
        if packet.len() < HEADER_LEN {
            return Err(Error::ShortPacket);
        }
        let tlv_len = u16::from_le_bytes([packet[1], packet[2]]) as usize;
        let end = HEADER_LEN + tlv_len.min(packet.len().saturating_sub(HEADER_LEN));

        let mut records = Records::new();
        let mut ptr = HEADER_LEN;
        while ptr + 4 <= end {
            let ty = u16::from_le_bytes([packet[ptr], packet[ptr + 1]]);
            let len = u16::from_le_bytes([packet[ptr + 2], packet[ptr + 3]]) as usize;
            if ptr + 4 + len > end {
                break;
            }
            if ty < RECORD_MAX {
                records.set(ty, packet[ptr + 4..ptr + 4 + len].to_vec());
            }
            ptr += 4 + len;
        }
        Ok(records)
    }

    /// Encode with a trailing MAC record (type 15), authenticated by
    /// `key` under `secure_handshakes` (spec §4.4: "MAC ... is the last
    /// record appended and covers the entire packet with that record's
    /// value-region zeroed during computation").
    pub fn encode_signed(&self, key: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        for (&ty, value) in &self.map {
            if ty == RECORD_TLV_MAC {
                continue;
            }
            encode_record(&mut body, ty, value);
        }
        encode_record(&mut body, RECORD_TLV_MAC, &[0u8; HANDSHAKE_MAC_LEN]);

        let mut packet = Vec::with_capacity(HEADER_LEN + body.len());
        packet.push(0);
        packet.extend_from_slice(&(body.len() as u16).to_le_bytes());
        packet.push(0);
        packet.extend_from_slice(&body);

        let tag = handshake_mac(key, &packet);
        let tag_start = packet.len() - HANDSHAKE_MAC_LEN;
        packet[tag_start..].copy_from_slice(&tag);
        packet
    }
}

/// Locate record `target_ty`'s value region in a raw handshake packet,
/// mirroring `Records::decode`'s scan but returning a byte range instead
/// of a copy (used to zero the MAC's own value-region before recomputing
/// it).
fn locate_record(packet: &[u8], target_ty: u16) -> Option<Range<usize>> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    let tlv_len = u16::from_le_bytes([packet[1], packet[2]]) as usize;
    let end = HEADER_LEN + tlv_len.min(packet.len().saturating_sub(HEADER_LEN));

    let mut ptr = HEADER_LEN;
    let mut found = None;
    while ptr + 4 <= end {
        let ty = u16::from_le_bytes([packet[ptr], packet[ptr + 1]]);
        let len = u16::from_le_bytes([packet[ptr + 2], packet[ptr + 3]]) as usize;
        if ptr + 4 + len > end {
            break;
        }
        if ty == target_ty {
            found = Some(ptr + 4..ptr + 4 + len);
        }
        ptr += 4 + len;
    }
    found
}

/// Verify a handshake packet's trailing MAC record against `key` (spec
/// §4.4, §7 *AuthFailure*). `false` covers both "no MAC record present"
/// and "tag mismatch" — the caller treats both as drop-silently.
pub fn verify_mac(packet: &[u8], key: &[u8]) -> bool {
    let Some(region) = locate_record(packet, RECORD_TLV_MAC) else {
        return false;
    };
    if region.len() != HANDSHAKE_MAC_LEN {
        return false;
    }
    let tag = packet[region.clone()].to_vec();
    let mut zeroed = packet.to_vec();
    zeroed[region].fill(0);
    handshake_mac(key, &zeroed)[..] == tag[..]
}

fn encode_record(out: &mut Vec<u8>, ty: u16, value: &[u8]) {
    out.extend_from_slice(&ty.to_le_bytes());
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value);
}

/// `new_reply(req, method, with_list)`: builds a success reply (spec
/// §4.4). Under `secure_handshakes`, the initial reply (to a type-1
/// request) omits `method-name` in favor of `method-list` only.
pub fn new_reply(
    req_type: u8,
    mode: u8,
    mtu: u16,
    version_name: &str,
    protocol_name: &str,
    method_name: Option<&str>,
    method_list: Option<&str>,
) -> Records {
    let mut r = Records::new();
    r.set_u8(RECORD_HANDSHAKE_TYPE, req_type + 1);
    r.set_u8(RECORD_REPLY_CODE, REPLY_SUCCESS);
    r.set_u8(RECORD_MODE, mode);
    r.set_u16(RECORD_MTU, mtu);
    r.set(RECORD_VERSION_NAME, version_name.as_bytes());
    r.set(RECORD_PROTOCOL_NAME, protocol_name.as_bytes());
    if let Some(name) = method_name {
        r.set(RECORD_METHOD_NAME, name.as_bytes());
    }
    if let Some(list) = method_list {
        r.set(RECORD_METHOD_LIST, list.as_bytes());
    }
    r
}

/// An error reply carries only handshake-type, reply-code and error-detail
/// (spec §4.4).
pub fn new_error_reply(req_type: u8, reply_code: u8, error_detail: u16) -> Records {
    let mut r = Records::new();
    r.set_u8(RECORD_HANDSHAKE_TYPE, req_type + 1);
    r.set_u8(RECORD_REPLY_CODE, reply_code);
    r.set_u8(RECORD_ERROR_DETAIL, error_detail as u8);
    r
}

/// Pick the method to use: if the peer sent a list, pick the *last* entry
/// also present in `local`, giving the sender precedence over later
/// entries in our own list; otherwise fall back to the named method if we
/// know it (spec §4.4).
pub fn select_method<'a>(
    peer_list: Option<&str>,
    peer_named: Option<&str>,
    local: &'a [&'a str],
) -> Option<&'a str> {
    if let Some(list) = peer_list {
        let mut chosen = None;
        for name in list.split('\0').filter(|s| !s.is_empty()) {
            if let Some(&found) = local.iter().find(|&&l| l == name) {
                chosen = Some(found);
            }
        }
        return chosen;
    }
    if let Some(name) = peer_named {
        return local.iter().find(|&&l| l == name).copied();
    }
    None
}

#[derive(Debug, PartialEq, Eq)]
pub enum Validation {
    Ok,
    ErrorReply { reply_code: u8, error_detail: u16 },
    LogAndDrop,
}

/// Record validation on receive, before dispatch to the protocol state
/// machine (spec §4.4).
pub fn validate(
    records: &Records,
    req_type: u8,
    our_protocol: &str,
    our_mode: u8,
    our_mtu: u16,
    secure_handshakes: bool,
    method_found: bool,
) -> Validation {
    if let Some(proto) = records.get_str(RECORD_PROTOCOL_NAME) {
        if proto != our_protocol {
            return Validation::ErrorReply {
                reply_code: REPLY_UNACCEPTABLE_VALUE,
                error_detail: RECORD_PROTOCOL_NAME,
            };
        }
    }
    if let Some(mode) = records.get_u8(RECORD_MODE) {
        if mode != our_mode {
            return Validation::ErrorReply {
                reply_code: REPLY_UNACCEPTABLE_VALUE,
                error_detail: RECORD_MODE,
            };
        }
    }
    if let Some(mtu) = records.get_u16(RECORD_MTU) {
        let checked = !secure_handshakes || req_type > 1;
        if checked && mtu != our_mtu {
            tracing::warn!(peer_mtu = mtu, our_mtu, "peer MTU mismatch");
        }
    }
    if req_type > 1 {
        match records.get_u8(RECORD_REPLY_CODE) {
            Some(REPLY_SUCCESS) => {}
            _ => return Validation::LogAndDrop,
        }
        if !method_found {
            return Validation::ErrorReply {
                reply_code: REPLY_UNACCEPTABLE_VALUE,
                error_detail: RECORD_METHOD_LIST,
            };
        }
    }
    Validation::Ok
}
