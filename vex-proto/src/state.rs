//! Protocol state machine (spec §4.7): drives a peer through
//! `WAIT -> HANDSHAKE -> ESTABLISHED`, handles rekey/supersede, and the
//! promotion of a temporary peer into a floating permanent one.

use vex_crypto::MethodSession;

use crate::peer::{Peer, PeerState};

pub type Millis = u64;

/// Exponential handshake retransmit backoff, 2s/4s/8s/... capped (spec
/// §4.7: "conventional: 2, 4, 8 ... seconds up to a cap").
pub const RETRANSMIT_CAP_MS: Millis = 60_000;
/// Give up and fall back to WAIT after this many unanswered retransmits.
pub const MAX_HANDSHAKE_ATTEMPTS: u32 = 6;

pub fn retransmit_delay_ms(attempt: u32) -> Millis {
    let shift = attempt.min(20);
    (2_000u64.saturating_mul(1u64 << shift)).min(RETRANSMIT_CAP_MS)
}

/// The method session(s) associated with an established or handshaking
/// peer, plus retry bookkeeping while in HANDSHAKE.
pub struct ProtocolState {
    pub method_name: String,
    pub session: Option<MethodSession>,
    /// Kept around to decrypt in-flight packets until its `valid_till`
    /// after a rekey completes (spec §4.7).
    pub old_session: Option<MethodSession>,
    pub handshake_attempts: u32,
    /// An INIT has been sent and no REPLY/FINISH has completed it yet.
    /// Needed because a rekey never leaves `PeerState::Established`, so
    /// `PeerState` alone can't tell a fresh send from a retransmit.
    pub handshake_pending: bool,
}

impl ProtocolState {
    pub fn new(method_name: impl Into<String>) -> Self {
        Self {
            method_name: method_name.into(),
            session: None,
            old_session: None,
            handshake_attempts: 0,
            handshake_pending: false,
        }
    }
}

/// Move `peer` into an active handshake, carrying forward any existing
/// session. Callers that originate a handshake rather than respond to one
/// must reject temporary peers themselves (spec §4.7: "a temporary peer
/// never initiates") — a responder accepting an incoming INIT on a
/// freshly-created temporary peer still needs this to succeed.
pub fn start_handshake(peer: &mut Peer, method_name: &str) -> bool {
    // A rekey (peer already ESTABLISHED) starts a new handshake without
    // leaving ESTABLISHED (spec §4.7); any other starting point moves to
    // HANDSHAKE.
    if peer.state != PeerState::Established {
        peer.state = PeerState::Handshake;
    }
    let attempts = peer
        .protocol_state
        .as_ref()
        .map(|p| p.handshake_attempts)
        .unwrap_or(0);
    let mut state = ProtocolState::new(method_name);
    state.handshake_attempts = attempts;
    state.handshake_pending = true;
    // Preserve an established session across a rekey attempt so in-flight
    // decrypts keep working if the rekey fails and we fall back.
    if let Some(prev) = peer.protocol_state.take() {
        state.session = prev.session;
        state.old_session = prev.old_session;
    }
    peer.protocol_state = Some(state);
    true
}

/// A handshake retransmit timer fired. Returns `true` if another
/// retransmit should be sent, `false` if attempts are exhausted and the
/// peer must be reset back to WAIT (spec §4.7).
pub fn handshake_timeout(peer: &mut Peer) -> bool {
    let Some(state) = peer.protocol_state.as_mut() else {
        return false;
    };
    state.handshake_attempts += 1;
    state.handshake_attempts < MAX_HANDSHAKE_ATTEMPTS
}

/// A handshake completed successfully. If the peer was already
/// ESTABLISHED (this is a rekey), the old session is marked superseded
/// rather than dropped outright.
pub fn complete_handshake(
    peer: &mut Peer,
    initiator: bool,
    now: Millis,
    key_valid: Millis,
    key_valid_old: Millis,
) {
    let new_session = MethodSession::new(initiator, now, key_valid);
    let state = peer
        .protocol_state
        .get_or_insert_with(|| ProtocolState::new(""));

    if let Some(mut old) = state.session.take() {
        old.mark_superseded(now, key_valid_old);
        state.old_session = Some(old);
    }
    state.session = Some(new_session);
    state.handshake_attempts = 0;
    state.handshake_pending = false;
    peer.state = PeerState::Established;
    peer.last_seen = now;
}

/// Whether the peer's active session requests a refresh, meaning a new
/// handshake should be started without leaving ESTABLISHED (spec §4.7).
pub fn wants_refresh(peer: &Peer, now: Millis) -> bool {
    peer.state == PeerState::Established
        && peer
            .protocol_state
            .as_ref()
            .and_then(|s| s.session.as_ref())
            .map(|s| s.is_initiator() && s.want_refresh(now))
            .unwrap_or(false)
}

/// Drop the old (superseded) session once its validity window has
/// elapsed.
pub fn expire_old_session(peer: &mut Peer, now: Millis) {
    if let Some(state) = peer.protocol_state.as_mut() {
        if let Some(old) = &state.old_session {
            if !old.is_valid(now) {
                state.old_session = None;
            }
        }
    }
}
