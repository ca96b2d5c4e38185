#![forbid(unsafe_code)]

pub mod error;
pub mod handshake;
pub mod mac;
pub mod peer;
pub mod state;
pub mod task;

pub use error::{Error, Result};
pub use handshake::{
    new_error_reply, new_reply, select_method, validate, verify_mac, Records, Validation,
    HANDSHAKE_FINISH, HANDSHAKE_INIT, HANDSHAKE_REPLY, MODE_TAP, MODE_TUN, RECORD_MAX,
    REPLY_MANDATORY_MISSING, REPLY_SUCCESS, REPLY_UNACCEPTABLE_VALUE,
};
pub use mac::{Mac, MacTable};
pub use peer::{Peer, PeerId, PeerState, PeerTable};
pub use state::{
    complete_handshake, expire_old_session, handshake_timeout, retransmit_delay_ms,
    start_handshake, wants_refresh, ProtocolState, MAX_HANDSHAKE_ATTEMPTS, RETRANSMIT_CAP_MS,
};
pub use task::{Task, TaskKind, TaskQueue};
