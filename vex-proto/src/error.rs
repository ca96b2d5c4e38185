use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("short packet")]
    ShortPacket,
    #[error("malformed tlv")]
    MalformedTlv,
    #[error("unknown handshake type")]
    UnknownHandshakeType,
    #[error("no floating slot available")]
    NoFloatingSlot,
    #[error("peer not found")]
    UnknownPeer,
    #[error("auth failure")]
    AuthFailure,
}
