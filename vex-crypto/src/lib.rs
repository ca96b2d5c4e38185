#![forbid(unsafe_code)]

pub mod aead;
pub mod error;
pub mod method;
pub mod session;

pub use aead::{expand_nonce, handshake_mac, AeadCipher, AeadKey, AeadNonce, HANDSHAKE_MAC_LEN};
pub use error::{Error, Result};
pub use method::{AeadMethod, Method, NullMethod, COMMON_HEADBYTES, FLAG_HANDSHAKE};
pub use session::{increment_nonce, Millis, MethodSession, NONCE_BYTES};
