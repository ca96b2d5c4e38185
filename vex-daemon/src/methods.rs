//! Builds the set of methods a daemon instance offers, keyed by name
//! (spec §4.6 / §9: "the method list is negotiated [...] selected at
//! configuration time, not at compile time").

use std::collections::HashMap;
use std::sync::Arc;

use vex_core::Config;
use vex_crypto::{AeadKey, AeadMethod, Method, NullMethod};

/// Pre-shared key material is taken directly from `config.key` (hex-
/// encoded 32 bytes). The real protocol's key-exchange handshake
/// (`ec25519-fhmqvc` and friends) is out of scope (spec §1); we treat the
/// configured key as a flat pre-shared AEAD key, consistent with the
/// spec's non-goal "no certificate hierarchy; trust is a flat set of
/// pre-shared public keys".
pub fn build_registry(config: &Config) -> HashMap<String, Arc<dyn Method>> {
    let mut registry: HashMap<String, Arc<dyn Method>> = HashMap::new();
    registry.insert("null".to_string(), Arc::new(NullMethod));

    if let Some(bytes) = parse_key_bytes(&config.key) {
        registry.insert(
            "chacha20poly1305".to_string(),
            Arc::new(AeadMethod::new("chacha20poly1305", AeadKey(bytes))),
        );
    }

    registry
}

/// Decode a hex-encoded 32-byte key, used both for the AEAD method
/// registry above and for handshake-MAC signing under `secure_handshakes`.
pub fn parse_key_bytes(hex: &str) -> Option<[u8; 32]> {
    if hex.len() != 64 {
        return None;
    }
    let mut bytes = [0u8; 32];
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let s = std::str::from_utf8(chunk).ok()?;
        bytes[i] = u8::from_str_radix(s, 16).ok()?;
    }
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_method_always_present() {
        let config = Config::default();
        let registry = build_registry(&config);
        assert!(registry.contains_key("null"));
    }

    #[test]
    fn valid_hex_key_registers_aead_method() {
        let mut config = Config::default();
        config.key = "11".repeat(32);
        let registry = build_registry(&config);
        assert!(registry.contains_key("chacha20poly1305"));
    }

    #[test]
    fn malformed_key_is_skipped_not_fatal() {
        let mut config = Config::default();
        config.key = "not-hex".to_string();
        let registry = build_registry(&config);
        assert!(!registry.contains_key("chacha20poly1305"));
    }
}
