//! Nostr identity key pair.

use std::fmt;

use crate::{
    crypto,
    error::{Error, Result},
};

/// Private key plus its derived public keys.
///
/// Two key pairs are equal when their private key bytes are equal.
#[derive(Clone)]
pub struct KeyPair {
    private_key: [u8; 32],
    public_key: [u8; 33],
}

impl KeyPair {
    /// Create a key pair from a fresh random private key.
    pub fn generate() -> Self {
        loop {
            if let Ok(kp) = Self::from_bytes(crypto::generate_private_key()) {
                return kp;
            }
        }
    }

    /// Build a key pair from raw private key bytes.
    pub fn from_bytes(private_key: [u8; 32]) -> Result<Self> {
        let public_key =
            crypto::public_key(&private_key).map_err(|e| Error::InvalidKey(e.to_string()))?;
        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Parse a 64-character hex private key.
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_key.trim(), &mut bytes)?;
        Self::from_bytes(bytes)
    }

    pub fn private_key(&self) -> &[u8; 32] {
        &self.private_key
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.private_key)
    }

    /// Compressed public key (33 bytes, parity prefix included).
    pub fn public_key(&self) -> &[u8; 33] {
        &self.public_key
    }

    /// X-only public key used as the protocol identity.
    pub fn x_only_public_key(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.public_key[1..]);
        out
    }

    /// Hex x-only public key, as placed in an event's `pubkey` field.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.x_only_public_key())
    }

    /// Schnorr-sign a 32-byte message hash.
    pub fn sign(&self, hash: &[u8; 32]) -> Result<[u8; 64]> {
        crypto::sign(&self.private_key, hash)
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.private_key == other.private_key
    }
}

impl Eq for KeyPair {}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let kp = KeyPair::generate();
        let again = KeyPair::from_private_key_hex(&kp.private_key_hex()).unwrap();
        assert_eq!(kp, again);
        assert_eq!(kp.public_key_hex(), again.public_key_hex());
        assert_eq!(kp.public_key_hex().len(), 64);
    }

    #[test]
    fn rejects_bad_hex() {
        assert!(matches!(
            KeyPair::from_private_key_hex("abc"),
            Err(Error::Hex(_))
        ));
        assert!(matches!(
            KeyPair::from_private_key_hex(&"zz".repeat(32)),
            Err(Error::Hex(_))
        ));
        assert!(matches!(
            KeyPair::from_private_key_hex(&"00".repeat(16)),
            Err(Error::Hex(_))
        ));
        assert!(matches!(
            KeyPair::from_private_key_hex(&"00".repeat(32)),
            Err(Error::InvalidKey(_))
        ));
    }

    #[test]
    fn equality_uses_private_key() {
        let a = KeyPair::from_bytes([3u8; 32]).unwrap();
        let b = KeyPair::from_bytes([3u8; 32]).unwrap();
        let c = KeyPair::from_bytes([4u8; 32]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn debug_hides_private_key() {
        let kp = KeyPair::from_bytes([5u8; 32]).unwrap();
        let shown = format!("{kp:?}");
        assert!(!shown.contains(&kp.private_key_hex()));
        assert!(shown.contains(&kp.public_key_hex()));
    }
}
