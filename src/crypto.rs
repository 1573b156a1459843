//! secp256k1 primitives used for Nostr identities: key generation, public key
//! derivation, SHA-256 hashing and BIP-340 Schnorr signatures.

use rand::RngCore;
use secp256k1::{
    schnorr::Signature, Keypair, Message, Parity, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey,
};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Generate a random 32-byte private key.
///
/// Random bytes outside `[1, n)` are rejected and redrawn.
pub fn generate_private_key() -> [u8; 32] {
    let mut rng = rand::thread_rng();
    loop {
        let mut candidate = [0u8; 32];
        rng.fill_bytes(&mut candidate);
        if SecretKey::from_slice(&candidate).is_ok() {
            return candidate;
        }
    }
}

/// Derive the 33-byte compressed public key.
pub fn public_key(private_key: &[u8; 32]) -> Result<[u8; 33]> {
    let secp = Secp256k1::signing_only();
    let sk = SecretKey::from_slice(private_key)?;
    Ok(PublicKey::from_secret_key(&secp, &sk).serialize())
}

/// Derive the 32-byte x-only public key (compressed key without its parity byte).
pub fn x_only_public_key(private_key: &[u8; 32]) -> Result<[u8; 32]> {
    let compressed = public_key(private_key)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&compressed[1..]);
    Ok(out)
}

/// SHA-256 digest of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Return the scalar whose public key has an even y-coordinate.
///
/// The caller's key is left untouched; a negated copy is returned when the
/// derived point has odd parity.
fn even_y_secret(private_key: &[u8; 32]) -> Result<SecretKey> {
    let secp = Secp256k1::signing_only();
    let sk = SecretKey::from_slice(private_key)?;
    let (_, parity) = sk.x_only_public_key(&secp);
    Ok(match parity {
        Parity::Odd => sk.negate(),
        Parity::Even => sk,
    })
}

/// Schnorr-sign a 32-byte hash.
pub fn sign(private_key: &[u8; 32], hash: &[u8; 32]) -> Result<[u8; 64]> {
    let secp = Secp256k1::signing_only();
    let sk = even_y_secret(private_key)?;
    let keypair = Keypair::from_secret_key(&secp, &sk);
    let msg = Message::from_digest(*hash);
    let sig = secp.sign_schnorr_no_aux_rand(&msg, &keypair);
    Ok(sig.serialize())
}

/// Verify a Schnorr signature over `hash`.
///
/// `public_key` may be x-only (32 bytes) or compressed (33 bytes). Any malformed
/// input yields `false`.
pub fn verify(signature: &[u8], hash: &[u8; 32], public_key: &[u8]) -> bool {
    let x_only = match public_key.len() {
        32 => public_key,
        33 => &public_key[1..],
        _ => return false,
    };
    let Ok(pk) = XOnlyPublicKey::from_slice(x_only) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    let secp = Secp256k1::verification_only();
    let msg = Message::from_digest(*hash);
    secp.verify_schnorr(&sig, &msg, &pk).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Curve order minus one, the largest valid scalar.
    const N_MINUS_ONE: &str = "fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364140";

    fn key_with_parity(want_odd: bool) -> [u8; 32] {
        for i in 1u8..=255 {
            let sk = [i; 32];
            let compressed = public_key(&sk).unwrap();
            if (compressed[0] == 0x03) == want_odd {
                return sk;
            }
        }
        panic!("no key with requested parity");
    }

    #[test]
    fn generated_keys_are_valid() {
        for _ in 0..8 {
            let sk = generate_private_key();
            assert!(SecretKey::from_slice(&sk).is_ok());
        }
    }

    #[test]
    fn x_only_drops_prefix() {
        let sk = [7u8; 32];
        let full = public_key(&sk).unwrap();
        assert!(full[0] == 0x02 || full[0] == 0x03);
        assert_eq!(&x_only_public_key(&sk).unwrap()[..], &full[1..]);
    }

    #[test]
    fn rejects_zero_and_overflowing_scalars() {
        assert!(public_key(&[0u8; 32]).is_err());
        assert!(public_key(&[0xffu8; 32]).is_err());
        let mut max = [0u8; 32];
        max.copy_from_slice(&hex::decode(N_MINUS_ONE).unwrap());
        assert!(public_key(&max).is_ok());
    }

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn odd_parity_key_signs_verifiably() {
        let sk = key_with_parity(true);
        let hash = sha256(b"odd");
        let sig = sign(&sk, &hash).unwrap();
        let pk = x_only_public_key(&sk).unwrap();
        assert!(verify(&sig, &hash, &pk));
        // compressed form is accepted too
        assert!(verify(&sig, &hash, &public_key(&sk).unwrap()));
        // the caller's key was not replaced by its negation
        assert_eq!(public_key(&sk).unwrap()[0], 0x03);
    }

    #[test]
    fn both_parity_equivalent_scalars_verify_under_same_x_only_key() {
        let sk = key_with_parity(true);
        let negated = SecretKey::from_slice(&sk).unwrap().negate().secret_bytes();
        let hash = sha256(b"same point");
        let pk = x_only_public_key(&sk).unwrap();
        assert_eq!(pk, x_only_public_key(&negated).unwrap());
        assert!(verify(&sign(&sk, &hash).unwrap(), &hash, &pk));
        assert!(verify(&sign(&negated, &hash).unwrap(), &hash, &pk));
    }

    #[test]
    fn verify_fails_for_other_hash_or_key() {
        let sk = key_with_parity(false);
        let hash = sha256(b"message");
        let sig = sign(&sk, &hash).unwrap();
        assert!(!verify(&sig, &sha256(b"other"), &x_only_public_key(&sk).unwrap()));
        let other = x_only_public_key(&[9u8; 32]).unwrap();
        assert!(!verify(&sig, &hash, &other));
        assert!(!verify(&sig[..10], &hash, &other));
        assert!(!verify(&sig, &hash, &other[..5]));
    }
}
