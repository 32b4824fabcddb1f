// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! WireGuard key material: X25519 keypairs in WG's base64 text form.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

pub const KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("random number generator failed: {0}")]
    Rng(#[from] rand::Error),

    #[error("key is not valid base64")]
    Encoding(#[from] base64::DecodeError),

    #[error("key must decode to {KEY_LEN} bytes, got {0}")]
    Length(usize),
}

#[derive(Clone, PartialEq, Eq)]
pub struct Keypair {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

pub fn encode_key(bytes: &[u8; KEY_LEN]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_key(text: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let raw = BASE64.decode(text.trim())?;
    raw.as_slice()
        .try_into()
        .map_err(|_| KeyError::Length(raw.len()))
}

fn clamp(bytes: &mut [u8; KEY_LEN]) {
    bytes[0] &= 248;
    bytes[31] &= 127;
    bytes[31] |= 64;
}

fn public_from_bytes(bytes: [u8; KEY_LEN]) -> String {
    let secret = StaticSecret::from(bytes);
    encode_key(PublicKey::from(&secret).as_bytes())
}

/// Equivalent of `wg genkey | tee privatekey | wg pubkey`.
#[tracing::instrument]
pub fn generate_keypair() -> Result<Keypair, KeyError> {
    let mut bytes = [0u8; KEY_LEN];
    OsRng.try_fill_bytes(&mut bytes)?;
    clamp(&mut bytes);

    Ok(Keypair {
        private_key: encode_key(&bytes),
        public_key: public_from_bytes(bytes),
    })
}

#[tracing::instrument(skip(private_key))]
pub fn derive_public(private_key: &str) -> Result<String, KeyError> {
    let mut bytes = decode_key(private_key)?;
    clamp(&mut bytes);
    Ok(public_from_bytes(bytes))
}

pub fn validate_private(private_key: &str) -> Result<(), KeyError> {
    decode_key(private_key).map(|_| ())
}

pub fn validate_public(public_key: &str) -> Result<(), KeyError> {
    decode_key(public_key).map(|_| ())
}

/// Builds a keypair from a caller-supplied private key.
pub fn keypair_from_private(private_key: &str) -> Result<Keypair, KeyError> {
    let bytes = decode_key(private_key)?;
    Ok(Keypair {
        private_key: encode_key(&bytes),
        public_key: derive_public(private_key)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    fn hex32(s: &str) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).unwrap();
        }
        out
    }

    #[test]
    fn derives_rfc7748_alice_public_key() {
        let private = encode_key(&hex32(
            "77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a",
        ));
        let expected = encode_key(&hex32(
            "8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a",
        ));
        assert_eq!(derive_public(&private).unwrap(), expected);
    }

    #[test]
    fn generated_keys_are_wg_shaped() {
        let pair = generate_keypair().unwrap();
        assert_eq!(pair.private_key.len(), 44);
        assert_eq!(pair.public_key.len(), 44);

        let raw = decode_key(&pair.private_key).unwrap();
        assert_eq!(raw[0] & 7, 0);
        assert_eq!(raw[31] & 0xc0, 0x40);
        assert_eq!(derive_public(&pair.private_key).unwrap(), pair.public_key);
    }

    #[test]
    fn generated_keys_differ() {
        let a = generate_keypair().unwrap();
        let b = generate_keypair().unwrap();
        assert_ne!(a.private_key, b.private_key);
    }

    #[test_case("" ; "empty")]
    #[test_case("not base64!!" ; "bad alphabet")]
    #[test_case("AAAA" ; "too short")]
    #[test_case("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA" ; "too long")]
    fn rejects_malformed_keys(input: &str) {
        assert!(validate_private(input).is_err());
        assert!(derive_public(input).is_err());
    }

    #[test]
    fn debug_hides_private_key() {
        let pair = generate_keypair().unwrap();
        let shown = format!("{pair:?}");
        assert!(!shown.contains(&pair.private_key));
        assert!(shown.contains(&pair.public_key));
    }

    proptest! {
        #[test]
        fn derive_is_deterministic_and_clamp_invariant(bytes in any::<[u8; 32]>()) {
            let private = encode_key(&bytes);
            let mut clamped = bytes;
            clamp(&mut clamped);
            let first = derive_public(&private).unwrap();
            prop_assert_eq!(&first, &derive_public(&private).unwrap());
            prop_assert_eq!(first, derive_public(&encode_key(&clamped)).unwrap());
        }
    }
}
