//! Cryptographic operations for self-decrypting code
//!
//! Two encryption domains share the primitives in this module:
//! - **Managed units**: `key = SHA-256(ser(secret)) XOR SHA-256(ser(unit id))`,
//!   the first 16 bytes key AES-128-CTR with a zero IV over the unit image.
//! - **Native routines**: a random 16-byte key per routine, embedded in the
//!   exported symbol name, keys AES-128-CTR over the routine's compiled bytes.
//!
//! Guards compare against `SHA-1(ser(secret))` instead of the secret itself.
//!
//! Serialization of guard values:
//! - boolean, byte, short, char, int: 4-byte big-endian int
//! - long: 8-byte big-endian
//! - text: UTF-8 bytes
//! - type name: UTF-8 bytes of the dotted class name

use crate::ir::{Constant, Type};
use crate::{SdcError, SdcResult};
use aes::cipher::{generic_array::GenericArray, KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

// ============================================================================
// Constants
// ============================================================================

/// AES-128 key size in bytes
pub const KEY_LEN: usize = 16;

/// CTR initialization vector, always zero
pub const ZERO_IV: [u8; 16] = [0u8; 16];

/// SHA-1 digest size used by guard checks
pub const GUARD_DIGEST_LEN: usize = 20;

/// SHA-256 digest size used for key derivation
pub const DERIVED_LEN: usize = 32;

// ============================================================================
// Guard values
// ============================================================================

/// A secret compared against at a guard, in serializable form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuardValue {
    Int(i32),
    Long(i64),
    Text(String),
    TypeName(String),
}

impl GuardValue {
    /// Guard value for `constant` compared against a local of type `ty`.
    ///
    /// Returns `None` for combinations the runtime could not reproduce from
    /// the boxed compared value.
    pub fn from_constant(ty: &Type, constant: &Constant) -> Option<Self> {
        match (ty, constant) {
            (Type::Long, Constant::Long(v)) => Some(GuardValue::Long(*v)),
            (Type::Long, Constant::Int(v)) => Some(GuardValue::Long(i64::from(*v))),
            (t, Constant::Int(v)) if t.is_int_like() => Some(GuardValue::Int(*v)),
            (Type::Object(name), Constant::Str(s)) if name == crate::ir::STRING_CLASS => {
                Some(GuardValue::Text(s.clone()))
            }
            (Type::Object(name), Constant::Class(c)) if name == crate::ir::CLASS_CLASS => {
                Some(GuardValue::TypeName(c.clone()))
            }
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            GuardValue::Int(v) => v.to_be_bytes().to_vec(),
            GuardValue::Long(v) => v.to_be_bytes().to_vec(),
            GuardValue::Text(s) | GuardValue::TypeName(s) => s.as_bytes().to_vec(),
        }
    }
}

// ============================================================================
// Digests and key derivation
// ============================================================================

/// SHA-1 of the serialized guard value
pub fn guard_digest(value: &GuardValue) -> [u8; GUARD_DIGEST_LEN] {
    Sha1::digest(value.to_bytes()).into()
}

/// Constant-time comparison of a guard value against an embedded digest
pub fn matches_digest(value: &GuardValue, digest: &[u8]) -> bool {
    let actual = guard_digest(value);
    if digest.len() != actual.len() {
        return false;
    }
    actual
        .iter()
        .zip(digest.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// `SHA-256(ser(secret)) XOR SHA-256(ser(unit id))`
pub fn derive_key(unit_id: &str, secret: &GuardValue) -> [u8; DERIVED_LEN] {
    let a: [u8; DERIVED_LEN] = Sha256::digest(secret.to_bytes()).into();
    let b: [u8; DERIVED_LEN] = Sha256::digest(unit_id.as_bytes()).into();
    let mut key = [0u8; DERIVED_LEN];
    for (k, (x, y)) in key.iter_mut().zip(a.iter().zip(b.iter())) {
        *k = x ^ y;
    }
    key
}

/// AES key for a unit: the first 16 bytes of [`derive_key`]
pub fn unit_key(unit_id: &str, secret: &GuardValue) -> [u8; KEY_LEN] {
    let derived = derive_key(unit_id, secret);
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&derived[..KEY_LEN]);
    key
}

/// Fresh random key for a native routine
pub fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

// ============================================================================
// Stream cipher
// ============================================================================

/// XOR `data` in place with the AES-128-CTR keystream (zero IV).
///
/// Encryption and decryption are the same operation.
pub fn apply_keystream(key: &[u8; KEY_LEN], data: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(GenericArray::from_slice(key), GenericArray::from_slice(&ZERO_IV));
    cipher.apply_keystream(data);
}

/// Encrypt a copy of `data`
pub fn encrypt(key: &[u8; KEY_LEN], data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    apply_keystream(key, &mut out);
    out
}

/// Decrypt a copy of `data`
pub fn decrypt(key: &[u8; KEY_LEN], data: &[u8]) -> Vec<u8> {
    encrypt(key, data)
}

// ============================================================================
// Gate checksum
// ============================================================================

/// XOR-fold `data` into four bytes, assembled little-endian.
pub fn hash_bytes(data: &[u8]) -> i32 {
    let mut hash = [0u8; 4];
    for (i, b) in data.iter().enumerate() {
        hash[i % 4] ^= b;
    }
    i32::from_le_bytes(hash)
}

/// Checksum of `count` bytes at `offset`; `None` if the range is out of bounds
pub fn hash_range(data: &[u8], offset: usize, count: usize) -> Option<i32> {
    let end = offset.checked_add(count)?;
    data.get(offset..end).map(hash_bytes)
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Upper-case hex, as embedded in native symbol names
pub fn hex_upper(bytes: &[u8]) -> String {
    hex::encode_upper(bytes)
}

/// Hex decode a 16-byte key
pub fn key_from_hex(s: &str) -> SdcResult<[u8; KEY_LEN]> {
    let bytes =
        hex::decode(s).map_err(|e| SdcError::InvalidKey(format!("Invalid hex key {}: {}", s, e)))?;
    bytes.as_slice().try_into().map_err(|_| {
        SdcError::InvalidKey(format!(
            "Key must be {} bytes, got {}",
            KEY_LEN,
            bytes.len()
        ))
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_value_serialization() {
        assert_eq!(GuardValue::Int(0xBEEF).to_bytes(), vec![0, 0, 0xBE, 0xEF]);
        assert_eq!(GuardValue::Long(-1).to_bytes(), vec![0xFF; 8]);
        assert_eq!(GuardValue::Text("hé".into()).to_bytes(), "hé".as_bytes());
        assert_eq!(
            GuardValue::TypeName("a.B".into()).to_bytes(),
            b"a.B".to_vec()
        );
    }

    #[test]
    fn test_from_constant_follows_compared_type() {
        assert_eq!(
            GuardValue::from_constant(&Type::Int, &Constant::Int(42)),
            Some(GuardValue::Int(42))
        );
        assert_eq!(
            GuardValue::from_constant(&Type::Long, &Constant::Int(42)),
            Some(GuardValue::Long(42))
        );
        assert_eq!(
            GuardValue::from_constant(&Type::Char, &Constant::Int(97)),
            Some(GuardValue::Int(97))
        );
        assert_eq!(
            GuardValue::from_constant(&Type::string(), &Constant::Str("pw".into())),
            Some(GuardValue::Text("pw".into()))
        );
        assert_eq!(
            GuardValue::from_constant(&Type::object("a.Thing"), &Constant::Str("pw".into())),
            None
        );
        assert_eq!(GuardValue::from_constant(&Type::Int, &Constant::Null), None);
    }

    #[test]
    fn test_guard_digest_is_sha1() {
        // SHA-1("abc")
        let digest = guard_digest(&GuardValue::Text("abc".into()));
        assert_eq!(
            hex::encode(digest),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert!(matches_digest(&GuardValue::Text("abc".into()), &digest));
        assert!(!matches_digest(&GuardValue::Text("abd".into()), &digest));
        assert!(!matches_digest(&GuardValue::Text("abc".into()), &digest[..19]));
    }

    #[test]
    fn test_derive_key_mixes_both_inputs() {
        let secret = GuardValue::Int(0xBEEF);
        let k1 = derive_key("a.B_f_1", &secret);
        assert_eq!(k1, derive_key("a.B_f_1", &secret));
        assert_ne!(k1, derive_key("a.B_f_2", &secret));
        assert_ne!(k1, derive_key("a.B_f_1", &GuardValue::Int(0xBEEE)));
        assert_eq!(&unit_key("a.B_f_1", &secret)[..], &k1[..KEY_LEN]);
    }

    #[test]
    fn test_keystream_roundtrip_and_ctr_layout() {
        let key = [7u8; KEY_LEN];
        let plain: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let sealed = encrypt(&key, &plain);
        assert_ne!(sealed, plain);
        assert_eq!(decrypt(&key, &sealed), plain);

        // CTR is a stream mode: a prefix encrypts to a prefix
        let short = encrypt(&key, &plain[..37]);
        assert_eq!(short, sealed[..37]);
    }

    #[test]
    fn test_aes128_ctr_known_answer() {
        // AES-128(key=0, block=0) = 66e94bd4ef8a2c3b884cfa59ca342b2e
        let mut block = [0u8; 16];
        apply_keystream(&[0u8; KEY_LEN], &mut block);
        assert_eq!(hex::encode(block), "66e94bd4ef8a2c3b884cfa59ca342b2e");
    }

    #[test]
    fn test_hash_bytes_xor_fold() {
        assert_eq!(hash_bytes(&[]), 0);
        assert_eq!(hash_bytes(&[1, 2, 3, 4]), 0x04030201);
        assert_eq!(hash_bytes(&[1, 2, 3, 4, 1]), 0x04030200);
        assert_eq!(hash_range(&[9, 1, 2, 3, 4], 1, 4), Some(0x04030201));
        assert_eq!(hash_range(&[1, 2], 1, 4), None);
    }

    #[test]
    fn test_hex_keys() {
        let key = random_key();
        let hex = hex_upper(&key);
        assert_eq!(hex.len(), 32);
        assert_eq!(hex, hex.to_uppercase());
        assert_eq!(key_from_hex(&hex).unwrap(), key);
        assert!(key_from_hex("ABCD").is_err());
        assert!(key_from_hex("zz").is_err());
    }
}
