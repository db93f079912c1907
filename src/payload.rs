//! Sealed unit images
//!
//! A unit travels inside the retained code as an encrypted byte array:
//!
//! ```text
//! AES-128-CTR(unit_key(id, secret), "SDCU" || bincode(UnitImage))
//! ```
//!
//! The magic prefix lets the loader tell a wrong secret from a corrupt image.

use crate::crypto::{decrypt, encrypt, unit_key, GuardValue};
use crate::error::LoaderError;
use crate::ir::Class;
use crate::SdcResult;
use serde::{Deserialize, Serialize};

/// Plaintext prefix of every unit image
pub const MAGIC: &[u8; 4] = b"SDCU";

/// Current image layout
pub const IMAGE_VERSION: u32 = 1;

/// Decrypted contents of a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitImage {
    pub version: u32,
    pub id: String,
    pub class: Class,
}

impl UnitImage {
    pub fn new(id: impl Into<String>, class: Class) -> Self {
        Self {
            version: IMAGE_VERSION,
            id: id.into(),
            class,
        }
    }

    /// Serialized plaintext, magic included
    pub fn to_bytes(&self) -> SdcResult<Vec<u8>> {
        let mut out = MAGIC.to_vec();
        out.extend(bincode::serialize(self)?);
        Ok(out)
    }

    /// Parse serialized plaintext produced by [`UnitImage::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        let body = bytes
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| "bad magic".to_string())?;
        bincode::deserialize(body).map_err(|e| e.to_string())
    }
}

/// Serialize and encrypt `class` as unit `id` under `secret`.
pub fn seal(id: &str, class: &Class, secret: &GuardValue) -> SdcResult<Vec<u8>> {
    let plain = UnitImage::new(id, class.clone()).to_bytes()?;
    let sealed = encrypt(&unit_key(id, secret), &plain);
    tracing::debug!("Sealed unit {} ({} bytes)", id, sealed.len());
    Ok(sealed)
}

/// Decrypt and parse the payload of unit `id`.
pub fn open(id: &str, payload: &[u8], secret: &GuardValue) -> Result<UnitImage, LoaderError> {
    let fail = |reason: String| LoaderError::Decrypt {
        unit: id.to_string(),
        reason,
    };
    let plain = decrypt(&unit_key(id, secret), payload);
    let image = UnitImage::from_bytes(&plain).map_err(fail)?;
    if image.version != IMAGE_VERSION {
        return Err(fail(format!("unsupported image version {}", image.version)));
    }
    if image.id != id {
        return Err(fail(format!("image belongs to unit {}", image.id)));
    }
    Ok(image)
}
