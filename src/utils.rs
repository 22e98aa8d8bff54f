//! Utility functions for record ids and storage keys

use bech32::Bech32m;
use uuid7::{Uuid, uuid7};

pub const SECTION_HRP: &str = "sec";
pub const APPROVAL_HRP: &str = "apr";
pub const SIGNATURE_HRP: &str = "sig";
pub const AUDIT_HRP: &str = "aud";

/// Separates components of a composite storage key. Rejected in ids.
pub const KEY_SEPARATOR: u8 = 0x1f;

// construct a unique record id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    uuid_to_bech32(hrp, &uuid7())
}

pub fn uuid_to_bech32(hrp: &str, uuid: &Uuid) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid.as_bytes())?;
    Ok(encode)
}

/// Joins key components with [`KEY_SEPARATOR`].
pub fn composite_key(parts: &[&str]) -> Vec<u8> {
    let mut key = Vec::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.extend_from_slice(part.as_bytes());
    }
    key
}

/// Prefix matching every composite key whose first component is `first`.
pub fn key_prefix(first: &str) -> Vec<u8> {
    let mut key = first.as_bytes().to_vec();
    key.push(KEY_SEPARATOR);
    key
}
