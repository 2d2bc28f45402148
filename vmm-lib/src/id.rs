// SPDX-License-Identifier: GPL-2.0-only

//! Short VM identifiers.
//!
//! A VM identifier is 40 random bits encoded as 8 lowercase base32 chars.
//! The interface name and hardware address are both derived from it, so
//! they can be recomputed from the persisted record alone.

use data_encoding::BASE32_NOPAD;
use std::fmt;

const ID_BYTES: usize = 5;

/// Prefix shared by every VM tap interface.
pub const TAP_PREFIX: &str = "vmm-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmId([u8; ID_BYTES]);

impl VmId {
    pub fn generate() -> Self {
        VmId(rand::random::<[u8; ID_BYTES]>())
    }

    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        VmId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// 8 lowercase base32 characters.
    pub fn encode(&self) -> String {
        BASE32_NOPAD.encode(&self.0).to_lowercase()
    }

    pub fn decode(s: &str) -> Result<Self, IdError> {
        let bytes = BASE32_NOPAD
            .decode(s.to_uppercase().as_bytes())
            .map_err(|_| IdError::InvalidEncoding)?;
        if bytes.len() != ID_BYTES {
            return Err(IdError::InvalidLength);
        }
        let mut arr = [0u8; ID_BYTES];
        arr.copy_from_slice(&bytes);
        Ok(VmId(arr))
    }

    /// Host tap device name: `vmm-` plus the first 6 id characters.
    pub fn tap_name(&self) -> String {
        format!("{TAP_PREFIX}{}", &self.encode()[..6])
    }

    /// Locally administered unicast MAC derived from the id bytes.
    pub fn mac_address(&self) -> String {
        format!(
            "AA:FC:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl serde::Serialize for VmId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> serde::Deserialize<'de> for VmId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        VmId::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("invalid base32 encoding")]
    InvalidEncoding,
    #[error("invalid VM id length (expected 5 bytes)")]
    InvalidLength,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_differ() {
        assert_ne!(VmId::generate(), VmId::generate());
    }

    #[test]
    fn encode_is_eight_lowercase_chars() {
        let id = VmId::from_bytes([0xde, 0xad, 0xbe, 0xef, 0x01]);
        let encoded = id.encode();
        assert_eq!(encoded.len(), 8);
        assert_eq!(encoded, encoded.to_lowercase());
        assert_eq!(VmId::decode(&encoded).unwrap(), id);
    }

    #[test]
    fn decode_is_case_insensitive() {
        let id = VmId::from_bytes([1, 2, 3, 4, 5]);
        let upper = id.encode().to_uppercase();
        assert_eq!(VmId::decode(&upper).unwrap(), id);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(VmId::decode("not-an-id!"), Err(IdError::InvalidEncoding)));
        let long = BASE32_NOPAD.encode(&[1, 2, 3, 4, 5, 6, 7, 8]).to_lowercase();
        assert!(matches!(VmId::decode(&long), Err(IdError::InvalidLength)));
    }

    #[test]
    fn tap_name_fits_ifnamsiz() {
        let id = VmId::from_bytes([9, 8, 7, 6, 5]);
        let tap = id.tap_name();
        assert!(tap.starts_with("vmm-"));
        assert_eq!(tap.len(), 10);
        assert_eq!(&tap[4..], &id.encode()[..6]);
    }

    #[test]
    fn mac_is_derived_from_id_bytes() {
        let id = VmId::from_bytes([0x0a, 0x1b, 0x2c, 0x3d, 0x4e]);
        assert_eq!(id.mac_address(), "AA:FC:0A:1B:2C:3D");
        assert_eq!(id.mac_address(), id.mac_address());
    }

    #[test]
    fn serializes_as_string() {
        let id = VmId::from_bytes([1, 1, 1, 1, 1]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.encode()));
        let back: VmId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
