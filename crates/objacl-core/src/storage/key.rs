//! Key encoding for the ACL trees.
//!
//! All numeric components are big-endian so that lexicographic ordering of
//! the encoded keys matches numeric ordering. A prefix scan over an object
//! identity therefore yields its entries in ascending `order`.

use crate::error::{AclError, AclResult};

/// Size of an encoded id.
pub const ID_SIZE: usize = 8;

/// Size of an encoded entry order.
pub const ORDER_SIZE: usize = 4;

/// Size of an entry key (`oid ‖ order`).
pub const ENTRY_KEY_SIZE: usize = ID_SIZE + ORDER_SIZE;

/// Prefix for the per-identity order counters in the meta tree.
pub const NEXT_ORDER_PREFIX: &[u8] = b"next_order:";

/// Encode an id.
pub fn encode_id(id: u64) -> [u8; ID_SIZE] {
    id.to_be_bytes()
}

/// Decode an id.
pub fn decode_id(bytes: &[u8]) -> AclResult<u64> {
    let buf: [u8; ID_SIZE] = bytes
        .try_into()
        .map_err(|_| AclError::Deserialization(format!("bad id length {}", bytes.len())))?;
    Ok(u64::from_be_bytes(buf))
}

/// Decode a `u32` counter value.
pub fn decode_u32(bytes: &[u8]) -> AclResult<u32> {
    let buf: [u8; ORDER_SIZE] = bytes
        .try_into()
        .map_err(|_| AclError::Deserialization(format!("bad u32 length {}", bytes.len())))?;
    Ok(u32::from_be_bytes(buf))
}

/// Key of an entry: `[oid (8 bytes)][order (4 bytes)]`.
pub fn entry_key(oid: u64, order: u32) -> [u8; ENTRY_KEY_SIZE] {
    let mut buf = [0u8; ENTRY_KEY_SIZE];
    buf[..ID_SIZE].copy_from_slice(&oid.to_be_bytes());
    buf[ID_SIZE..].copy_from_slice(&order.to_be_bytes());
    buf
}

/// Split an entry key into `(oid, order)`.
pub fn decode_entry_key(bytes: &[u8]) -> AclResult<(u64, u32)> {
    if bytes.len() != ENTRY_KEY_SIZE {
        return Err(AclError::Deserialization(format!(
            "bad entry key length {}",
            bytes.len()
        )));
    }
    Ok((decode_id(&bytes[..ID_SIZE])?, decode_u32(&bytes[ID_SIZE..])?))
}

/// Key of a child link: `[parent (8 bytes)][child (8 bytes)]`.
pub fn child_key(parent: u64, child: u64) -> [u8; ID_SIZE * 2] {
    let mut buf = [0u8; ID_SIZE * 2];
    buf[..ID_SIZE].copy_from_slice(&parent.to_be_bytes());
    buf[ID_SIZE..].copy_from_slice(&child.to_be_bytes());
    buf
}

/// Uniqueness key of an object identity: `[class id (8 bytes)][instance id]`.
pub fn object_identity_key(class_id: u64, instance_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(ID_SIZE + instance_id.len());
    key.extend_from_slice(&class_id.to_be_bytes());
    key.extend_from_slice(instance_id.as_bytes());
    key
}

/// Uniqueness key of a SID: `[kind byte][key]`.
///
/// Principals and authorities with the same key live under different
/// prefixes, so `("admin", principal)` and `("admin", authority)` stay distinct.
pub fn sid_key(key: &str, is_principal: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + key.len());
    buf.push(if is_principal { b'P' } else { b'A' });
    buf.extend_from_slice(key.as_bytes());
    buf
}

/// Meta-tree key of the next order counter for an identity.
pub fn next_order_key(oid: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(NEXT_ORDER_PREFIX.len() + ID_SIZE);
    key.extend_from_slice(NEXT_ORDER_PREFIX);
    key.extend_from_slice(&oid.to_be_bytes());
    key
}

/// Get current timestamp in microseconds since Unix epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_key_ordering() {
        let a = entry_key(1, 2);
        let b = entry_key(1, 10);
        let c = entry_key(2, 0);

        assert!(a < b);
        assert!(b < c);
        assert_eq!(decode_entry_key(&b).unwrap(), (1, 10));
    }

    #[test]
    fn test_sid_key_kinds_distinct() {
        assert_ne!(sid_key("admin", true), sid_key("admin", false));
    }

    #[test]
    fn test_decode_invalid_length() {
        assert!(decode_id(&[0u8; 3]).is_err());
        assert!(decode_entry_key(&[0u8; 9]).is_err());
    }
}
