//! Row types stored in the ACL trees.

use crate::error::AclError;
use rkyv::{Archive, Deserialize, Serialize};

/// Row of the SID relation.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct SidRow {
    /// Principal name or authority name.
    pub key: String,
    /// Whether the SID is an individual principal.
    pub is_principal: bool,
}

/// Row of the Class/Type relation.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct ClassRow {
    /// Type discriminator.
    pub type_name: String,
}

/// Row of the ObjectIdentity relation.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct ObjectIdentityRow {
    /// Class id of the type discriminator.
    pub class_id: u64,
    /// Domain primary key.
    pub instance_id: String,
    /// Parent object identity id.
    pub parent: Option<u64>,
    /// Owner SID id.
    pub owner: Option<u64>,
    /// Whether ancestors are consulted beyond this node.
    pub entries_inheriting: bool,
}

/// Row of the AclEntry relation. The object identity and order are in the key.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct EntryRow {
    /// Entry id.
    pub id: u64,
    /// SID id.
    pub sid: u64,
    /// Permission bits.
    pub mask: u32,
    /// Grant (true) or explicit deny (false).
    pub granting: bool,
    /// Notify the audit sink when this entry grants.
    pub audit_success: bool,
    /// Notify the audit sink when this entry denies.
    pub audit_failure: bool,
}

macro_rules! row_codec {
    ($($row:ty),+ $(,)?) => {
        $(
            impl $row {
                /// Serialize the row to bytes using rkyv.
                pub fn to_bytes(&self) -> Result<Vec<u8>, AclError> {
                    rkyv::to_bytes::<rkyv::rancor::Error>(self)
                        .map(|v| v.to_vec())
                        .map_err(|e| AclError::Serialization(e.to_string()))
                }

                /// Deserialize a row from bytes using rkyv.
                ///
                /// The input is copied into an aligned buffer first; sled values
                /// carry no alignment guarantee.
                pub fn from_bytes(bytes: &[u8]) -> Result<Self, AclError> {
                    let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
                    aligned.extend_from_slice(bytes);
                    rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
                        .map_err(|e| AclError::Deserialization(e.to_string()))
                }
            }
        )+
    };
}

row_codec!(SidRow, ClassRow, ObjectIdentityRow, EntryRow);
