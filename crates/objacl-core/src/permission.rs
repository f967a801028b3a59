//! Permission bits and the name registry.
//!
//! A permission is a single bit inside a 32-bit [`Mask`]. Bits 0-4 hold the
//! built-in permissions (`read`, `write`, `create`, `delete`, `admin`); bits
//! 5-31 are free for application-defined permissions registered at startup.

use std::collections::HashMap;
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{AclError, AclResult};

/// Number of bit positions in a mask.
pub const MASK_BITS: u8 = 32;

/// First bit position available to custom permissions.
pub const FIRST_CUSTOM_BIT: u8 = 5;

/// A set of permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Mask(u32);

impl Mask {
    /// No permissions.
    pub const EMPTY: Mask = Mask(0);
    /// Built-in `read` (bit 0).
    pub const READ: Mask = Mask(1);
    /// Built-in `write` (bit 1).
    pub const WRITE: Mask = Mask(1 << 1);
    /// Built-in `create` (bit 2).
    pub const CREATE: Mask = Mask(1 << 2);
    /// Built-in `delete` (bit 3).
    pub const DELETE: Mask = Mask(1 << 3);
    /// Built-in `admin` (bit 4).
    pub const ADMIN: Mask = Mask(1 << 4);
    /// Every bit set. This is what an owner implicitly holds.
    pub const ALL: Mask = Mask(u32::MAX);

    /// Wrap raw bits.
    pub const fn from_bits(bits: u32) -> Self {
        Mask(bits)
    }

    /// Mask with a single bit set. Positions outside 0..32 are rejected.
    pub fn bit(position: u8) -> AclResult<Self> {
        if position >= MASK_BITS {
            return Err(AclError::Conflict(format!(
                "bit position {} outside 0..{}",
                position, MASK_BITS
            )));
        }
        Ok(Mask(1 << position))
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True iff every bit of `required` is also set in `self`.
    pub const fn contains(self, required: Mask) -> bool {
        self.0 & required.0 == required.0
    }

    /// Bit positions set in this mask, lowest first.
    pub fn positions(self) -> impl Iterator<Item = u8> {
        (0..MASK_BITS).filter(move |&p| self.0 & (1u32 << p) != 0)
    }

    /// Render as a 32-character pattern, most significant bit first, with `*`
    /// for set bits and `.` for clear ones.
    pub fn pattern(self) -> String {
        (0..MASK_BITS)
            .rev()
            .map(|p| if self.0 & (1u32 << p) != 0 { '*' } else { '.' })
            .collect()
    }
}

/// True iff every bit set in `required` is also set in `mask`.
///
/// A grant must cover all requested bits; intersecting is not enough.
pub const fn mask_contains(mask: Mask, required: Mask) -> bool {
    mask.contains(required)
}

impl BitOr for Mask {
    type Output = Mask;

    fn bitor(self, rhs: Mask) -> Mask {
        Mask(self.0 | rhs.0)
    }
}

impl BitOrAssign for Mask {
    fn bitor_assign(&mut self, rhs: Mask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Mask {
    type Output = Mask;

    fn bitand(self, rhs: Mask) -> Mask {
        Mask(self.0 & rhs.0)
    }
}

impl From<u32> for Mask {
    fn from(bits: u32) -> Self {
        Mask(bits)
    }
}

impl fmt::Display for Mask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A named permission bit, as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDef {
    /// Permission name.
    pub name: String,
    /// Bit position in 0..32.
    pub bit: u8,
}

impl PermissionDef {
    /// Create a permission definition.
    pub fn new(name: impl Into<String>, bit: u8) -> Self {
        Self {
            name: name.into(),
            bit,
        }
    }
}

const BUILTINS: [(&str, u8); 5] = [
    ("read", 0),
    ("write", 1),
    ("create", 2),
    ("delete", 3),
    ("admin", 4),
];

#[derive(Debug, Default)]
struct Names {
    by_name: HashMap<String, u8>,
    by_bit: [Option<String>; MASK_BITS as usize],
}

/// Maps permission names to bit positions.
///
/// Registration is expected at startup; lookups take a shared lock.
#[derive(Debug)]
pub struct PermissionRegistry {
    names: RwLock<Names>,
}

impl PermissionRegistry {
    /// Registry with no permissions, not even the built-ins.
    pub fn empty() -> Self {
        Self {
            names: RwLock::new(Names::default()),
        }
    }

    /// Registry holding the five built-in permissions.
    pub fn with_builtins() -> Self {
        let registry = Self::empty();
        {
            let mut names = registry.names.write();
            for (name, bit) in BUILTINS {
                names.by_name.insert(name.to_string(), bit);
                names.by_bit[bit as usize] = Some(name.to_string());
            }
        }
        registry
    }

    /// Register `name` at `bit`.
    ///
    /// Re-registering the same pair is a no-op. Fails with
    /// [`AclError::Conflict`] when the bit is out of range, already taken by
    /// another name, or when the name is already bound to another bit.
    pub fn register(&self, name: &str, bit: u8) -> AclResult<Mask> {
        let mask = Mask::bit(bit)?;
        let mut names = self.names.write();

        if let Some(existing) = names.by_name.get(name) {
            if *existing == bit {
                return Ok(mask);
            }
            return Err(AclError::Conflict(format!(
                "permission '{}' already registered at bit {}",
                name, existing
            )));
        }
        if let Some(owner) = &names.by_bit[bit as usize] {
            return Err(AclError::Conflict(format!(
                "bit {} already registered to '{}'",
                bit, owner
            )));
        }

        names.by_name.insert(name.to_string(), bit);
        names.by_bit[bit as usize] = Some(name.to_string());
        tracing::debug!(permission = name, bit, "registered permission");
        Ok(mask)
    }

    /// Register every definition, stopping at the first conflict.
    pub fn register_all(&self, defs: &[PermissionDef]) -> AclResult<()> {
        for def in defs {
            self.register(&def.name, def.bit)?;
        }
        Ok(())
    }

    /// OR together the bits of the named permissions.
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> AclResult<Mask> {
        let registered = self.names.read();
        names.iter().try_fold(Mask::EMPTY, |mask, name| {
            let name = name.as_ref();
            match registered.by_name.get(name) {
                Some(&bit) => Ok(mask | Mask(1u32 << bit)),
                None => Err(AclError::UnknownPermission(name.to_string())),
            }
        })
    }

    /// Name registered at `bit`, if any.
    pub fn name_of(&self, bit: u8) -> Option<String> {
        if bit >= MASK_BITS {
            return None;
        }
        self.names.read().by_bit[bit as usize].clone()
    }

    /// Names of the registered bits set in `mask`. Unregistered bits are skipped.
    pub fn names_in(&self, mask: Mask) -> Vec<String> {
        let names = self.names.read();
        mask.positions()
            .filter_map(|p| names.by_bit[p as usize].clone())
            .collect()
    }

    /// Number of registered permissions.
    pub fn len(&self) -> usize {
        self.names.read().by_name.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.names.read().by_name.is_empty()
    }
}

impl Default for PermissionRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_bits() {
        assert_eq!(Mask::READ.bits(), 1);
        assert_eq!(Mask::WRITE.bits(), 2);
        assert_eq!(Mask::CREATE.bits(), 4);
        assert_eq!(Mask::DELETE.bits(), 8);
        assert_eq!(Mask::ADMIN.bits(), 16);
    }

    #[test]
    fn test_contains_requires_all_bits() {
        let read_write = Mask::READ | Mask::WRITE;
        assert!(mask_contains(read_write, Mask::READ));
        assert!(mask_contains(read_write, read_write));
        assert!(!mask_contains(Mask::READ, read_write));
        assert!(Mask::ALL.contains(Mask::ADMIN | Mask::DELETE));
    }

    #[test]
    fn test_resolve() {
        let registry = PermissionRegistry::with_builtins();
        let mask = registry.resolve(&["read", "write"]).unwrap();
        assert_eq!(mask, Mask::READ | Mask::WRITE);

        let empty: [&str; 0] = [];
        assert_eq!(registry.resolve(&empty).unwrap(), Mask::EMPTY);
    }

    #[test]
    fn test_resolve_unknown() {
        let registry = PermissionRegistry::with_builtins();
        let err = registry.resolve(&["read", "approve"]).unwrap_err();
        assert!(matches!(err, AclError::UnknownPermission(name) if name == "approve"));
    }

    #[test]
    fn test_register_custom() {
        let registry = PermissionRegistry::with_builtins();
        let approve = registry.register("approve", 5).unwrap();
        assert_eq!(approve.bits(), 32);
        assert_eq!(registry.resolve(&["approve"]).unwrap(), approve);

        // idempotent
        registry.register("approve", 5).unwrap();
        assert_eq!(registry.len(), 6);
    }

    #[test]
    fn test_register_conflicts() {
        let registry = PermissionRegistry::with_builtins();

        assert!(matches!(
            registry.register("publish", 0),
            Err(AclError::Conflict(_))
        ));
        assert!(matches!(
            registry.register("read", 7),
            Err(AclError::Conflict(_))
        ));
        assert!(matches!(
            registry.register("publish", 32),
            Err(AclError::Conflict(_))
        ));

        registry.register("publish", 31).unwrap();
        assert!(matches!(
            registry.register("archive", 31),
            Err(AclError::Conflict(_))
        ));
    }

    #[test]
    fn test_names_in() {
        let registry = PermissionRegistry::with_builtins();
        let names = registry.names_in(Mask::READ | Mask::ADMIN | Mask::from_bits(1 << 20));
        assert_eq!(names, vec!["read".to_string(), "admin".to_string()]);
        assert_eq!(registry.name_of(3).as_deref(), Some("delete"));
        assert_eq!(registry.name_of(40), None);
    }

    #[test]
    fn test_pattern() {
        let pattern = (Mask::READ | Mask::ADMIN).pattern();
        assert_eq!(pattern.len(), 32);
        assert!(pattern.ends_with("*...*"));
    }
}
