use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::bindings::ibv_access_flags;

/// Memory region and QP access permissions.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Permission(ibv_access_flags);

impl Permission {
    pub const EMPTY: Self = Self(ibv_access_flags(0));
    pub const LOCAL_WRITE: Self = Self(ibv_access_flags::IBV_ACCESS_LOCAL_WRITE);
    pub const REMOTE_WRITE: Self = Self(ibv_access_flags::IBV_ACCESS_REMOTE_WRITE);
    pub const REMOTE_READ: Self = Self(ibv_access_flags::IBV_ACCESS_REMOTE_READ);
    pub const REMOTE_ATOMIC: Self = Self(ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC);

    /// Get the raw flag bits.
    #[inline]
    pub fn bits(self) -> u32 {
        self.0 .0 as u32
    }

    /// Whether every permission in `other` is also granted by `self`.
    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.bits() & other.bits() == other.bits()
    }
}

impl Default for Permission {
    /// Allow local write plus remote read and write.
    fn default() -> Self {
        Self::LOCAL_WRITE | Self::REMOTE_WRITE | Self::REMOTE_READ
    }
}

impl From<Permission> for i32 {
    fn from(p: Permission) -> Self {
        p.0 .0 as _
    }
}

impl From<Permission> for u32 {
    fn from(p: Permission) -> Self {
        p.bits()
    }
}

impl BitOr for Permission {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Permission {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Permission, &str); 4] = [
            (Permission::LOCAL_WRITE, "LOCAL_WRITE"),
            (Permission::REMOTE_WRITE, "REMOTE_WRITE"),
            (Permission::REMOTE_READ, "REMOTE_READ"),
            (Permission::REMOTE_ATOMIC, "REMOTE_ATOMIC"),
        ];

        let mut list = f.debug_set();
        for (perm, name) in NAMES {
            if self.contains(perm) {
                list.entry(&format_args!("{}", name));
            }
        }
        list.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allows_local_write_and_remote_rw() {
        let perm = Permission::default();
        assert!(perm.contains(Permission::LOCAL_WRITE));
        assert!(perm.contains(Permission::REMOTE_WRITE | Permission::REMOTE_READ));
        assert!(!perm.contains(Permission::REMOTE_ATOMIC));
        assert_eq!(perm.bits(), 0b111);
    }

    #[test]
    fn bit_or_accumulates() {
        let mut perm = Permission::EMPTY;
        assert!(perm.contains(Permission::EMPTY));
        assert!(!perm.contains(Permission::LOCAL_WRITE));

        perm |= Permission::LOCAL_WRITE;
        perm |= Permission::REMOTE_ATOMIC;
        assert!(perm.contains(Permission::LOCAL_WRITE | Permission::REMOTE_ATOMIC));
        assert_eq!(i32::from(perm), 0b1001);
        assert_eq!(format!("{:?}", perm), "{LOCAL_WRITE, REMOTE_ATOMIC}");
    }
}
