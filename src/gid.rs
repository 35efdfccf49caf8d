use std::fmt;

use rdma_sys::ibv_gid;
use serde::{Deserialize, Serialize};

/// A 128-bit identifier addressing a port on a network adapter, a port on a
/// router, or a multicast group.
///
/// A GID is a valid 128-bit IPv6 address (per RFC 2373) with additional
/// properties defined within IBA to facilitate discovery and routing.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Gid(ibv_gid);

impl Gid {
    /// Build [`Gid`] from bytes.
    #[inline]
    #[must_use]
    pub fn from_raw(raw: [u8; 16]) -> Self {
        Self(ibv_gid { raw })
    }

    /// Re-interpret [`&Gid`](Gid) as `&[u8; 16]`.
    #[inline]
    #[must_use]
    pub fn as_raw(&self) -> &[u8; 16] {
        // SAFETY: POD type
        unsafe { &self.0.raw }
    }

    /// Whether every byte is zero. Zero GIDs are unpopulated table slots and
    /// never usable for traffic.
    #[inline]
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.as_raw().iter().all(|byte| *byte == 0)
    }
}

impl Default for Gid {
    #[inline]
    fn default() -> Self {
        Self::from_raw([0; 16])
    }
}

impl fmt::Debug for Gid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gid({})", hex::encode(self.as_raw()))
    }
}

impl PartialEq for Gid {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.as_raw() == other.as_raw()
    }
}

impl Eq for Gid {}

impl From<ibv_gid> for Gid {
    #[inline]
    fn from(gid: ibv_gid) -> Self {
        Self(gid)
    }
}

impl From<Gid> for ibv_gid {
    #[inline]
    fn from(gid: Gid) -> Self {
        gid.0
    }
}

impl AsMut<ibv_gid> for Gid {
    #[inline]
    fn as_mut(&mut self) -> &mut ibv_gid {
        // SAFETY: repr(transparent)
        unsafe { &mut *<*mut Self>::cast::<ibv_gid>(self) }
    }
}

impl Serialize for Gid {
    #[inline]
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        <[u8; 16] as Serialize>::serialize(self.as_raw(), serializer)
    }
}

impl<'de> Deserialize<'de> for Gid {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        <[u8; 16] as Deserialize<'de>>::deserialize(deserializer).map(Self::from_raw)
    }
}

/// The RoCE flavor of a GID table entry, as reported by sysfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GidType {
    /// `IB/RoCE v1` entries
    RoceV1,
    /// `RoCE v2` entries
    RoceV2,
}

impl GidType {
    /// Parse the content of
    /// `/sys/class/infiniband/<dev>/ports/<port>/gid_attrs/types/<index>`.
    #[must_use]
    pub(crate) fn parse_sysfs(content: &str) -> Option<Self> {
        let trimmed = content.trim();
        if trimmed.eq_ignore_ascii_case("RoCE v2") {
            Some(Self::RoceV2)
        } else if trimmed.eq_ignore_ascii_case("IB/RoCE v1") {
            Some(Self::RoceV1)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_gid_detected() {
        assert!(Gid::default().is_zero());
        let mut raw = [0_u8; 16];
        raw[15] = 1;
        assert!(!Gid::from_raw(raw).is_zero());
    }

    #[test]
    fn sysfs_gid_type_parse() {
        assert_eq!(GidType::parse_sysfs("IB/RoCE v1\n"), Some(GidType::RoceV1));
        assert_eq!(GidType::parse_sysfs("RoCE v2\n"), Some(GidType::RoceV2));
        assert_eq!(GidType::parse_sysfs("garbage"), None);
    }

    #[test]
    fn repr_check() {
        use std::mem::{align_of, size_of};
        assert_eq!(size_of::<Gid>(), size_of::<ibv_gid>());
        assert_eq!(align_of::<Gid>(), align_of::<ibv_gid>());
    }
}
