use enumflags2::{bitflags, BitFlags};
use rdma_sys::ibv_access_flags;

/// A wrapper for `ibv_access_flags`, hiding the ibv binding types.
#[bitflags]
#[repr(u64)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessFlag {
    /// local write permission
    LocalWrite,
    /// remote write permission
    RemoteWrite,
    /// remote read permission
    RemoteRead,
    /// remote atomic operation permission
    RemoteAtomic,
    /// create an on-demand paging MR
    OnDemand,
    /// huge pages are guaranteed to back this MR, only used with `OnDemand`
    HugeTlb,
    /// allow the device to reorder accesses to the MR
    RelaxOrder,
}

/// The access set used by plain traffic resources unless a scenario widens it.
#[inline]
#[must_use]
pub fn default_mr_access() -> BitFlags<AccessFlag> {
    BitFlags::from(AccessFlag::LocalWrite)
}

/// The access set required by remote atomic scenarios.
#[inline]
#[must_use]
pub fn atomic_access() -> BitFlags<AccessFlag> {
    AccessFlag::LocalWrite | AccessFlag::RemoteAtomic
}

/// The full access set used by on-demand-paging resources.
#[inline]
#[must_use]
pub fn odp_access() -> BitFlags<AccessFlag> {
    AccessFlag::LocalWrite
        | AccessFlag::OnDemand
        | AccessFlag::RemoteAtomic
        | AccessFlag::RemoteRead
        | AccessFlag::RemoteWrite
}

/// Convert `BitFlags<AccessFlag>` into `ibv_access_flags`.
#[inline]
#[must_use]
pub(crate) fn flags_into_ibv_access(flags: BitFlags<AccessFlag>) -> ibv_access_flags {
    let mut ret = ibv_access_flags(0);
    if flags.contains(AccessFlag::LocalWrite) {
        ret |= ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
    }
    if flags.contains(AccessFlag::RemoteWrite) {
        ret |= ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;
    }
    if flags.contains(AccessFlag::RemoteRead) {
        ret |= ibv_access_flags::IBV_ACCESS_REMOTE_READ;
    }
    if flags.contains(AccessFlag::RemoteAtomic) {
        ret |= ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC;
    }
    if flags.contains(AccessFlag::OnDemand) {
        ret |= ibv_access_flags::IBV_ACCESS_ON_DEMAND;
    }
    if flags.contains(AccessFlag::HugeTlb) {
        ret |= ibv_access_flags::IBV_ACCESS_HUGETLB;
    }
    if flags.contains(AccessFlag::RelaxOrder) {
        ret |= ibv_access_flags::IBV_ACCESS_RELAXED_ORDERING;
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_access_maps_to_ibv_bits() {
        let ibv = flags_into_ibv_access(atomic_access());
        assert_ne!((ibv & ibv_access_flags::IBV_ACCESS_LOCAL_WRITE).0, 0);
        assert_ne!((ibv & ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC).0, 0);
        assert_eq!((ibv & ibv_access_flags::IBV_ACCESS_REMOTE_WRITE).0, 0);
    }

    #[test]
    fn odp_access_carries_on_demand() {
        let ibv = flags_into_ibv_access(odp_access());
        assert_ne!((ibv & ibv_access_flags::IBV_ACCESS_ON_DEMAND).0, 0);
        assert_ne!((ibv & ibv_access_flags::IBV_ACCESS_REMOTE_READ).0, 0);
    }
}
