use crate::device::DeviceList;
use crate::error::log_ret_last_os_err;
use crate::gid::{Gid, GidType};

use rdma_sys::{
    ___ibv_query_port, ibv_close_device, ibv_context, ibv_device_attr, ibv_open_device,
    ibv_port_attr, ibv_port_state, ibv_query_device, ibv_query_gid,
};

use std::fs;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

/// `ibv_port_attr.link_layer` value for Ethernet (RoCE) ports.
pub(crate) const LINK_LAYER_ETHERNET: u8 = 2;

/// An opened device context.
///
/// The context exclusively owns the device handle; every descendant resource
/// (PD, CQ, MR, QP, SRQ) must be dropped before the context so that closing
/// it releases the whole cascade.
pub struct Context {
    /// Internal context pointer
    inner_ctx: NonNull<ibv_context>,
    /// Cached device attributes
    dev_attr: ibv_device_attr,
    /// Kernel name of the opened device
    name: String,
}

/// SAFETY: owned handle
unsafe impl Send for Context {}
/// SAFETY: owned handle
unsafe impl Sync for Context {}

impl Context {
    /// Returns the inner context pointer.
    pub(crate) fn as_ptr(&self) -> *mut ibv_context {
        self.inner_ctx.as_ptr()
    }

    /// Open a device by name, or the first available device when `None`.
    #[inline]
    pub fn open(dev_name: Option<&str>) -> io::Result<Arc<Self>> {
        let dev_list = DeviceList::available()?;
        let dev = match dev_name {
            Some(name) => dev_list
                .find_by_name(name)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no device {name}")))?,
            None => dev_list
                .as_slice()
                .first()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no RDMA devices found"))?,
        };
        let name = dev.name().to_owned();
        // SAFETY: ffi
        let inner_ctx = NonNull::new(unsafe { ibv_open_device(dev.ffi_ptr()) })
            .ok_or_else(|| log_ret_last_os_err("ibv_open_device"))?;

        // SAFETY: POD FFI type
        let mut dev_attr = unsafe { std::mem::zeroed::<ibv_device_attr>() };
        // SAFETY: ffi
        let errno = unsafe { ibv_query_device(inner_ctx.as_ptr(), &mut dev_attr) };
        if errno != 0_i32 {
            // SAFETY: ffi, releasing the context we just opened
            let _ = unsafe { ibv_close_device(inner_ctx.as_ptr()) };
            return Err(io::Error::from_raw_os_error(errno));
        }

        Ok(Arc::new(Self {
            inner_ctx,
            dev_attr,
            name,
        }))
    }

    /// Kernel name of the opened device.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cached device attributes.
    #[inline]
    #[must_use]
    pub fn dev_attr(&self) -> &ibv_device_attr {
        &self.dev_attr
    }

    /// PCI vendor id of the device.
    #[inline]
    #[must_use]
    pub fn vendor_id(&self) -> u32 {
        self.dev_attr.vendor_id
    }

    /// Vendor part id of the device.
    #[inline]
    #[must_use]
    pub fn vendor_part_id(&self) -> u32 {
        self.dev_attr.vendor_part_id
    }

    /// Number of physical ports.
    #[inline]
    #[must_use]
    pub fn phys_port_cnt(&self) -> u8 {
        self.dev_attr.phys_port_cnt
    }

    /// Whether the device reports any atomic capability.
    #[inline]
    #[must_use]
    pub fn supports_atomics(&self) -> bool {
        self.dev_attr.atomic_cap != rdma_sys::ibv_atomic_cap::IBV_ATOMIC_NONE
    }

    /// Query the attributes of one port.
    #[inline]
    pub fn query_port(&self, port: u8) -> io::Result<ibv_port_attr> {
        // SAFETY: POD FFI type
        let mut port_attr = unsafe { std::mem::zeroed::<ibv_port_attr>() };
        // SAFETY: ffi
        let errno = unsafe { ___ibv_query_port(self.as_ptr(), port, &mut port_attr) };
        if errno != 0_i32 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(port_attr)
    }

    /// Whether the port link state is ACTIVE.
    #[inline]
    pub fn is_port_active(&self, port: u8) -> io::Result<bool> {
        Ok(self.query_port(port)?.state == ibv_port_state::IBV_PORT_ACTIVE)
    }

    /// Query one GID table slot.
    #[inline]
    pub fn query_gid(&self, port: u8, gid_index: u16) -> io::Result<Gid> {
        let mut gid = Gid::default();
        // SAFETY: ffi
        let errno =
            unsafe { ibv_query_gid(self.as_ptr(), port, i32::from(gid_index), gid.as_mut()) };
        if errno != 0_i32 {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(gid)
    }

    /// Query the RoCE type of a GID table slot through sysfs, the same source
    /// the kernel exposes to management tools. `None` when the slot has no
    /// type file (non-RoCE fabrics) or it cannot be parsed.
    #[inline]
    #[must_use]
    pub fn query_gid_type(&self, port: u8, gid_index: u16) -> Option<GidType> {
        let path = format!(
            "/sys/class/infiniband/{}/ports/{}/gid_attrs/types/{}",
            self.name, port, gid_index
        );
        fs::read_to_string(path)
            .ok()
            .and_then(|content| GidType::parse_sysfs(&content))
    }

    /// Whether the port is Ethernet (RoCE) link layer.
    #[inline]
    pub fn is_ethernet(&self, port: u8) -> io::Result<bool> {
        Ok(self.query_port(port)?.link_layer == LINK_LAYER_ETHERNET)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // SAFETY: ffi; all descendant resources hold an Arc to this context,
        // so the close happens strictly after their release
        let errno = unsafe { ibv_close_device(self.as_ptr()) };
        assert_eq!(errno, 0_i32, "failed to close device context");
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_unknown_device_fails() {
        let err = Context::open(Some("no-such-device-0")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn open_first_device_if_any() {
        // Hosts without RDMA hardware are fine, the open just errors.
        match Context::open(None) {
            Ok(ctx) => {
                assert!(!ctx.name().is_empty());
                assert!(ctx.phys_port_cnt() >= 1);
            }
            Err(err) => {
                eprintln!("no device to open: {err}");
            }
        }
    }
}
