//! Connection-manager (RDMACM) scenario resources.
//!
//! A handshake is driven independently by two peers, so these resources are
//! always used from the child processes the synchronizer spawns: one
//! passive (listening) side and one active (connecting) side, rendezvousing
//! through the two-party barrier between the setup steps.

use crate::error::{classify_create_err, TestkitError, TestkitResult};
use crate::procsync::ChildContext;
use crate::Side;

use rdma_sys::{
    ibv_qp_init_attr, ibv_wc, rdma_accept, rdma_addrinfo, rdma_cm_id, rdma_connect,
    rdma_create_ep, rdma_dereg_mr, rdma_destroy_ep, rdma_disconnect, rdma_freeaddrinfo,
    rdma_get_recv_comp, rdma_get_request, rdma_get_send_comp, rdma_getaddrinfo, rdma_listen,
    rdma_port_space, rdma_post_recv, rdma_post_send, rdma_reg_msgs, rdma_reject, RAI_PASSIVE,
};

use clippy_utilities::Cast;
use tracing::debug;

use std::ffi::CString;
use std::io;
use std::pin::Pin;
use std::ptr::{null_mut, NonNull};

/// Message size of the CM ping-pong.
const CM_MSG_SIZE: usize = 16;
/// Payload byte of the CM ping-pong.
const CM_FILLER: u8 = 1;

/// Capture the last OS error of an rdmacm call, converting the unsupported
/// class to a skip outcome.
fn cm_err(what: &str) -> TestkitError {
    classify_create_err(io::Error::last_os_error(), what)
}

/// Resolved `rdma_addrinfo` list, freed on drop.
#[derive(Debug)]
struct AddrInfo(NonNull<rdma_addrinfo>);

impl AddrInfo {
    /// Resolve `ip:port`, passively when no connect target is wanted.
    fn resolve(ip: &str, port: u16, passive: bool) -> TestkitResult<Self> {
        let node = CString::new(ip).map_err(|_| TestkitError::skip("bad address string"))?;
        let service = CString::new(port.to_string())
            .map_err(|_| TestkitError::skip("bad port string"))?;
        // SAFETY: POD FFI type
        let mut hints = unsafe { std::mem::zeroed::<rdma_addrinfo>() };
        if passive {
            hints.ai_flags = RAI_PASSIVE.cast();
        }
        hints.ai_port_space = rdma_port_space::RDMA_PS_TCP.cast();
        let mut res: *mut rdma_addrinfo = null_mut();
        // SAFETY: ffi
        let ret = unsafe {
            rdma_getaddrinfo(node.as_ptr(), service.as_ptr(), &hints, &mut res)
        };
        if ret != 0_i32 {
            return Err(cm_err("rdma_getaddrinfo"));
        }
        NonNull::new(res)
            .map(Self)
            .ok_or_else(|| TestkitError::skip("rdma_getaddrinfo returned nothing"))
    }
}

impl Drop for AddrInfo {
    fn drop(&mut self) {
        // SAFETY: ffi
        unsafe { rdma_freeaddrinfo(self.0.as_ptr()) };
    }
}

/// A message memory region registered on a cm id, deregistered on drop.
#[derive(Debug)]
struct CmMr {
    /// Registration handle
    mr: NonNull<rdma_sys::ibv_mr>,
    /// The registered buffer
    buf: Pin<Box<[u8]>>,
}

impl CmMr {
    /// Register `len` zeroed bytes for messaging on `id`.
    fn register(id: *mut rdma_cm_id, len: usize) -> TestkitResult<Self> {
        let mut buf = Pin::new(vec![0_u8; len].into_boxed_slice());
        // SAFETY: ffi; the buffer is pinned for the region's lifetime
        let mr = unsafe { rdma_reg_msgs(id, buf.as_mut_ptr().cast(), len) };
        let mr = NonNull::new(mr).ok_or_else(|| cm_err("rdma_reg_msgs"))?;
        Ok(Self { mr, buf })
    }
}

impl Drop for CmMr {
    fn drop(&mut self) {
        // SAFETY: ffi
        let _ = unsafe { rdma_dereg_mr(self.mr.as_ptr()) };
    }
}

/// One side of a connection-manager flow.
#[derive(Debug)]
pub struct CmConnection {
    /// The connected (or connecting) cm id
    id: NonNull<rdma_cm_id>,
    /// The listening id, kept by the passive side
    listen_id: Option<NonNull<rdma_cm_id>>,
    /// Send message region
    send_mr: CmMr,
    /// Receive message region
    recv_mr: CmMr,
}

impl CmConnection {
    /// Passive side: bind, listen, and take the first connection request.
    /// The barrier between `listen` and the peer's connect lives in the
    /// scenario functions, not here.
    pub fn listen(ip: &str, port: u16) -> TestkitResult<PendingListener> {
        let addrinfo = AddrInfo::resolve(ip, port, true)?;
        // SAFETY: POD FFI type
        let mut init_attr = unsafe { std::mem::zeroed::<ibv_qp_init_attr>() };
        init_attr.cap.max_send_wr = 1;
        init_attr.cap.max_recv_wr = 1;
        init_attr.cap.max_send_sge = 1;
        init_attr.cap.max_recv_sge = 1;
        init_attr.sq_sig_all = 1_i32;
        let mut listen_id: *mut rdma_cm_id = null_mut();
        // SAFETY: ffi
        let ret = unsafe {
            rdma_create_ep(&mut listen_id, addrinfo.0.as_ptr(), null_mut(), &mut init_attr)
        };
        if ret != 0_i32 {
            return Err(cm_err("rdma_create_ep"));
        }
        let listen_id = NonNull::new(listen_id).ok_or_else(|| cm_err("rdma_create_ep"))?;
        // SAFETY: ffi
        let ret = unsafe { rdma_listen(listen_id.as_ptr(), 0_i32) };
        if ret != 0_i32 {
            // SAFETY: releasing the ep we just created
            unsafe { rdma_destroy_ep(listen_id.as_ptr()) };
            return Err(cm_err("rdma_listen"));
        }
        Ok(PendingListener { listen_id })
    }

    /// Active side: resolve the peer and connect.
    pub fn connect(ip: &str, port: u16) -> TestkitResult<Self> {
        let addrinfo = AddrInfo::resolve(ip, port, false)?;
        // SAFETY: POD FFI type
        let mut init_attr = unsafe { std::mem::zeroed::<ibv_qp_init_attr>() };
        init_attr.cap.max_send_wr = 1;
        init_attr.cap.max_recv_wr = 1;
        init_attr.cap.max_send_sge = 1;
        init_attr.cap.max_recv_sge = 1;
        init_attr.sq_sig_all = 1_i32;
        let mut id: *mut rdma_cm_id = null_mut();
        // SAFETY: ffi
        let ret =
            unsafe { rdma_create_ep(&mut id, addrinfo.0.as_ptr(), null_mut(), &mut init_attr) };
        if ret != 0_i32 {
            return Err(cm_err("rdma_create_ep"));
        }
        let id = NonNull::new(id).ok_or_else(|| cm_err("rdma_create_ep"))?;

        let send_mr = CmMr::register(id.as_ptr(), CM_MSG_SIZE)?;
        let recv_mr = CmMr::register(id.as_ptr(), CM_MSG_SIZE)?;
        let mut conn = Self {
            id,
            listen_id: None,
            send_mr,
            recv_mr,
        };
        conn.post_recv()?;
        // SAFETY: ffi
        let ret = unsafe { rdma_connect(conn.id.as_ptr(), null_mut()) };
        if ret != 0_i32 {
            return Err(cm_err("rdma_connect"));
        }
        Ok(conn)
    }

    /// Post the single receive buffer.
    fn post_recv(&mut self) -> TestkitResult<()> {
        // SAFETY: ffi; the buffer is pinned inside the region
        let ret = unsafe {
            rdma_post_recv(
                self.id.as_ptr(),
                null_mut(),
                self.recv_mr.buf.as_mut_ptr().cast(),
                CM_MSG_SIZE,
                self.recv_mr.mr.as_ptr(),
            )
        };
        if ret != 0_i32 {
            return Err(cm_err("rdma_post_recv"));
        }
        Ok(())
    }

    /// Send the filler message and wait for its completion.
    fn send_msg(&mut self) -> TestkitResult<()> {
        self.send_mr.buf.fill(CM_FILLER);
        // SAFETY: ffi; the buffer is pinned inside the region
        let ret = unsafe {
            rdma_post_send(
                self.id.as_ptr(),
                null_mut(),
                self.send_mr.buf.as_mut_ptr().cast(),
                CM_MSG_SIZE,
                self.send_mr.mr.as_ptr(),
                0_i32,
            )
        };
        if ret != 0_i32 {
            return Err(cm_err("rdma_post_send"));
        }
        // SAFETY: POD FFI type
        let mut wc = unsafe { std::mem::zeroed::<ibv_wc>() };
        let mut ret = 0_i32;
        while ret == 0_i32 {
            // SAFETY: ffi
            ret = unsafe { rdma_get_send_comp(self.id.as_ptr(), &mut wc) };
        }
        if ret < 0_i32 {
            return Err(cm_err("rdma_get_send_comp"));
        }
        Ok(())
    }

    /// Wait for the posted receive and validate the payload.
    fn recv_msg(&mut self) -> TestkitResult<()> {
        // SAFETY: POD FFI type
        let mut wc = unsafe { std::mem::zeroed::<ibv_wc>() };
        let mut ret = 0_i32;
        while ret == 0_i32 {
            // SAFETY: ffi
            ret = unsafe { rdma_get_recv_comp(self.id.as_ptr(), &mut wc) };
        }
        if ret < 0_i32 {
            return Err(cm_err("rdma_get_recv_comp"));
        }
        if self.recv_mr.buf.iter().any(|byte| *byte != CM_FILLER) {
            return Err(TestkitError::BadPayload(
                "cm message payload mismatch".to_owned(),
            ));
        }
        Ok(())
    }

    /// Tear the connection down.
    pub fn disconnect(&mut self) {
        // SAFETY: ffi
        let _ = unsafe { rdma_disconnect(self.id.as_ptr()) };
    }
}

impl Drop for CmConnection {
    fn drop(&mut self) {
        // SAFETY: ffi; the listener outlives the connected id
        unsafe {
            rdma_destroy_ep(self.id.as_ptr());
            if let Some(listen_id) = self.listen_id {
                rdma_destroy_ep(listen_id.as_ptr());
            }
        }
    }
}

/// A bound, listening endpoint waiting for its connection request.
#[derive(Debug)]
pub struct PendingListener {
    /// The listening cm id
    listen_id: NonNull<rdma_cm_id>,
}

impl PendingListener {
    /// Take the first connection request and accept it.
    pub fn accept(self) -> TestkitResult<CmConnection> {
        let mut id: *mut rdma_cm_id = null_mut();
        // SAFETY: ffi
        let ret = unsafe { rdma_get_request(self.listen_id.as_ptr(), &mut id) };
        if ret != 0_i32 {
            return Err(cm_err("rdma_get_request"));
        }
        let id = NonNull::new(id).ok_or_else(|| cm_err("rdma_get_request"))?;
        let send_mr = CmMr::register(id.as_ptr(), CM_MSG_SIZE)?;
        let recv_mr = CmMr::register(id.as_ptr(), CM_MSG_SIZE)?;
        let listen_id = self.listen_id;
        std::mem::forget(self);
        let mut conn = CmConnection {
            id,
            listen_id: Some(listen_id),
            send_mr,
            recv_mr,
        };
        conn.post_recv()?;
        // SAFETY: ffi
        let ret = unsafe { rdma_accept(conn.id.as_ptr(), null_mut()) };
        if ret != 0_i32 {
            return Err(cm_err("rdma_accept"));
        }
        Ok(conn)
    }

    /// Take the first connection request and reject it.
    pub fn reject(self) -> TestkitResult<()> {
        let mut id: *mut rdma_cm_id = null_mut();
        // SAFETY: ffi
        let ret = unsafe { rdma_get_request(self.listen_id.as_ptr(), &mut id) };
        if ret != 0_i32 {
            return Err(cm_err("rdma_get_request"));
        }
        // SAFETY: ffi
        let ret = unsafe { rdma_reject(id, null_mut(), 0) };
        // SAFETY: ffi; the rejected request id is ours to release
        unsafe { rdma_destroy_ep(id) };
        if ret != 0_i32 {
            return Err(cm_err("rdma_reject"));
        }
        Ok(())
    }
}

impl Drop for PendingListener {
    fn drop(&mut self) {
        // SAFETY: ffi
        unsafe { rdma_destroy_ep(self.listen_id.as_ptr()) };
    }
}

/// Connect + ping-pong + disconnect, one role of the two-process scenario.
///
/// The barrier keeps the active connect strictly after the passive listen,
/// and the disconnect strictly after both sides finished messaging.
pub fn sync_traffic_scenario(
    role: Side,
    ctx: &ChildContext,
    ip: &str,
    port: u16,
) -> TestkitResult<()> {
    let mut barrier = ctx.rendezvous().map_err(TestkitError::Verbs)?;
    match role {
        Side::Passive => {
            let listener = CmConnection::listen(ip, port)?;
            barrier.wait().map_err(TestkitError::Verbs)?;
            let mut conn = listener.accept()?;
            conn.recv_msg()?;
            conn.send_msg()?;
            barrier.wait().map_err(TestkitError::Verbs)?;
            conn.disconnect();
        }
        Side::Active => {
            barrier.wait().map_err(TestkitError::Verbs)?;
            let mut conn = CmConnection::connect(ip, port)?;
            conn.send_msg()?;
            conn.recv_msg()?;
            barrier.wait().map_err(TestkitError::Verbs)?;
            conn.disconnect();
        }
    }
    debug!("{role} cm side finished");
    Ok(())
}

/// Reject flow: the passive side refuses the request, the active side
/// expects its connect to fail.
pub fn reject_scenario(role: Side, ctx: &ChildContext, ip: &str, port: u16) -> TestkitResult<()> {
    let mut barrier = ctx.rendezvous().map_err(TestkitError::Verbs)?;
    match role {
        Side::Passive => {
            let listener = CmConnection::listen(ip, port)?;
            barrier.wait().map_err(TestkitError::Verbs)?;
            listener.reject()?;
        }
        Side::Active => {
            barrier.wait().map_err(TestkitError::Verbs)?;
            match CmConnection::connect(ip, port) {
                Ok(_) => {
                    return Err(TestkitError::ExpectedFailureMissing);
                }
                Err(err) if err.is_skip() => return Err(err),
                Err(err) => {
                    debug!("connect rejected as expected: {err}");
                }
            }
        }
    }
    Ok(())
}
