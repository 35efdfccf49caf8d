//! Test-orchestration framework for RDMA transports.
//!
//! rdma-testkit discovers usable device/port/GID endpoints, builds paired
//! "client" and "server" queue-pair resource bundles, drives each queue pair
//! through its connection-setup state machine, and runs traffic scenarios
//! (send/receive, RDMA read/write, atomics, on-demand-paging prefetch,
//! connection-manager handshakes) between the two endpoints, validating
//! success and failure outcomes. At a high level it provides:
//!
//! * An endpoint selector enumerating `(device, port, gid_index)` triples,
//! filtering inactive ports, zero GIDs and defect-flagged RoCEv2 entries,
//! and preferring IP-bearing candidates.
//!
//! * A typed hierarchy of resource bundles (RC, UD, raw-packet and XRC,
//! plus atomic- and ODP-flavoured configurations), each owning a device
//! context, protection domain, completion queue, memory region and queue
//! pairs, with the QP lifecycle (`RESET -> INIT -> RTR -> RTS`) driven
//! per transport.
//!
//! * A synchronous traffic driver posting work requests against a ready
//! bundle pair and polling both completion queues, surfacing deliberate
//! protocol violations as the completion errors they must produce.
//!
//! * A multi-process synchronizer for connection-manager flows: two spawned
//! processes rendezvous on a bounded two-party barrier and report through
//! the fixed exit-code contract `{0: pass, 2: exception, 5: skip}`.
//!
//! #### Example
//! Select an endpoint and run reliable-connected ping-pong traffic between
//! two local bundles:
//!
//! ```no_run
//! use rdma_testkit::resources::{create_pair, BundleConfig, RcResources};
//! use rdma_testkit::{traffic, EndpointSelector, TestConfig, TestkitResult};
//!
//! fn main() -> TestkitResult<()> {
//!     let endpoint = EndpointSelector::from_config(&TestConfig::from_env()).select()?;
//!     let mut pair = create_pair::<RcResources>(&endpoint, &BundleConfig::default())?;
//!     traffic::traffic(&mut pair, 10)
//! }
//! ```
#![deny(
    // The following are allowed by default lints according to
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    anonymous_parameters,
    bare_trait_objects,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    // unused_results, // TODO: fix unused results

    clippy::all,
    clippy::pedantic,
    unreachable_pub
)]
#![allow(
    clippy::module_name_repetitions, // repetition of module name in a struct name is not a big deal
    clippy::multiple_crate_versions, // multi-version dependency crates is not able to fix
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

/// Access flag conversions
pub mod access;
/// Connection-manager scenario resources
pub mod cm;
/// Completion queue and work completion statuses
pub mod completion_queue;
/// The externally supplied configuration bag
mod config;
/// The device context
pub mod context;
/// Device enumeration
pub mod device;
/// Endpoint selection
mod endpoint;
/// The error taxonomy
mod error;
/// Gid for device ports
pub mod gid;
/// Memory region abstraction
pub mod memory_region;
/// The multi-process synchronizer
pub mod procsync;
/// Protection domain
pub mod protection_domain;
/// Queue pair lifecycle
pub mod queue_pair;
/// The resource bundle hierarchy
pub mod resources;
/// Shared receive queue
pub mod srq;
/// The traffic driver
pub mod traffic;
/// Work request construction
pub mod wr;
/// XRC domain
pub mod xrc;

pub use config::{TestConfig, ENV_DEV, ENV_GID, ENV_PORT};
pub use endpoint::{has_roce_hw_bug, EndpointCandidate, EndpointSelector};
pub use error::{Side, TestkitError, TestkitResult};
