//! Multi-process synchronizer for connection-manager scenarios.
//!
//! Connection-manager event delivery blocks per process, so the two sides of
//! a handshake run as independent OS processes. They rendezvous through a
//! two-party TCP barrier with a bounded wait and report outcomes two ways:
//! the exit code is the contract the parent acts on, and a tagged result
//! message over a notification socket carries the reason for diagnostics.
//!
//! Exit-code table (a contract, not an incidental detail):
//! `0` = scenario passed, `2` = an unexpected error occurred on that side,
//! `5` = that side determined the scenario should be skipped. Codes strictly
//! between 0 and 5 are treated as exceptions as well.

use crate::error::{Side, TestkitError, TestkitResult};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process::{Child, Command};
use std::time::{Duration, Instant};

/// Exit code of a passed scenario side.
pub const EXIT_PASS: i32 = 0;
/// Exit code of a side that hit an unexpected error.
pub const EXIT_EXCEPTION: i32 = 2;
/// Exit code of a side that decided to skip.
pub const EXIT_SKIP: i32 = 5;

/// Bounded wait of the two-party barrier.
pub const BARRIER_TIMEOUT: Duration = Duration::from_secs(15);
/// One short join slice of the parent poll loop.
const JOIN_SLICE: Duration = Duration::from_millis(100);
/// Poll budget for scenarios expected to finish.
const NORMAL_POLL_BUDGET: usize = 150;
/// Poll budget for scenarios expected to fail or hang.
const BAD_FLOW_POLL_BUDGET: usize = 3;

/// Environment variable carrying the child role.
pub const ENV_ROLE: &str = "RDMA_TESTKIT_ROLE";
/// Environment variable carrying the barrier port.
pub const ENV_BARRIER_PORT: &str = "RDMA_TESTKIT_BARRIER_PORT";
/// Environment variable carrying the notification port.
pub const ENV_NOTIFIER_PORT: &str = "RDMA_TESTKIT_NOTIFIER_PORT";

/// Whether the scenario is expected to fail or hang.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Traffic is expected to work
    Normal,
    /// Traffic is expected to fail; clean success is an error
    Bad,
}

/// Tagged outcome one side reports over the notification channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SideOutcome {
    /// The side passed
    Ok,
    /// The side skipped, with the reason
    Skipped(String),
    /// The side failed, with the reason
    Failed(String),
}

/// One side's notification message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideResult {
    /// Which side reports
    pub side: Side,
    /// What happened there
    pub outcome: SideOutcome,
}

/// The parent's interpretation of a finished scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Both sides passed inside the budget
    Passed,
    /// A side decided to skip
    Skipped {
        /// The side that skipped
        side: Side,
    },
    /// A side exited with an exception code
    SideException {
        /// The side that failed
        side: Side,
    },
    /// A bad-flow scenario finished cleanly
    ExpectedFailureMissing,
    /// A normal-flow scenario had to be terminated
    Stuck,
}

impl Verdict {
    /// Convert into the crate error taxonomy.
    pub fn into_result(self) -> TestkitResult<()> {
        match self {
            Self::Passed => Ok(()),
            Self::Skipped { side } => Err(TestkitError::skip(format!("skip on {side} side"))),
            Self::SideException { side } => Err(TestkitError::SideException { side }),
            Self::ExpectedFailureMissing => Err(TestkitError::ExpectedFailureMissing),
            Self::Stuck => Err(TestkitError::StuckHandshake),
        }
    }
}

/// First-observed exit codes of the two children.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExitRecord {
    /// Passive child's code, `None` while alive at budget exhaustion
    pub passive: Option<i32>,
    /// Active child's code
    pub active: Option<i32>,
}

/// The fixed code-to-meaning table of §"exit-code contract", applied after
/// the poll loop. Pure so it can be exercised without processes.
#[must_use]
pub fn verdict(flow: Flow, record: ExitRecord, killed: bool) -> Verdict {
    let sides = [(Side::Passive, record.passive), (Side::Active, record.active)];
    for (side, code) in sides {
        if code == Some(EXIT_SKIP) {
            return Verdict::Skipped { side };
        }
    }
    for (side, code) in sides {
        if let Some(code) = code {
            if code > EXIT_PASS && code < EXIT_SKIP {
                return Verdict::SideException { side };
            }
        }
    }
    match (flow, killed) {
        (Flow::Bad, false) => Verdict::ExpectedFailureMissing,
        (Flow::Normal, true) => Verdict::Stuck,
        _ => Verdict::Passed,
    }
}

/// Poll both children with short joins, record their first exit codes,
/// forcibly terminate stragglers, and interpret the result.
pub fn supervise(mut passive: Child, mut active: Child, flow: Flow) -> io::Result<Verdict> {
    let budget = match flow {
        Flow::Normal => NORMAL_POLL_BUDGET,
        Flow::Bad => BAD_FLOW_POLL_BUDGET,
    };
    let mut record = ExitRecord::default();
    for _ in 0..budget {
        if record.passive.is_none() {
            record.passive = passive.try_wait()?.and_then(|status| status.code());
        }
        if record.active.is_none() {
            record.active = active.try_wait()?.and_then(|status| status.code());
        }
        if record.passive.is_some() && record.active.is_some() {
            break;
        }
        std::thread::sleep(JOIN_SLICE);
    }
    let mut killed = false;
    for (child, recorded) in [(&mut passive, record.passive), (&mut active, record.active)] {
        if recorded.is_none() {
            warn!("terminating child {} after polling budget", child.id());
            // A dead child makes kill fail with InvalidInput, which is fine.
            let _ = child.kill();
            let _ = child.wait();
            killed = true;
        }
    }
    debug!(?record, killed, "two-process scenario finished");
    Ok(verdict(flow, record, killed))
}

/// Map a child-side result onto the exit-code contract.
#[must_use]
pub fn exit_code_for(result: &TestkitResult<()>) -> i32 {
    match *result {
        Ok(()) => EXIT_PASS,
        Err(ref err) if err.is_skip() => EXIT_SKIP,
        Err(_) => EXIT_EXCEPTION,
    }
}

/// The two-party rendezvous barrier. Each `wait` blocks until the peer
/// also waits, bounded by [`BARRIER_TIMEOUT`].
#[derive(Debug)]
pub struct Rendezvous {
    /// Connection to the peer
    stream: TcpStream,
}

impl Rendezvous {
    /// Passive half: own the barrier port and wait for the peer.
    pub fn passive(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))?;
        let (stream, _) = listener.accept()?;
        Self::prepare(stream)
    }

    /// Active half: connect to the barrier port, retrying until the peer
    /// binds it.
    pub fn active(port: u16) -> io::Result<Self> {
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
        let deadline = Instant::now() + BARRIER_TIMEOUT;
        loop {
            match TcpStream::connect(addr) {
                Ok(stream) => return Self::prepare(stream),
                Err(err) if Instant::now() >= deadline => return Err(err),
                Err(_) => std::thread::sleep(Duration::from_millis(50)),
            }
        }
    }

    /// Apply the bounded-wait timeouts.
    fn prepare(stream: TcpStream) -> io::Result<Self> {
        stream.set_read_timeout(Some(BARRIER_TIMEOUT))?;
        stream.set_write_timeout(Some(BARRIER_TIMEOUT))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }

    /// Block until both parties reach the barrier.
    pub fn wait(&mut self) -> io::Result<()> {
        self.stream.write_all(&[1_u8])?;
        let mut byte = [0_u8; 1];
        self.stream.read_exact(&mut byte)?;
        Ok(())
    }
}

/// Parent end of the notification channel: collects the tagged results the
/// children pushed before exiting.
#[derive(Debug)]
pub struct NotificationQueue {
    /// Non-blocking listener the children connect to
    listener: TcpListener,
}

impl NotificationQueue {
    /// Bind on an ephemeral loopback port.
    pub fn bind() -> io::Result<(Self, u16)> {
        let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        Ok((Self { listener }, port))
    }

    /// Drain every queued result without blocking.
    #[must_use]
    pub fn collect(&self) -> Vec<SideResult> {
        let mut results = Vec::new();
        while let Ok((mut stream, _)) = self.listener.accept() {
            let _ = stream.set_nonblocking(false);
            let _ = stream.set_read_timeout(Some(Duration::from_secs(1)));
            let mut buf = Vec::new();
            if stream.read_to_end(&mut buf).is_ok() {
                if let Ok(result) = bincode::deserialize::<SideResult>(&buf) {
                    results.push(result);
                }
            }
        }
        results
    }
}

/// Push one tagged result to the parent, best-effort.
fn notify_parent(port: u16, result: &SideResult) {
    let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
    if let Ok(mut stream) = TcpStream::connect(addr) {
        if let Ok(encoded) = bincode::serialize(result) {
            let _ = stream.write_all(&encoded);
        }
    }
}

/// Everything a spawned child needs to coordinate with its sibling.
#[derive(Debug, Clone, Copy)]
pub struct ChildContext {
    /// This child's role
    pub role: Side,
    /// Barrier port owned by the passive side
    barrier_port: u16,
}

impl ChildContext {
    /// Join the two-party barrier according to the role.
    pub fn rendezvous(&self) -> io::Result<Rendezvous> {
        match self.role {
            Side::Passive => Rendezvous::passive(self.barrier_port),
            Side::Active => Rendezvous::active(self.barrier_port),
        }
    }
}

/// Read the child role from the environment, if this process is a spawned
/// scenario side.
fn child_role_from_env() -> Option<Side> {
    match std::env::var(ENV_ROLE).ok()?.as_str() {
        "passive" => Some(Side::Passive),
        "active" => Some(Side::Active),
        _ => None,
    }
}

/// Run a scenario as two spawned processes and interpret the outcome.
///
/// Call this from a test function named `test_name`: when the environment
/// marks the process as a child, `child_fn` runs with the role and the
/// process exits through the exit-code contract (cleanup runs first, the
/// scenario's resources unwind before the exit). Otherwise the parent
/// spawns the two children onto this same test and supervises them.
pub fn run_two_process<F>(test_name: &str, flow: Flow, child_fn: F) -> TestkitResult<()>
where
    F: FnOnce(Side, &ChildContext) -> TestkitResult<()>,
{
    if let Some(role) = child_role_from_env() {
        let barrier_port = std::env::var(ENV_BARRIER_PORT)
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        let notifier_port: Option<u16> = std::env::var(ENV_NOTIFIER_PORT)
            .ok()
            .and_then(|raw| raw.parse().ok());
        let ctx = ChildContext { role, barrier_port };
        // The scenario's native resources are dropped inside this call, so
        // cleanup ordering is settled before the process exits.
        let result = catch_unwind(AssertUnwindSafe(|| child_fn(role, &ctx)))
            .unwrap_or_else(|_| Err(TestkitError::SideException { side: role }));
        if let Some(port) = notifier_port {
            let outcome = match result {
                Ok(()) => SideOutcome::Ok,
                Err(ref err) if err.is_skip() => SideOutcome::Skipped(err.to_string()),
                Err(ref err) => SideOutcome::Failed(err.to_string()),
            };
            notify_parent(port, &SideResult { side: role, outcome });
        }
        std::process::exit(exit_code_for(&result));
    }

    let barrier_port = portpicker::pick_unused_port()
        .ok_or_else(|| TestkitError::skip("no free barrier port"))?;
    let (queue, notifier_port) = NotificationQueue::bind().map_err(TestkitError::Verbs)?;
    let exe = std::env::current_exe().map_err(TestkitError::Verbs)?;
    let spawn = |role: &str| -> io::Result<Child> {
        Command::new(&exe)
            .arg(test_name)
            .arg("--exact")
            .arg("--nocapture")
            .env(ENV_ROLE, role)
            .env(ENV_BARRIER_PORT, barrier_port.to_string())
            .env(ENV_NOTIFIER_PORT, notifier_port.to_string())
            .spawn()
    };
    let passive = spawn("passive").map_err(TestkitError::Verbs)?;
    let active = spawn("active").map_err(TestkitError::Verbs)?;
    let verdict = supervise(passive, active, flow).map_err(TestkitError::Verbs)?;
    for result in queue.collect() {
        debug!(?result, "side result");
    }
    verdict.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_pass_when_both_zero() {
        let record = ExitRecord {
            passive: Some(0),
            active: Some(0),
        };
        assert_eq!(verdict(Flow::Normal, record, false), Verdict::Passed);
    }

    #[test]
    fn verdict_skip_beats_exception() {
        let record = ExitRecord {
            passive: Some(EXIT_SKIP),
            active: Some(EXIT_EXCEPTION),
        };
        assert_eq!(
            verdict(Flow::Normal, record, false),
            Verdict::Skipped {
                side: Side::Passive
            }
        );
    }

    #[test]
    fn verdict_exception_between_bounds() {
        for code in 1..EXIT_SKIP {
            let record = ExitRecord {
                passive: Some(0),
                active: Some(code),
            };
            assert_eq!(
                verdict(Flow::Normal, record, false),
                Verdict::SideException { side: Side::Active }
            );
        }
    }

    #[test]
    fn verdict_bad_flow_requires_failure() {
        let record = ExitRecord {
            passive: Some(0),
            active: Some(0),
        };
        assert_eq!(
            verdict(Flow::Bad, record, false),
            Verdict::ExpectedFailureMissing
        );
        // Children that had to be killed are the expected bad-flow shape.
        let record = ExitRecord {
            passive: None,
            active: None,
        };
        assert_eq!(verdict(Flow::Bad, record, true), Verdict::Passed);
    }

    #[test]
    fn verdict_stuck_normal_flow() {
        let record = ExitRecord {
            passive: Some(0),
            active: None,
        };
        assert_eq!(verdict(Flow::Normal, record, true), Verdict::Stuck);
    }

    #[test]
    fn exit_codes_follow_contract() {
        assert_eq!(exit_code_for(&Ok(())), EXIT_PASS);
        assert_eq!(
            exit_code_for(&Err(TestkitError::skip("nope"))),
            EXIT_SKIP
        );
        assert_eq!(
            exit_code_for(&Err(TestkitError::PeerNotBound)),
            EXIT_EXCEPTION
        );
    }

    #[test]
    fn supervise_reads_stub_exit_codes() {
        let spawn = |code: i32| {
            Command::new("sh")
                .arg("-c")
                .arg(format!("exit {code}"))
                .spawn()
                .unwrap()
        };
        let verdict = supervise(spawn(0), spawn(0), Flow::Normal).unwrap();
        assert_eq!(verdict, Verdict::Passed);

        let verdict = supervise(spawn(5), spawn(0), Flow::Normal).unwrap();
        assert_eq!(
            verdict,
            Verdict::Skipped {
                side: Side::Passive
            }
        );

        let verdict = supervise(spawn(2), spawn(0), Flow::Normal).unwrap();
        assert_eq!(
            verdict,
            Verdict::SideException {
                side: Side::Passive
            }
        );
    }

    #[test]
    fn supervise_kills_stuck_children() {
        let spawn = || Command::new("sleep").arg("30").spawn().unwrap();
        // Bad flow: a hang is the expected failure shape.
        let verdict = supervise(spawn(), spawn(), Flow::Bad).unwrap();
        assert_eq!(verdict, Verdict::Passed);
    }

    #[test]
    fn barrier_meets_across_threads() {
        let port = portpicker::pick_unused_port().unwrap();
        let passive = std::thread::spawn(move || {
            let mut barrier = Rendezvous::passive(port).unwrap();
            barrier.wait().unwrap();
        });
        let mut barrier = Rendezvous::active(port).unwrap();
        barrier.wait().unwrap();
        passive.join().unwrap();
    }

    #[test]
    fn notification_roundtrip() {
        let (queue, port) = NotificationQueue::bind().unwrap();
        let result = SideResult {
            side: Side::Active,
            outcome: SideOutcome::Skipped("no hardware".to_owned()),
        };
        notify_parent(port, &result);
        // Give the loopback stack a beat to flush.
        std::thread::sleep(Duration::from_millis(100));
        let collected = queue.collect();
        assert_eq!(collected, vec![result]);
    }
}
