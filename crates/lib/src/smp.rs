//! Single-master-multi-process coordination: the leader serializes every
//! write behind a pause handshake with its read-only followers.
//!
//! The transport is abstract (`SmpLink`); the real server shell speaks
//! `smp (pre-write)` / `smp (post-write)` over its connection layer, and
//! tests use an in-memory queue pair. Follower supervision is a callback
//! rather than a raw signal so the policy stays testable.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use knotd_lib_core::error::EngineError;
use knotd_lib_core::iter::Step;
use knotd_store::MemStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpMsg {
    Prewrite,
    Postwrite,
}

/// Leader-side write-gate state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Run,
    SentPause,
    Pause,
    SentRun,
}

/// One direction of a leader↔follower pipe.
pub trait SmpLink {
    fn send(&mut self, msg: SmpMsg);
}

/// Supervision hook: what to do with a follower that will not pause.
/// The server shell sends SIGQUIT and lets the supervisor respawn; tests
/// record the pid.
pub trait Supervision {
    fn kill(&mut self, pid: u32);
}

struct FollowerSeat {
    pid: u32,
    link: Box<dyn SmpLink>,
    paused: bool,
    /// Armed once at least half the followers have paused.
    deadline: Option<Instant>,
}

pub struct SmpLeader {
    state: LeaderState,
    followers: Vec<FollowerSeat>,
    supervision: Box<dyn Supervision>,
    pause_timeout: Duration,
}

impl SmpLeader {
    pub fn new(supervision: Box<dyn Supervision>, pause_timeout: Duration) -> SmpLeader {
        SmpLeader {
            state: LeaderState::Run,
            followers: Vec::new(),
            supervision,
            pause_timeout,
        }
    }

    pub fn state(&self) -> LeaderState {
        self.state
    }

    pub fn follower_count(&self) -> usize {
        self.followers.len()
    }

    /// `smp (connect PID)` from a follower session.
    pub fn register(&mut self, pid: u32, link: Box<dyn SmpLink>) {
        log::debug!("smp: follower {pid} connected");
        self.followers.push(FollowerSeat {
            pid,
            link,
            paused: false,
            deadline: None,
        });
    }

    /// A write arrived. With no followers the gate is open immediately;
    /// otherwise broadcast the pre-write and suspend the writer until
    /// [`SmpLeader::poll`] reports the quorum.
    pub fn begin_write(&mut self) -> Result<Step<()>, EngineError> {
        match self.state {
            LeaderState::Run => {}
            other => {
                return Err(EngineError::Smp(format!(
                    "write admitted in state {other:?}"
                )));
            }
        }
        if self.followers.is_empty() {
            self.state = LeaderState::Pause;
            return Ok(Step::Ready(()));
        }
        for seat in &mut self.followers {
            seat.paused = false;
            seat.deadline = None;
            seat.link.send(SmpMsg::Prewrite);
        }
        self.state = LeaderState::SentPause;
        log::debug!("smp: pre-write broadcast, suspending the writer");
        Ok(Step::More)
    }

    /// `ok (paused)` came back from a follower.
    pub fn note_paused(&mut self, pid: u32) {
        if let Some(seat) = self.followers.iter_mut().find(|s| s.pid == pid) {
            seat.paused = true;
            seat.deadline = None;
        }
    }

    /// A follower session died; drop its seat and re-evaluate the gate.
    pub fn follower_died(&mut self, pid: u32) {
        self.followers.retain(|s| s.pid != pid);
        log::warn!("smp: follower {pid} disappeared");
    }

    /// Advance the gate. `Ready` once every follower is paused and the
    /// suspended write may resume. Once at least half have paused, the
    /// stragglers get a deadline; past it they are killed and unseated.
    pub fn poll(&mut self, now: Instant) -> Step<()> {
        if self.state != LeaderState::SentPause {
            return match self.state {
                LeaderState::Pause => Step::Ready(()),
                _ => Step::More,
            };
        }

        let paused = self.followers.iter().filter(|s| s.paused).count();
        if paused * 2 >= self.followers.len() {
            for seat in &mut self.followers {
                if !seat.paused && seat.deadline.is_none() {
                    seat.deadline = Some(now + self.pause_timeout);
                }
            }
        }
        let mut dead = Vec::new();
        for seat in &mut self.followers {
            if !seat.paused && seat.deadline.is_some_and(|d| now >= d) {
                log::warn!("smp: follower {} ignored the pre-write, killing it", seat.pid);
                self.supervision.kill(seat.pid);
                dead.push(seat.pid);
            }
        }
        for pid in dead {
            self.follower_died(pid);
        }

        if self.followers.iter().all(|s| s.paused) {
            self.state = LeaderState::Pause;
            log::debug!("smp: all followers paused, resuming the writer");
            Step::Ready(())
        } else {
            Step::More
        }
    }

    /// The write committed (or was cancelled while suspended): let the
    /// followers run again.
    pub fn end_write(&mut self) {
        for seat in &mut self.followers {
            seat.paused = false;
            seat.link.send(SmpMsg::Postwrite);
        }
        self.state = LeaderState::SentRun;
        // No acknowledgement is required for resuming.
        self.state = LeaderState::Run;
    }
}

/// Follower-side handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerState {
    Run,
    Pause,
}

pub struct SmpFollower {
    pid: u32,
    state: FollowerState,
    store: Rc<RefCell<MemStore>>,
}

impl SmpFollower {
    pub fn new(pid: u32, store: Rc<RefCell<MemStore>>) -> SmpFollower {
        SmpFollower {
            pid,
            state: FollowerState::Run,
            store,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> FollowerState {
        self.state
    }

    /// `smp (pre-write)`: take the exclusive read ticket and report
    /// paused. Single-threaded, so the ticket is the state flip itself.
    pub fn on_prewrite(&mut self) -> FollowerState {
        self.state = FollowerState::Pause;
        self.state
    }

    /// `smp (post-write)`: refresh the mirror and run again. A refresh
    /// failure is fatal for this follower (a stale mirror must not keep
    /// serving reads); the caller drops the session and the supervisor
    /// restarts the process.
    pub fn on_postwrite(&mut self, leader_store: &MemStore) -> Result<FollowerState, EngineError> {
        self.store
            .borrow_mut()
            .refresh_from(leader_store)
            .map_err(|err| EngineError::Smp(format!("refresh failed: {err}")))?;
        self.state = FollowerState::Run;
        Ok(self.state)
    }
}

/// In-memory link: a shared queue the test (or an in-process follower)
/// drains.
#[derive(Default, Clone)]
pub struct QueueLink {
    queue: Rc<RefCell<VecDeque<SmpMsg>>>,
}

impl QueueLink {
    pub fn new() -> QueueLink {
        QueueLink::default()
    }

    pub fn drain(&self) -> Vec<SmpMsg> {
        self.queue.borrow_mut().drain(..).collect()
    }
}

impl SmpLink for QueueLink {
    fn send(&mut self, msg: SmpMsg) {
        self.queue.borrow_mut().push_back(msg);
    }
}

/// Supervision that only remembers; tests assert on it.
#[derive(Default, Clone)]
pub struct RecordingSupervision {
    pub killed: Rc<RefCell<Vec<u32>>>,
}

impl Supervision for RecordingSupervision {
    fn kill(&mut self, pid: u32) {
        self.killed.borrow_mut().push(pid);
    }
}

/// Parse the `smp (…)` command surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpCommand {
    Connect(u32),
    Prewrite,
    Postwrite,
}

impl SmpCommand {
    pub fn parse(text: &str) -> Result<SmpCommand, EngineError> {
        let body = text
            .trim()
            .strip_prefix("smp")
            .map(str::trim)
            .and_then(|rest| rest.strip_prefix('('))
            .and_then(|rest| rest.strip_suffix(')'))
            .map(str::trim)
            .ok_or_else(|| EngineError::syntax(0, "smp wants `smp (…)`"))?;
        match body {
            "pre-write" => Ok(SmpCommand::Prewrite),
            "post-write" => Ok(SmpCommand::Postwrite),
            _ => match body.strip_prefix("connect").map(str::trim) {
                Some(pid) => pid
                    .parse()
                    .map(SmpCommand::Connect)
                    .map_err(|_| EngineError::syntax(0, "bad pid in smp connect")),
                None => Err(EngineError::syntax(0, format!("unknown smp command `{body}`"))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn leader_with(timeout_ms: u64) -> (SmpLeader, RecordingSupervision) {
        let supervision = RecordingSupervision::default();
        let leader = SmpLeader::new(
            Box::new(supervision.clone()),
            Duration::from_millis(timeout_ms),
        );
        (leader, supervision)
    }

    #[test]
    fn no_followers_means_an_open_gate() {
        let (mut leader, _) = leader_with(100);
        assert_eq!(leader.begin_write().unwrap(), Step::Ready(()));
        assert_eq!(leader.state(), LeaderState::Pause);
        leader.end_write();
        assert_eq!(leader.state(), LeaderState::Run);
    }

    #[test]
    fn gate_waits_for_every_follower() {
        let (mut leader, _) = leader_with(100);
        let (a, b) = (QueueLink::new(), QueueLink::new());
        leader.register(1, Box::new(a.clone()));
        leader.register(2, Box::new(b.clone()));

        assert_eq!(leader.begin_write().unwrap(), Step::More);
        assert_eq!(a.drain(), vec![SmpMsg::Prewrite]);
        assert_eq!(b.drain(), vec![SmpMsg::Prewrite]);
        assert_eq!(leader.state(), LeaderState::SentPause);

        let now = Instant::now();
        assert_eq!(leader.poll(now), Step::More);
        leader.note_paused(1);
        assert_eq!(leader.poll(now), Step::More);
        leader.note_paused(2);
        assert_eq!(leader.poll(now), Step::Ready(()));
        assert_eq!(leader.state(), LeaderState::Pause);

        leader.end_write();
        assert_eq!(a.drain(), vec![SmpMsg::Postwrite]);
        assert_eq!(leader.state(), LeaderState::Run);
    }

    #[test]
    fn stragglers_get_killed_after_the_timeout() {
        let (mut leader, supervision) = leader_with(50);
        let (a, b) = (QueueLink::new(), QueueLink::new());
        leader.register(1, Box::new(a));
        leader.register(2, Box::new(b));

        leader.begin_write().unwrap();
        leader.note_paused(1);
        let now = Instant::now();
        // Half paused: the straggler's clock starts now.
        assert_eq!(leader.poll(now), Step::More);
        // Not yet expired.
        assert_eq!(leader.poll(now + Duration::from_millis(10)), Step::More);
        // Expired: killed, unseated, and the gate opens.
        assert_eq!(
            leader.poll(now + Duration::from_millis(60)),
            Step::Ready(())
        );
        assert_eq!(supervision.killed.borrow().as_slice(), &[2]);
        assert_eq!(leader.follower_count(), 1);
    }

    #[test]
    fn follower_death_reopens_the_gate() {
        let (mut leader, _) = leader_with(100);
        let link = QueueLink::new();
        leader.register(1, Box::new(link));
        leader.begin_write().unwrap();
        leader.follower_died(1);
        assert_eq!(leader.poll(Instant::now()), Step::Ready(()));
    }

    #[test]
    fn double_write_admission_is_refused() {
        let (mut leader, _) = leader_with(100);
        let link = QueueLink::new();
        leader.register(1, Box::new(link));
        leader.begin_write().unwrap();
        assert!(leader.begin_write().is_err());
    }

    #[test]
    fn command_surface_parses() {
        assert_eq!(
            SmpCommand::parse("smp (connect 4242)").unwrap(),
            SmpCommand::Connect(4242)
        );
        assert_eq!(
            SmpCommand::parse("smp (pre-write)").unwrap(),
            SmpCommand::Prewrite
        );
        assert_eq!(
            SmpCommand::parse("smp (post-write)").unwrap(),
            SmpCommand::Postwrite
        );
        assert!(SmpCommand::parse("smp (explode)").is_err());
        assert!(SmpCommand::parse("smp").is_err());
    }
}
