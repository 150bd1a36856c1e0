use std::cell::RefCell;
use std::rc::Rc;

use knotd_lib_core::error::EngineError;
use knotd_lib_core::parser::RequestKind;
use knotd_lib_core::value::Value;
use knotd_lib_core::write::Bootstrap;
use knotd_store::MemStore;

use crate::config::ServerConfig;
use crate::request::Request;
use crate::smp::{FollowerState, SmpCommand, SmpFollower};

/// One client connection's worth of state: text in, one reply line out.
/// The connection and framing layers live in the server shell; sessions
/// only ever see whole request lines.
pub struct Session {
    store: Rc<RefCell<MemStore>>,
    boot: Bootstrap,
    config: ServerConfig,
    follower: Option<SmpFollower>,
    /// A follower's handle on the leader's store, for post-write
    /// refreshes. Wired by the harness; real deployments refresh from
    /// the shared on-disk store.
    upstream: Option<Rc<RefCell<MemStore>>>,
}

impl Session {
    /// A leader session with its own store.
    pub fn new(config: ServerConfig) -> Session {
        let store = Rc::new(RefCell::new(MemStore::new(config.instance_id)));
        Session {
            store,
            boot: Bootstrap::new(),
            config,
            follower: None,
            upstream: None,
        }
    }

    /// A follower session: a read-only mirror of the leader's store.
    pub fn follower(config: ServerConfig, pid: u32, upstream: Rc<RefCell<MemStore>>) -> Session {
        let store = Rc::new(RefCell::new(MemStore::read_only(config.instance_id)));
        let follower = SmpFollower::new(pid, Rc::clone(&store));
        Session {
            store,
            boot: Bootstrap::new(),
            config,
            follower: Some(follower),
            upstream: Some(upstream),
        }
    }

    pub fn store(&self) -> Rc<RefCell<MemStore>> {
        Rc::clone(&self.store)
    }

    pub fn is_follower(&self) -> bool {
        self.follower.is_some()
    }

    /// Evaluate one request line and render the reply line.
    pub fn submit(&mut self, text: &str) -> String {
        let text = text.trim();
        if text.starts_with("smp") {
            return match self.smp(text) {
                Ok(word) => format!("ok ({word})"),
                Err(err) => Self::error_line(&err),
            };
        }
        match self.dispatch(text) {
            Ok(value) => format!("ok {value}"),
            Err(err) => Self::error_line(&err),
        }
    }

    fn error_line(err: &EngineError) -> String {
        let mut message = format!("{} {}", err.code(), err);
        message = message.replace('\\', "\\\\").replace('"', "\\\"");
        format!("error \"{message}\"")
    }

    fn dispatch(&mut self, text: &str) -> Result<Value, EngineError> {
        if text.is_empty() {
            return Err(EngineError::syntax(0, "empty request"));
        }

        let mut request = {
            let store = self.store.borrow();
            Request::prepare(text, &*store, &mut self.boot, self.config.deadline_ms)?
        };
        if request.kind == RequestKind::Write && self.follower.is_some() {
            return Err(EngineError::SmpWrite(
                "this process is a follower; write to the leader".into(),
            ));
        }
        let mut store = self.store.borrow_mut();
        request.run(&mut *store, &mut self.boot)
    }

    fn smp(&mut self, text: &str) -> Result<&'static str, EngineError> {
        match SmpCommand::parse(text)? {
            SmpCommand::Connect(pid) => {
                // Registration with the write gate happens in the server
                // shell, which owns the connection this arrived on.
                log::debug!("smp: connect from pid {pid}");
                Ok("running")
            }
            SmpCommand::Prewrite => match &mut self.follower {
                Some(follower) => {
                    follower.on_prewrite();
                    Ok("paused")
                }
                None => Err(EngineError::Smp("pre-write sent to a non-follower".into())),
            },
            SmpCommand::Postwrite => {
                let follower = self
                    .follower
                    .as_mut()
                    .ok_or_else(|| EngineError::Smp("post-write sent to a non-follower".into()))?;
                let upstream = self
                    .upstream
                    .as_ref()
                    .ok_or_else(|| EngineError::Smp("follower has no upstream".into()))?;
                let state = follower.on_postwrite(&upstream.borrow())?;
                debug_assert_eq!(state, FollowerState::Run);
                Ok("running")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use knotd_helpers::Config as _;
    use pretty_assertions::assert_eq;

    use super::*;

    fn session() -> Session {
        Session::new(ServerConfig::default().config(|c| c.deadline_ms = 0))
    }

    #[test]
    fn ok_and_error_lines() {
        let mut s = session();
        let reply = s.submit(r#"write (name="a" value="1")"#);
        assert!(reply.starts_with("ok ("), "{reply}");

        assert_eq!(
            s.submit(r#"read (name="missing")"#),
            r#"error "EMPTY null result""#
        );
        assert!(s.submit("nonsense").starts_with("error \"SYNTAX"));
        assert!(s.submit("").starts_with("error \"SYNTAX"));
    }

    #[test]
    fn read_your_own_write() {
        let mut s = session();
        s.submit(r#"write (type="Person" name="Alice" value="1")"#);
        assert_eq!(
            s.submit(r#"read (type="Person" name="Alice" result=((value)))"#),
            r#"ok (("1"))"#
        );
    }

    #[test]
    fn follower_refuses_writes_and_pauses() {
        let leader = session();
        let mut follower =
            Session::follower(ServerConfig::default(), 42, leader.store());

        assert!(
            follower
                .submit(r#"write (name="x")"#)
                .starts_with("error \"SMPWRITE"),
        );
        assert_eq!(follower.submit("smp (pre-write)"), "ok (paused)");
        assert_eq!(follower.submit("smp (post-write)"), "ok (running)");
    }
}
