//! The write gate across a leader and a follower: a follower's reads
//! must not observe a write until the post-write refresh lands.

use std::time::{Duration, Instant};

use knotd_lib::config::ServerConfig;
use knotd_lib::session::Session;
use knotd_lib::smp::{
    LeaderState, QueueLink, RecordingSupervision, SmpLeader, SmpMsg,
};
use knotd_lib_core::iter::Step;

struct Pair {
    leader: Session,
    follower: Session,
    gate: SmpLeader,
    link: QueueLink,
    supervision: RecordingSupervision,
}

fn pair() -> Pair {
    let leader = Session::new(ServerConfig::default());
    let mut follower = Session::follower(ServerConfig::default(), 4242, leader.store());
    let supervision = RecordingSupervision::default();
    let mut gate = SmpLeader::new(
        Box::new(supervision.clone()),
        Duration::from_millis(100),
    );
    let link = QueueLink::new();

    // The follower announces itself on its control connection.
    assert_eq!(follower.submit("smp (connect 4242)"), "ok (running)");
    gate.register(4242, Box::new(link.clone()));

    Pair {
        leader,
        follower,
        gate,
        link,
        supervision,
    }
}

/// Deliver queued gate messages to the follower session, returning its
/// reply lines.
fn pump(pair: &mut Pair) -> Vec<String> {
    pair.link
        .drain()
        .into_iter()
        .map(|msg| match msg {
            SmpMsg::Prewrite => pair.follower.submit("smp (pre-write)"),
            SmpMsg::Postwrite => pair.follower.submit("smp (post-write)"),
        })
        .collect()
}

#[test]
fn write_gate_end_to_end() {
    let mut pair = pair();

    // Seed the follower with an initial write so both sides agree on a
    // baseline.
    assert_eq!(pair.gate.begin_write().unwrap(), Step::More);
    assert_eq!(pair.gate.state(), LeaderState::SentPause);
    let replies = pump(&mut pair);
    assert_eq!(replies, vec!["ok (paused)".to_string()]);
    pair.gate.note_paused(4242);
    assert_eq!(pair.gate.poll(Instant::now()), Step::Ready(()));
    assert_eq!(pair.gate.state(), LeaderState::Pause);

    let reply = pair.leader.submit(r#"write (type="Doc" name="a" value="1")"#);
    assert!(reply.starts_with("ok ("), "{reply}");

    // The write is committed on the leader, but the paused follower has
    // not refreshed: its reads still miss.
    assert!(
        pair.follower
            .submit(r#"read (name="a")"#)
            .starts_with("error \"EMPTY"),
        "follower saw the write before post-write"
    );

    pair.gate.end_write();
    assert_eq!(pair.gate.state(), LeaderState::Run);
    let replies = pump(&mut pair);
    assert_eq!(replies, vec!["ok (running)".to_string()]);

    // Now the follower's primitive count has caught up and the read
    // observes the new primitive.
    assert_eq!(
        pair.follower.submit(r#"read (name="a" result=((value)))"#),
        r#"ok (("1"))"#
    );
    assert!(pair.supervision.killed.borrow().is_empty());
}

#[test]
fn consecutive_writes_reuse_the_gate() {
    let mut pair = pair();
    for i in 0..3 {
        assert_eq!(pair.gate.begin_write().unwrap(), Step::More);
        pump(&mut pair);
        pair.gate.note_paused(4242);
        assert_eq!(pair.gate.poll(Instant::now()), Step::Ready(()));
        let reply = pair
            .leader
            .submit(&format!(r#"write (type="Doc" value="{i}")"#));
        assert!(reply.starts_with("ok ("), "{reply}");
        pair.gate.end_write();
        pump(&mut pair);
    }
    assert_eq!(
        pair.follower.submit(r#"read (type="Doc" result=(count))"#),
        "ok (3)"
    );
}

#[test]
fn cancelled_write_still_releases_the_followers() {
    let mut pair = pair();
    pair.gate.begin_write().unwrap();
    pump(&mut pair);
    pair.gate.note_paused(4242);
    assert_eq!(pair.gate.poll(Instant::now()), Step::Ready(()));

    // The client went away before the write ran; the gate must still
    // broadcast the post-write so followers resume.
    pair.gate.end_write();
    let replies = pump(&mut pair);
    assert_eq!(replies, vec!["ok (running)".to_string()]);
    assert_eq!(pair.gate.state(), LeaderState::Run);
}
