//! The end-to-end request scenarios, text in / text out through a
//! session, the way a client would see them.

use knotd_lib::{ServerConfig, Session};

fn session() -> Session {
    Session::new(ServerConfig::default())
}

/// First 32-hex-digit word in a reply.
fn guid_of(reply: &str) -> String {
    reply
        .split(|c: char| !c.is_ascii_hexdigit())
        .find(|w| w.len() == 32)
        .unwrap_or_else(|| panic!("no guid in {reply}"))
        .to_string()
}

fn ok(reply: String) -> String {
    assert!(reply.starts_with("ok "), "unexpected reply: {reply}");
    reply
}

#[test]
fn typed_insert_and_lookup() {
    let mut s = session();
    let reply = ok(s.submit(r#"write (type="Person" name="Alice" value="1")"#));
    let g1 = guid_of(&reply);
    assert_eq!(
        s.submit(r#"read (type="Person" name="Alice" result=((value)))"#),
        r#"ok (("1"))"#
    );
    assert_eq!(
        s.submit(r#"read (type="Person" name="Alice" result=((guid)))"#),
        format!("ok (({g1}))")
    );
}

#[test]
fn key_deduplication() {
    let mut s = session();
    let first = ok(s.submit(r#"write (type="Person" name="Alice" value="2" key=(type name))"#));
    let count = ok(s.submit(r#"read (type="Person" name="Alice" result=(count))"#));

    let second = ok(s.submit(r#"write (type="Person" name="Alice" value="2" key=(type name))"#));
    assert_eq!(guid_of(&first), guid_of(&second));

    // No new primitive: the same single match, the same guid.
    assert_eq!(
        ok(s.submit(r#"read (type="Person" name="Alice" result=(count))"#)),
        count
    );
}

#[test]
fn unique_rejection() {
    let mut s = session();
    ok(s.submit(r#"write (type="Person" name="Alice" value="2" key=(type name))"#));
    let reply = s.submit(r#"write (type="Person" name="Alice" value="3" unique=(type name))"#);
    assert!(reply.starts_with("error \"UNIQUE_EXISTS"), "{reply}");

    // The store is unchanged: still one Alice, still value 2.
    assert_eq!(
        s.submit(r#"read (type="Person" name="Alice" result=((value)))"#),
        r#"ok (("2"))"#
    );
}

#[test]
fn versioning_retires_the_old_generation() {
    let mut s = session();
    let first = ok(s.submit(r#"write (type="Person" name="Alice" value="1")"#));
    let g1 = guid_of(&first);

    let second = ok(s.submit(&format!(
        r#"write (guid={g1} type="Person" name="Alice" value="2" key=(type name))"#
    )));
    let g2 = guid_of(&second);
    assert_ne!(g1, g2);

    assert_eq!(
        s.submit(r#"read (type="Person" name="Alice" newest=0 result=((guid value)))"#),
        format!(r#"ok (({g2} "2"))"#)
    );
    // The predecessor is reachable by explicit generation.
    assert_eq!(
        s.submit(&format!("read (guid={g1} newest=null result=((value)))")),
        r#"ok (("1"))"#
    );
    // And the new generation names the old one as previous.
    assert_eq!(
        s.submit(&format!("read (guid={g2} newest=null result=((previous)))")),
        format!("ok (({g1}))")
    );
}

#[test]
fn cursor_pagination_covers_the_set_exactly_once() {
    let mut s = session();
    for i in 0..100 {
        ok(s.submit(&format!(r#"write (type="T" value="{i:03}")"#)));
    }

    let mut seen: Vec<String> = Vec::new();
    let mut cursor: Option<String> = None;
    for _page in 0..50 {
        let src = match &cursor {
            None => r#"read (type="T" sort=(timestamp) pagesize=10 result=((guid) cursor))"#
                .to_string(),
            Some(c) => format!(
                r#"read (type="T" sort=(timestamp) pagesize=10 cursor="{c}" result=((guid) cursor))"#
            ),
        };
        let reply = ok(s.submit(&src));
        let page: Vec<String> = reply
            .split(|c: char| !c.is_ascii_hexdigit())
            .filter(|w| w.len() == 32)
            .map(str::to_string)
            .collect();
        seen.extend(page);
        match reply.split_once("cursor:") {
            Some((_, tail)) => {
                let tail = tail.trim_end_matches([')', '"', ' ']);
                cursor = Some(format!("cursor:{tail}"));
            }
            None => break,
        }
    }

    assert_eq!(seen.len(), 100, "every guid exactly once");
    let mut dedup = seen.clone();
    dedup.sort();
    dedup.dedup();
    assert_eq!(dedup.len(), 100, "no duplicates");

    // Timestamp order is insertion order here, so guids arrive in the
    // order the writes created them.
    let replay = ok(s.submit(
        r#"read (type="T" sort=(timestamp) pagesize=100 countlimit=100 result=((guid)))"#,
    ));
    let straight: Vec<String> = replay
        .split(|c: char| !c.is_ascii_hexdigit())
        .filter(|w| w.len() == 32)
        .map(str::to_string)
        .collect();
    assert_eq!(seen, straight);
}

#[test]
fn sorted_read_pages_in_value_order() {
    let mut s = session();
    for v in ["delta", "alpha", "echo", "bravo", "charlie"] {
        ok(s.submit(&format!(r#"write (type="S" value="{v}")"#)));
    }
    let reply = ok(s.submit(r#"read (type="S" sort=(value) pagesize=3 result=((value) cursor))"#));
    assert!(reply.contains(r#"("alpha") ("bravo") ("charlie")"#), "{reply}");

    let cursor = reply
        .split_once("cursor:")
        .map(|(_, tail)| format!("cursor:{}", tail.trim_end_matches([')', '"', ' '])))
        .expect("sorted page should carry a cursor");
    let rest = ok(s.submit(&format!(
        r#"read (type="S" sort=(value) pagesize=3 cursor="{cursor}" result=((value) cursor))"#
    )));
    assert!(rest.contains(r#"("delta") ("echo")"#), "{rest}");
}

#[test]
fn deep_structural_query() {
    let mut s = session();
    ok(s.submit(
        r#"write (type="Person" name="Alice"
             (<-left type="Person" name="Bob"
               (<-left type="Person" name="Carol")))"#,
    ));

    let reply = ok(s.submit(
        r#"read (type="Person" name="Alice" result=((name contents))
             (<-left result=((name contents))
               (<-left result=((name)))))"#,
    ));
    assert_eq!(reply, r#"ok (("Alice" (("Bob" (("Carol"))))))"#);
}

#[test]
fn misses_report_empty() {
    let mut s = session();
    assert!(s.submit(r#"read (name="nobody")"#).starts_with("error \"EMPTY"));
    assert!(
        s.submit(r#"read (type="NoSuchType")"#)
            .starts_with("error \"EMPTY")
    );
}
