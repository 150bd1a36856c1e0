use criterion::{Criterion, criterion_group, criterion_main};
use knotd_lib::{ServerConfig, Session};

fn seeded_session(n: usize) -> Session {
    let mut session = Session::new(ServerConfig::default());
    for i in 0..n {
        let kind = if i % 2 == 0 { "Even" } else { "Odd" };
        let reply = session.submit(&format!(r#"write (type="{kind}" value="{i}")"#));
        assert!(reply.starts_with("ok "), "{reply}");
    }
    session
}

fn bench_reads(c: &mut Criterion) {
    let mut session = seeded_session(2_000);

    c.bench_function("typed count", |b| {
        b.iter(|| {
            let reply = session.submit(r#"read (type="Even" result=(count))"#);
            assert!(reply.starts_with("ok "), "{reply}");
        })
    });

    c.bench_function("intersected value lookup", |b| {
        b.iter(|| {
            let reply = session.submit(r#"read (type="Even" value="100" result=((guid)))"#);
            assert!(reply.starts_with("ok "), "{reply}");
        })
    });

    c.bench_function("paged scan", |b| {
        b.iter(|| {
            let reply =
                session.submit(r#"read (type="Odd" pagesize=50 result=((value) cursor))"#);
            assert!(reply.starts_with("ok "), "{reply}");
        })
    });
}

criterion_group!(benches, bench_reads);
criterion_main!(benches);
