use std::hint::black_box;
use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, Criterion};
use tandem_collab::autosave::AutoSaveScheduler;
use tandem_collab::broadcast::{encode_frame, AtomicBroadcastStats, Member, Room, SlowConsumerPolicy};
use tandem_collab::fingerprint::fingerprint;
use tandem_collab::protocol::{Message, UserInfo};
use tandem_collab::storage::{MemoryStore, RocksStore, StoreConfig};
use tandem_collab::version::VersionStore;
use tokio::sync::mpsc;
use uuid::Uuid;

fn sample_text(len: usize) -> String {
    "lorem ipsum dolor sit amet ".repeat(len / 27 + 1)[..len].to_string()
}

fn bench_fingerprint_1kb(c: &mut Criterion) {
    let text = sample_text(1024);
    c.bench_function("fingerprint_1KB", |b| {
        b.iter(|| black_box(fingerprint(black_box(&text))))
    });
}

fn bench_fingerprint_64kb(c: &mut Criterion) {
    let text = sample_text(64 * 1024);
    c.bench_function("fingerprint_64KB", |b| {
        b.iter(|| black_box(fingerprint(black_box(&text))))
    });
}

fn bench_content_encode(c: &mut Criterion) {
    let text = sample_text(1024);
    let msg = Message::content("doc", text.clone(), 42, fingerprint(&text))
        .with_author("u1", "Ada", "doc");

    c.bench_function("content_encode_1KB", |b| {
        b.iter(|| black_box(encode_frame(black_box(&msg)).unwrap()))
    });
}

fn bench_content_decode(c: &mut Criterion) {
    let text = sample_text(1024);
    let encoded = Message::edit(text.clone(), 42, fingerprint(&text))
        .encode()
        .unwrap();

    c.bench_function("content_decode_1KB", |b| {
        b.iter(|| black_box(Message::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_presence_encode(c: &mut Criterion) {
    let users: Vec<UserInfo> = (0..100)
        .map(|i| UserInfo {
            user_id: format!("user_{i}"),
            username: format!("User {i}"),
            cursor_position: Some(i),
        })
        .collect();
    let msg = Message::presence(users);

    c.bench_function("presence_encode_100_users", |b| {
        b.iter(|| black_box(msg.encode().unwrap()))
    });
}

fn bench_update_content_uncontended(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let versions = VersionStore::new(Arc::new(MemoryStore::new()));
    let initial = rt.block_on(versions.load("bench")).unwrap();
    let mut version = initial.version;
    let mut hash = initial.fingerprint;
    let text = sample_text(1024);

    c.bench_function("update_content_accept_1KB", |b| {
        b.iter(|| {
            let outcome = versions
                .update_content("bench", text.clone(), version, hash)
                .unwrap();
            version = outcome.version;
            hash = outcome.fingerprint;
            black_box(outcome.accepted)
        })
    });

    rt.block_on(versions.wait_for_all_writes());
}

fn bench_update_content_reject(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let versions = VersionStore::new(Arc::new(MemoryStore::new()));
    rt.block_on(versions.load("bench")).unwrap();
    let state = versions
        .update_content("bench", "first".into(), 0, fingerprint(""))
        .unwrap();
    assert!(state.accepted);

    c.bench_function("update_content_reject", |b| {
        b.iter(|| {
            black_box(
                versions
                    .update_content("bench", "stale".into(), 0, fingerprint(""))
                    .unwrap(),
            )
        })
    });
}

fn bench_broadcast_100_members(c: &mut Criterion) {
    let mut room = Room::new("doc", Arc::new(AtomicBroadcastStats::default()));
    let mut receivers = Vec::new();
    for i in 0..100 {
        let (tx, rx) = mpsc::channel(1024);
        room.add(Member::new(Uuid::new_v4(), format!("u{i}"), format!("User {i}"), tx));
        receivers.push(rx);
    }
    let frame = encode_frame(&Message::cursor(10, None)).unwrap();

    c.bench_function("broadcast_100_members", |b| {
        b.iter(|| {
            let evicted = room.broadcast(&frame, None, None, SlowConsumerPolicy::Disconnect);
            for rx in &mut receivers {
                let _ = rx.try_recv();
            }
            black_box(evicted)
        })
    });
}

fn bench_autosave_due_1000(c: &mut Criterion) {
    let now = Instant::now();
    c.bench_function("autosave_due_1000_docs", |b| {
        b.iter(|| {
            let mut scheduler = AutoSaveScheduler::new(std::time::Duration::from_secs(30));
            for i in 0..1000 {
                scheduler.mark_dirty(&format!("doc{i}"), String::new(), now);
            }
            black_box(scheduler.due(now))
        })
    });
}

fn bench_rocks_conditional_update(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
    let versions = VersionStore::new(store);
    let initial = rt.block_on(versions.load("bench")).unwrap();
    let mut version = initial.version;
    let mut hash = initial.fingerprint;
    let text = sample_text(4096);

    c.bench_function("rocks_write_through_4KB", |b| {
        b.iter(|| {
            let outcome = versions
                .update_content("bench", text.clone(), version, hash)
                .unwrap();
            version = outcome.version;
            hash = outcome.fingerprint;
            rt.block_on(versions.wait_for_writes("bench"));
        })
    });
}

criterion_group!(
    benches,
    bench_fingerprint_1kb,
    bench_fingerprint_64kb,
    bench_content_encode,
    bench_content_decode,
    bench_presence_encode,
    bench_update_content_uncontended,
    bench_update_content_reject,
    bench_broadcast_100_members,
    bench_autosave_due_1000,
    bench_rocks_conditional_update,
);
criterion_main!(benches);
