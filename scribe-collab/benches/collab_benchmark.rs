use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use scribe_collab::broadcast::{BroadcastGroup, ConnectionId, Member};
use scribe_collab::protocol::{Delta, ServerEvent};
use scribe_collab::session::{DocumentSession, SessionConfig};
use scribe_collab::storage::{DocumentStorage, MemoryStore};
use scribe_core::{Document, Edit, OriginId};
use std::sync::Arc;
use uuid::Uuid;

fn typed_delta(chars: usize) -> Delta {
    let doc_id = Uuid::new_v4();
    let mut doc = Document::new(doc_id);
    let text: String = "abcdefghij".chars().cycle().take(chars).collect();
    let ops = doc.insert_text(0, &text, &OriginId::new("client1")).unwrap();
    let report = doc.apply(ops);
    Delta::new(doc_id, report.version, report.changes)
}

fn bench_delta_codec(c: &mut Criterion) {
    let event = ServerEvent::UpdateDocServer(typed_delta(16));
    let encoded = event.encode().unwrap();
    let json = event.to_json().unwrap();

    c.bench_function("delta_encode_16_chars", |b| b.iter(|| black_box(&event).encode().unwrap()));
    c.bench_function("delta_decode_16_chars", |b| {
        b.iter(|| ServerEvent::decode(black_box(&encoded)).unwrap())
    });
    c.bench_function("delta_decode_json_16_chars", |b| {
        b.iter(|| ServerEvent::from_json(black_box(&json)).unwrap())
    });
}

fn bench_broadcast_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let event = ServerEvent::UpdateDocServer(typed_delta(1));

    c.bench_function("broadcast_1000_msgs_100_members", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);
                let mut receivers = Vec::new();
                for i in 0..100 {
                    let member = Member {
                        client_id: format!("client{i}"),
                        user_id: format!("user{i}"),
                    };
                    receivers.push(group.add_member(ConnectionId::new(), member));
                }
                for _ in 0..1000 {
                    black_box(group.broadcast(None, event.clone()));
                }
            });
        })
    });
}

fn bench_session_commit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let origin = OriginId::new("client1");

    c.bench_function("session_100_edits", |b| {
        b.iter_batched(
            || {
                rt.block_on(async {
                    let store = Arc::new(MemoryStore::new());
                    let uuid = Uuid::new_v4();
                    store.create_document(uuid, "alice").unwrap();
                    store.save_document_text(uuid, "").unwrap();
                    (DocumentSession::new(store, SessionConfig::default()), uuid)
                })
            },
            |(session, uuid)| {
                rt.block_on(async {
                    for i in 0..100 {
                        let edit = Edit::Insert {
                            index: i,
                            text: "x".into(),
                        };
                        session.apply_edit(uuid, &origin, &edit).await.unwrap();
                    }
                })
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_delta_codec, bench_broadcast_fan_out, bench_session_commit);
criterion_main!(benches);
