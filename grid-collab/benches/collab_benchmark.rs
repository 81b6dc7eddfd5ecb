use criterion::{criterion_group, criterion_main, Criterion};
use grid_collab::broadcast::BroadcastGroup;
use grid_collab::change_log::{ChangeLog, ChangeLogConfig};
use grid_collab::gateway::{MutationGateway, SubmitRequest};
use grid_collab::model::{Change, FieldMap, FieldValue, Operation};
use grid_collab::presence::{PresenceState, PresenceUpdate};
use grid_collab::projection::Projection;
use grid_collab::protocol::SyncMessage;
use grid_collab::schema::{FieldDef, FieldType, TableSchema};
use grid_collab::storage::{
    CompressedSnapshot, MemoryStore, OperationStore, RocksStore, StoreConfig,
};
use grid_collab::transform::TransformEngine;
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

fn fields(i: u64) -> FieldMap {
    let mut f = FieldMap::new();
    f.insert("name".into(), FieldValue::text(format!("Task {i}")));
    f.insert("estimate".into(), FieldValue::Number(i as f64));
    f
}

fn op(doc_id: Uuid, sequence: u64, change: Change) -> Operation {
    Operation {
        doc_id,
        sequence,
        session_id: Uuid::new_v4(),
        client_sequence: sequence,
        change,
        timestamp_ms: 0,
    }
}

fn schema() -> TableSchema {
    TableSchema::new(vec![
        FieldDef::new("name", FieldType::Text).required(),
        FieldDef::new("estimate", FieldType::Number),
    ])
    .unwrap()
}

fn gateway(store: Arc<dyn OperationStore>) -> (MutationGateway, Uuid) {
    let log = ChangeLog::open(store, ChangeLogConfig::default()).unwrap();
    let gateway = MutationGateway::new(Arc::new(log));
    let doc = Uuid::new_v4();
    gateway.create_document(doc, schema()).unwrap();
    (gateway, doc)
}

// ─── Protocol benchmarks ────────────────────────────────────

fn bench_operation_encode(c: &mut Criterion) {
    let session = Uuid::new_v4();
    let operation = op(Uuid::new_v4(), 42, Change::set("rec-42", fields(42)));

    c.bench_function("operation_frame_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::operation(black_box(session), black_box(&operation)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_operation_decode(c: &mut Criterion) {
    let operation = op(Uuid::new_v4(), 42, Change::set("rec-42", fields(42)));
    let encoded = SyncMessage::operation(Uuid::new_v4(), &operation)
        .unwrap()
        .encode()
        .unwrap();

    c.bench_function("operation_frame_decode", |b| {
        b.iter(|| {
            let msg = SyncMessage::decode(black_box(&encoded)).unwrap();
            black_box(msg.operation_body().unwrap());
        })
    });
}

// ─── Core benchmarks ────────────────────────────────────────

fn bench_transform_over_100(c: &mut Criterion) {
    let doc = Uuid::new_v4();
    let intervening: Vec<Operation> = (1..=100)
        .map(|seq| op(doc, seq, Change::set_field(format!("rec-{}", seq % 10), "name", FieldValue::text("x"))))
        .collect();
    let engine = TransformEngine::new();
    let proposed = Change::set("rec-3", fields(3));

    c.bench_function("transform_over_100_intervening", |b| {
        b.iter(|| {
            black_box(
                engine
                    .resolve(0, black_box(proposed.clone()), black_box(&intervening))
                    .unwrap(),
            );
        })
    });
}

fn bench_projection_fold_1000(c: &mut Criterion) {
    let doc = Uuid::new_v4();
    let mut ops: Vec<Operation> = (1..=500)
        .map(|seq| op(doc, seq, Change::create(format!("rec-{seq}"), fields(seq))))
        .collect();
    ops.extend((501..=1000).map(|seq| {
        op(doc, seq, Change::set_field(format!("rec-{}", seq - 500), "estimate", FieldValue::Number(1.0)))
    }));

    c.bench_function("projection_fold_1000_ops", |b| {
        b.iter(|| black_box(Projection::fold(doc, black_box(&ops))))
    });
}

fn bench_submit_memory(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (gateway, doc) = gateway(Arc::new(MemoryStore::new()));

    c.bench_function("submit_in_memory", |b| {
        let mut i = 0u64;
        b.iter(|| {
            rt.block_on(async {
                let head = gateway.change_log().head(doc).unwrap();
                let change = Change::create(format!("rec-{i}"), fields(i));
                black_box(gateway.submit(SubmitRequest::new(doc, head, change)).await.unwrap());
            });
            i += 1;
        })
    });
}

fn bench_submit_stale_base(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (gateway, doc) = gateway(Arc::new(MemoryStore::new()));
    rt.block_on(async {
        gateway
            .submit(SubmitRequest::new(doc, 0, Change::create("shared", fields(0))))
            .await
            .unwrap();
    });

    // Every submit rebases over everything committed since sequence 1
    c.bench_function("submit_stale_base_growing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            rt.block_on(async {
                let change = Change::set_field("shared", "estimate", FieldValue::Number(i as f64));
                black_box(gateway.submit(SubmitRequest::new(doc, 1, change)).await.unwrap());
            });
            i += 1;
        })
    });
}

// ─── Storage benchmarks ─────────────────────────────────────

fn bench_submit_rocks(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (gateway, doc) = gateway(Arc::new(store));

    c.bench_function("submit_rocksdb_no_fsync", |b| {
        let mut i = 0u64;
        b.iter(|| {
            rt.block_on(async {
                let head = gateway.change_log().head(doc).unwrap();
                let change = Change::create(format!("rec-{i}"), fields(i));
                black_box(gateway.submit(SubmitRequest::new(doc, head, change)).await.unwrap());
            });
            i += 1;
        })
    });
}

fn bench_read_since_1000(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (gateway, doc) = gateway(Arc::new(store));
    rt.block_on(async {
        for i in 0..1000u64 {
            let change = Change::create(format!("rec-{i}"), fields(i));
            gateway.submit(SubmitRequest::new(doc, i, change)).await.unwrap();
        }
    });

    c.bench_function("read_since_1000_rocksdb", |b| {
        b.iter(|| {
            let count = gateway
                .change_log()
                .read_since(doc, 0)
                .unwrap()
                .filter(|op| op.is_ok())
                .count();
            black_box(count);
        })
    });
}

fn bench_lz4_snapshot_compress(c: &mut Criterion) {
    let doc = Uuid::new_v4();
    let ops: Vec<Operation> = (1..=200)
        .map(|seq| op(doc, seq, Change::create(format!("rec-{seq}"), fields(seq))))
        .collect();
    let bytes = Projection::fold(doc, &ops).encode().unwrap();

    c.bench_function("lz4_compress_projection_200_records", |b| {
        b.iter(|| black_box(CompressedSnapshot::compress(200, black_box(&bytes))))
    });
}

// ─── Presence benchmarks ────────────────────────────────────

fn bench_presence_fanout_100(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let doc = Uuid::new_v4();

    c.bench_function("presence_fanout_100_sessions", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(1024);
                let mut receivers = Vec::with_capacity(100);
                for _ in 0..100 {
                    let (rx, _) = group.join(Uuid::new_v4()).await;
                    receivers.push(rx);
                }
                let from = Uuid::new_v4();
                let update = PresenceUpdate {
                    session_id: from,
                    user_name: "bench".into(),
                    state: PresenceState::Editing {
                        record_id: "rec-1".into(),
                        field: None,
                    },
                };
                let msg = SyncMessage::presence(from, doc, &update).unwrap();
                black_box(group.publish(black_box(&msg)).await.unwrap());
            });
        })
    });
}

criterion_group!(
    benches,
    bench_operation_encode,
    bench_operation_decode,
    bench_transform_over_100,
    bench_projection_fold_1000,
    bench_submit_memory,
    bench_submit_stale_base,
    bench_submit_rocks,
    bench_read_since_1000,
    bench_lz4_snapshot_compress,
    bench_presence_fanout_100,
);
criterion_main!(benches);
