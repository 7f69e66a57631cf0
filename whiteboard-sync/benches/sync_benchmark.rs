use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use tokio::sync::mpsc;
use whiteboard_sync::{
    BoardConfig, BroadcastEngine, ClientHandle, ClientId, ClientMessage, ClientRegistry,
    ServerMessage, Stroke, Whiteboard,
};

fn sample_stroke() -> Stroke {
    let points: Vec<[u32; 2]> = (0..32).map(|i| [i * 3, i * 5]).collect();
    Stroke::new(json!({ "points": points, "color": "#1e88e5", "width": 3 }))
}

fn bench_draw_decode(c: &mut Criterion) {
    let text = ClientMessage::draw(sample_stroke()).encode().unwrap();

    c.bench_function("draw_decode_32pt", |b| {
        b.iter(|| {
            black_box(ClientMessage::decode(black_box(&text)).unwrap());
        })
    });
}

fn bench_draw_encode(c: &mut Criterion) {
    let msg = ServerMessage::Draw { line: sample_stroke() };

    c.bench_function("draw_encode_32pt", |b| {
        b.iter(|| {
            black_box(black_box(&msg).to_frame().unwrap());
        })
    });
}

fn bench_sync_encode_1000(c: &mut Criterion) {
    let msg = ServerMessage::Sync {
        lines: (0..1000).map(|_| sample_stroke()).collect(),
    };

    c.bench_function("sync_encode_1000_strokes", |b| {
        b.iter(|| {
            black_box(black_box(&msg).to_frame().unwrap());
        })
    });
}

fn bench_broadcast_100_clients(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let msg = ServerMessage::Draw { line: sample_stroke() };

    c.bench_function("broadcast_100_clients", |b| {
        b.iter(|| {
            rt.block_on(async {
                let registry = Arc::new(ClientRegistry::new());
                let mut receivers = Vec::new();
                for _ in 0..100 {
                    let (tx, rx) = mpsc::channel(16);
                    registry.register(ClientHandle::new(ClientId::new(), None, tx)).await;
                    receivers.push(rx);
                }

                let engine = BroadcastEngine::new(registry);
                let report = engine.broadcast(&msg).await.unwrap();
                black_box(report.delivered);
            })
        })
    });
}

fn bench_board_draw_50_clients(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("board_100_draws_50_clients", |b| {
        b.iter(|| {
            rt.block_on(async {
                let board = Whiteboard::new(BoardConfig {
                    outbox_capacity: 128,
                    ..BoardConfig::default()
                });
                let mut members = Vec::new();
                for _ in 0..50 {
                    members.push(board.join(None).await.unwrap());
                }

                let origin = members[0].id;
                for _ in 0..100 {
                    board
                        .apply(origin, ClientMessage::draw(sample_stroke()))
                        .await
                        .unwrap();
                }
                black_box(board.snapshot().await.len());
            })
        })
    });
}

criterion_group!(
    benches,
    bench_draw_decode,
    bench_draw_encode,
    bench_sync_encode_1000,
    bench_broadcast_100_clients,
    bench_board_draw_50_clients,
);
criterion_main!(benches);
