use criterion::{black_box, criterion_group, criterion_main, Criterion};
use flute::oti::FecEncodingId;
use flute::receiver::{BufferWriter, Receiver, ReceiverConfig};
use flute::sender::{Sender, SenderConfig};
use std::sync::Arc;

fn packets(data: &[u8], config: SenderConfig) -> Vec<Vec<u8>> {
    let mut sender = Sender::new(1, config).unwrap();
    sender.add_object(data.to_vec(), "application/octet-stream", "bench.bin", None).unwrap();
    sender.publish().unwrap();
    std::iter::from_fn(|| sender.read()).collect()
}

fn rs_config() -> SenderConfig {
    SenderConfig {
        fec_encoding: FecEncodingId::ReedSolomonGf28,
        max_source_block_length: 64,
        max_number_of_parity_symbols: 16,
        ..SenderConfig::default()
    }
}

fn bench_send(c: &mut Criterion) {
    let data = vec![42u8; 1024 * 1024];

    c.bench_function("send_1mb_nocode", |b| {
        b.iter(|| packets(black_box(&data), SenderConfig::default()))
    });
    c.bench_function("send_1mb_rs28", |b| {
        b.iter(|| packets(black_box(&data), rs_config()))
    });
}

fn bench_receive(c: &mut Criterion) {
    let data = vec![7u8; 1024 * 1024];
    let nocode = packets(&data, SenderConfig::default());
    let rs = packets(&data, rs_config());

    c.bench_function("receive_1mb_nocode", |b| {
        b.iter(|| {
            let mut rx = Receiver::new(1, Arc::new(BufferWriter::new()), ReceiverConfig::default());
            for p in &nocode {
                rx.push(black_box(p));
            }
        })
    });

    // every 8th packet lost, recovered from parity
    let lossy: Vec<_> = rs.iter().enumerate().filter(|(i, _)| i % 8 != 7).map(|(_, p)| p.clone()).collect();
    c.bench_function("receive_1mb_rs28_lossy", |b| {
        b.iter(|| {
            let mut rx = Receiver::new(1, Arc::new(BufferWriter::new()), ReceiverConfig::default());
            for p in &lossy {
                rx.push(black_box(p));
            }
        })
    });
}

criterion_group!(benches, bench_send, bench_receive);
criterion_main!(benches);
