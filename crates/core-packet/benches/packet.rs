use core_packet::{chunk, zlib, MsgType, Packet};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn bench_packet(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_codec");
    for size in [64usize, 512, 4096, 65536] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("encode_{}b", size), |b| {
            b.iter(|| {
                let payload = vec![0u8; size];
                let p = Packet::new(MsgType::Data, 1, 2, 7, payload);
                black_box(p.to_bytes())
            })
        });
        group.bench_function(format!("decode_{}b", size), |b| {
            let wire = Packet::new(MsgType::Data, 1, 2, 7, vec![0u8; size]).to_bytes();
            b.iter(|| black_box(Packet::from_bytes(&wire).expect("decode")))
        });
    }
    group.finish();

    let mut group = c.benchmark_group("image_pipeline");
    for size in [1500usize, 65536] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("deflate_split_{}b", size), |b| {
            let image: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            b.iter(|| {
                let compressed = zlib::deflate(&image);
                black_box(chunk::split(&compressed))
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_packet);
criterion_main!(benches);
