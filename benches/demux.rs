use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use camlink::codec::FrameCodec;
use camlink::network::StreamDemuxer;

const PACKETS: usize = 100;
const MAX_PAYLOAD: u32 = 1024 * 1024;

fn wire() -> Vec<u8> {
    let video = vec![0xabu8; 20 * 1024];
    let audio = vec![0x01u8; 2 * 1024];
    let mut wire = Vec::with_capacity(PACKETS * (8 + video.len() + audio.len()));
    for _ in 0..PACKETS {
        wire.extend_from_slice(&FrameCodec::encode(&video, &audio));
    }
    wire
}

fn bench_stream_demuxer(c: &mut Criterion) {
    let wire = wire();
    let mut group = c.benchmark_group("stream_demuxer_push");
    group.throughput(Throughput::Bytes(wire.len() as u64));

    for chunk_size in [512usize, 4096, 65536] {
        group.bench_with_input(
            BenchmarkId::from_parameter(chunk_size),
            &chunk_size,
            |b, &chunk_size| {
                b.iter(|| {
                    let mut demuxer = StreamDemuxer::new(MAX_PAYLOAD);
                    let mut units = 0usize;
                    for chunk in wire.chunks(chunk_size) {
                        units += demuxer
                            .push(black_box(chunk), |packet| {
                                black_box(packet.video.len() + packet.audio.len());
                            })
                            .unwrap();
                    }
                    assert_eq!(units, PACKETS);
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_stream_demuxer);
criterion_main!(benches);
