use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use weave_protocol::queue::SegmentQueue;
use weave_protocol::segment::{ProtocolKind, Role, Segment};
use weave_protocol::session::Session;
use weave_protocol::signal::Signal;
use weave_protocol::underlay::{IpVersion, TransportProtocol, Underlay};

fn segment(seq: u32) -> Segment {
    Segment::new_data(
        ProtocolKind::DataClientToServer,
        1,
        seq,
        0,
        4096,
        0,
        Bytes::from(vec![0u8; 1400]), // Typical fragment size
    )
}

fn bench_insert_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");
    group.throughput(Throughput::Elements(1024));

    group.bench_function("insert_drain_1024", |b| {
        b.iter(|| {
            let queue = SegmentQueue::new(4096);
            for seq in 0..1024u32 {
                queue.insert_blocking(black_box(segment(seq)));
            }
            while let Some(seg) = queue.delete_min() {
                black_box(seg);
            }
        });
    });

    group.finish();
}

fn bench_reverse_order_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");
    group.throughput(Throughput::Elements(1024));

    group.bench_function("reverse_insert_1024", |b| {
        b.iter(|| {
            let queue = SegmentQueue::new(4096);
            for seq in (0..1024u32).rev() {
                queue.insert_blocking(black_box(segment(seq)));
            }
            while let Some(seg) = queue.delete_min() {
                black_box(seg);
            }
        });
    });

    group.finish();
}

fn bench_delete_min_if(c: &mut Criterion) {
    c.bench_function("queue_delete_min_if_purge", |b| {
        b.iter(|| {
            let queue = SegmentQueue::new(4096);
            for seq in 0..512u32 {
                queue.insert_blocking(segment(seq));
            }
            while queue
                .delete_min_if(|seg| black_box(seg.seq()) < 256)
                .is_some()
            {}
            black_box(queue.len());
        });
    });
}

/// Discards every segment; the output loop drains the send queue while the
/// benchmark measures the fragmenting write path.
struct SinkUnderlay;

impl Underlay for SinkUnderlay {
    fn ip_version(&self) -> IpVersion {
        IpVersion::V4
    }

    fn transport_protocol(&self) -> TransportProtocol {
        TransportProtocol::ReliableStream
    }

    fn local_addr(&self) -> SocketAddr {
        "127.0.0.1:9001".parse().unwrap()
    }

    fn remote_addr(&self) -> SocketAddr {
        "127.0.0.1:9002".parse().unwrap()
    }

    fn write_segment(&self, _segment: &Segment) -> io::Result<()> {
        Ok(())
    }
}

fn bench_write_fragmentation(c: &mut Criterion) {
    // 1458 - 58 bytes of headers leaves 1400-byte fragments.
    let session = Arc::new(Session::new(1, Role::Client, 1458));
    session.attach(Arc::new(SinkUnderlay));
    let cancel = Signal::new();
    let loops = Arc::clone(&session).spawn_loops(&cancel).unwrap();

    let payload = vec![0u8; 40000];
    let mut group = c.benchmark_group("session");
    group.throughput(Throughput::Bytes(40000));

    group.bench_function("write_40k_fragmented", |b| {
        b.iter(|| {
            black_box(session.write(black_box(&payload)).unwrap());
        });
    });

    group.finish();

    cancel.set();
    let (input, output) = loops.join();
    input.unwrap();
    output.unwrap();
}

criterion_group!(
    benches,
    bench_insert_drain,
    bench_reverse_order_insert,
    bench_delete_min_if,
    bench_write_fragmentation
);
criterion_main!(benches);
