use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::io::Cursor;
use std::time::Duration;
use trace_core::decode::{DecodeContext, LINKTYPE_ETHERNET, TCP_ACK, TCP_PSH, TCP_SYN};
use trace_core::{ConnectionTracker, SavefileReader, TrackerConfig};

const MSS: u32 = 1460;

// 构造以太网 + IPv4 + TCP 帧
fn frame(conn: u16, from_client: bool, seq: u32, ack: u32, flags: u8, payload: usize) -> Vec<u8> {
    let client = [10, 0, (conn >> 8) as u8, conn as u8];
    let server = [10, 255, 0, 1];
    let client_port = 20000 + conn;
    let (src_ip, dst_ip, src_port, dst_port) = if from_client {
        (client, server, client_port, 80u16)
    } else {
        (server, client, 80u16, client_port)
    };
    let mut data = Vec::with_capacity(54 + payload);

    // 以太网头部 (14字节)
    data.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    data.extend_from_slice(&[0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb]);
    data.extend_from_slice(&0x0800u16.to_be_bytes());

    // IPv4头部 (20字节)
    data.extend_from_slice(&[0x45, 0x00]);
    data.extend_from_slice(&((40 + payload) as u16).to_be_bytes());
    data.extend_from_slice(&[0x00, 0x01, 0x40, 0x00, 64, 6, 0x00, 0x00]);
    data.extend_from_slice(&src_ip);
    data.extend_from_slice(&dst_ip);

    // TCP头部 (20字节)
    data.extend_from_slice(&src_port.to_be_bytes());
    data.extend_from_slice(&dst_port.to_be_bytes());
    data.extend_from_slice(&seq.to_be_bytes());
    data.extend_from_slice(&ack.to_be_bytes());
    data.extend_from_slice(&[0x50, flags]);
    data.extend_from_slice(&[0xff, 0xff, 0x00, 0x00, 0x00, 0x00]);

    data.resize(data.len() + payload, 0x5a);
    data
}

/// 生成内存中的抓包文件: `conns` 条连接交错发送, 每条 `segments` 个数据段,
/// 每 `rexmit_every` 段重传一次
fn build_capture(conns: u16, segments: u32, rexmit_every: u32) -> Vec<u8> {
    let mut frames: Vec<(u64, Vec<u8>)> = Vec::new();
    let mut now = 1_000_000u64;
    for c in 0..conns {
        frames.push((now, frame(c, true, 999, 0, TCP_SYN, 0)));
        frames.push((now + 100, frame(c, false, 4999, 1000, TCP_SYN | TCP_ACK, 0)));
        now += 200;
    }
    for i in 0..segments {
        for c in 0..conns {
            let seq = 1000 + i * MSS;
            frames.push((now, frame(c, true, seq, 5000, TCP_ACK | TCP_PSH, MSS as usize)));
            if rexmit_every > 0 && i % rexmit_every == rexmit_every - 1 {
                frames.push((now + 50, frame(c, true, seq, 5000, TCP_ACK | TCP_PSH, MSS as usize)));
            }
            frames.push((now + 300, frame(c, false, 5000, seq + MSS, TCP_ACK, 0)));
            now += 10;
        }
    }

    let mut out = Vec::new();
    out.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&4u16.to_le_bytes());
    for field in [0u32, 0, 65535, LINKTYPE_ETHERNET] {
        out.extend_from_slice(&field.to_le_bytes());
    }
    for (micros, data) in frames {
        let header = [
            (micros / 1_000_000) as u32,
            (micros % 1_000_000) as u32,
            data.len() as u32,
            data.len() as u32,
        ];
        for field in header {
            out.extend_from_slice(&field.to_le_bytes());
        }
        out.extend_from_slice(&data);
    }
    out
}

fn replay(capture: &[u8], config: &TrackerConfig) -> usize {
    let reader = match SavefileReader::new(Cursor::new(capture)) {
        Ok(reader) => reader,
        Err(_) => return 0,
    };
    let mut ctx = DecodeContext::new(reader.linktype());
    let mut tracker = ConnectionTracker::new(config.clone()).unwrap();
    for record in reader.flatten() {
        if let Some(packet) = ctx.decode(record.timestamp, &record.data) {
            let _ = tracker.process(&packet);
        }
    }
    tracker.finish().len()
}

fn replay_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("replay");
    group.measurement_time(Duration::from_secs(3));

    for &(conns, rexmit_every) in &[(16u16, 0u32), (16, 8), (256, 8)] {
        let capture = build_capture(conns, 64, rexmit_every);
        group.throughput(Throughput::Bytes(capture.len() as u64));
        let id = format!("{}conns_rexmit{}", conns, rexmit_every);

        group.bench_with_input(BenchmarkId::new("batch", &id), &capture, |b, capture| {
            let config = TrackerConfig::default();
            b.iter(|| black_box(replay(capture, &config)));
        });
        group.bench_with_input(BenchmarkId::new("continuous", &id), &capture, |b, capture| {
            let config = TrackerConfig::continuous();
            b.iter(|| black_box(replay(capture, &config)));
        });
    }
    group.finish();
}

criterion_group!(benches, replay_benchmark);
criterion_main!(benches);
