//! Criterion benchmarks for the wire codecs.
//!
//! Every transfer block is packed and unpacked on the session thread, so
//! these paths bound the sustainable sample rate per device.
//!
//! Run with: cargo bench --bench codec_benchmark

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use daq_driver_smu::device::calibration::{M1000CalEntry, M1000Calibration};
use daq_driver_smu::device::{cee, m1000};

/// CEE OUT packing and IN tick unpacking (12-bit codes).
fn cee_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("cee_codec");
    group.throughput(Throughput::Elements(cee::wire::TICKS_PER_PACKET as u64));

    let codes: Vec<[u16; 2]> = (0..cee::wire::TICKS_PER_PACKET as u16)
        .map(|t| [t * 400, 4095 - t * 400])
        .collect();
    let mut out = vec![0u8; cee::wire::OUT_PACKET_LEN];
    group.bench_function("encode_out_packet", |b| {
        b.iter(|| cee::wire::encode_out_packet(black_box([1, 2]), black_box(&codes), &mut out))
    });

    let ticks: Vec<[i16; 4]> = (0..cee::wire::TICKS_PER_PACKET as i16)
        .map(|t| [t * 100, -t * 100, 2047 - t, -2048 + t])
        .collect();
    let mut packet = vec![0u8; cee::wire::IN_PACKET_LEN];
    cee::wire::encode_in_packet([1, 2], 0, &ticks, &mut packet);
    group.bench_function("decode_in_packet", |b| {
        b.iter(|| {
            let mut sum = 0i32;
            for tick in packet[4..].chunks_exact(6) {
                let [av, ai, bv, bi] = cee::wire::decode_tick(black_box(tick));
                sum += i32::from(av) + i32::from(ai) + i32::from(bv) + i32::from(bi);
            }
            sum
        })
    });

    group.finish();
}

/// M1000 region codes with calibration applied, per packet size.
fn m1000_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("m1000_codec");
    let mut cal = M1000Calibration::identity();
    cal.offset[0] = 0.01;
    cal.gain_p[0] = 1.002;
    let cal = cal.into_valid();

    for packets in [1usize, 4, 16] {
        let ticks = packets * m1000::wire::TICKS_PER_PACKET;
        group.throughput(Throughput::Elements(ticks as u64));

        let mut block = vec![0u8; packets * m1000::wire::IN_PACKET_LEN];
        for (p, packet) in block.chunks_exact_mut(m1000::wire::IN_PACKET_LEN).enumerate() {
            for t in 0..m1000::wire::TICKS_PER_PACKET {
                let code = ((p * 7919 + t * 131) % 65536) as u16;
                for region in 0..4 {
                    m1000::wire::write_code(packet, region, t, code);
                }
            }
        }

        group.bench_with_input(BenchmarkId::new("decode_block", packets), &block, |b, block| {
            b.iter(|| {
                let mut sum = 0.0f64;
                for packet in block.chunks_exact(m1000::wire::IN_PACKET_LEN) {
                    for t in 0..m1000::wire::TICKS_PER_PACKET {
                        let raw = m1000::wire::code_voltage(m1000::wire::read_code(packet, 0, t));
                        sum += cal.measure(0, M1000CalEntry::MeasureVoltage, raw);
                        let raw = m1000::wire::code_current(m1000::wire::read_code(packet, 1, t));
                        sum += cal.measure(0, M1000CalEntry::MeasureCurrent, raw);
                    }
                }
                black_box(sum)
            })
        });

        let mut out = vec![0u8; packets * m1000::wire::OUT_PACKET_LEN];
        group.bench_with_input(BenchmarkId::new("encode_block", packets), &packets, |b, _| {
            b.iter(|| {
                for packet in out.chunks_exact_mut(m1000::wire::OUT_PACKET_LEN) {
                    for t in 0..m1000::wire::TICKS_PER_PACKET {
                        let target = cal.source(0, M1000CalEntry::SourceVoltage, t as f64 / 64.0);
                        m1000::wire::write_code(packet, 0, t, m1000::wire::voltage_code(target));
                        m1000::wire::write_code(packet, 1, t, m1000::wire::current_code(0.0));
                    }
                }
            })
        });
    }

    group.finish();
}

criterion_group!(benches, cee_codec, m1000_codec);
criterion_main!(benches);
