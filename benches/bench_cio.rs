// S/390-style Channel I/O Command/Completion Engine
// Copyright 2026 cio-rust contributors
// SPDX-License-Identifier: MIT

//! Benchmarks of the dispatch/completion round trip against the
//! simulated channel subsystem.

use cio_rust::sim::SimSubsystem;
use cio_rust::{
    ChannelProgram, ChannelSubsystem, CioConfig, DeviceNumber, PathMask, StartFlags, SubchannelId,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

fn engine(devices: u16) -> ChannelSubsystem<SimSubsystem> {
    let sim = SimSubsystem::new();
    for n in 0..devices {
        let id = SubchannelId(n);
        sim.add_device(id, DeviceNumber(0x1000 + n), PathMask::new(0xC0));
        sim.set_auto_complete(id, true);
    }
    let cio = ChannelSubsystem::new(sim, CioConfig::default());
    for n in 0..devices {
        cio.request(SubchannelId(n), Arc::new(|_| {}))
            .expect("claim simulated subchannel");
    }
    cio
}

/// Asynchronous start followed by an interrupt drain.
fn bench_start_complete(c: &mut Criterion) {
    let mut group = c.benchmark_group("start_complete");
    group.throughput(Throughput::Elements(1));

    let cio = engine(1);
    let id = SubchannelId(0);
    group.bench_function("async_drain", |b| {
        b.iter(|| {
            cio.start(id, ChannelProgram::nop(), 1, None, StartFlags::empty())
                .expect("start accepted");
            while cio.process_pending() {}
        });
    });

    group.bench_function("sync_wait", |b| {
        b.iter(|| {
            cio.start(
                id,
                ChannelProgram::nop(),
                1,
                None,
                StartFlags::WAIT_SYNCHRONOUS,
            )
            .expect("start completed");
        });
    });

    group.finish();
}

/// Interleaved operations across a growing set of subchannels.
fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");

    for count in [4u16, 16, 64] {
        let cio = engine(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter(|| {
                for n in 0..count {
                    cio.start(
                        SubchannelId(n),
                        ChannelProgram::nop(),
                        n as u64,
                        None,
                        StartFlags::empty(),
                    )
                    .expect("start accepted");
                }
                while cio.process_pending() {}
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_start_complete, bench_fan_out);
criterion_main!(benches);
