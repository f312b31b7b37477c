// S/390-style Channel I/O Command/Completion Engine
// Copyright 2026 cio-rust contributors
// SPDX-License-Identifier: MIT

//! Basic walkthrough of the channel I/O engine against the simulated
//! channel subsystem.
//!
//! Run with: `cargo run --example basic`

use cio_rust::sim::SimSubsystem;
use cio_rust::{
    ChannelProgram, ChannelSubsystem, CioConfig, CompletionEvent, DeviceNumber, PathMask,
    StartFlags, SubchannelId,
};
use std::sync::Arc;

fn main() {
    println!("Channel I/O Engine Basic Example");
    println!("================================\n");

    // A simulated channel subsystem with two devices: one two-path disk
    // and one single-path console.
    let sim = SimSubsystem::new();
    let disk = SubchannelId(0x10);
    let console = SubchannelId(0x11);
    sim.add_device(disk, DeviceNumber(0x1000), PathMask::new(0xC0));
    sim.add_device(console, DeviceNumber(0x1F00), PathMask::new(0x80));
    sim.set_auto_complete(disk, true);
    sim.set_auto_complete(console, true);

    let cio = ChannelSubsystem::new(sim, CioConfig::default());

    // Probe the subchannels.
    println!("Validating subchannels...");
    for id in [disk, console] {
        match cio.validate(id) {
            Ok(info) => println!(
                "  {} -> device {}, paths {}",
                id, info.devno, info.opm
            ),
            Err(err) => println!("  {} -> {}", id, err),
        }
    }
    println!();

    // Claim ownership of the disk subchannel.
    let on_completion = Arc::new(|event: &CompletionEvent| {
        println!(
            "  completion: subchannel {}, intent {}, kind {:?}, final {}",
            event.id, event.intent, event.kind, event.status.final_status
        );
    });
    if let Err(err) = cio.request(disk, on_completion) {
        println!("Failed to claim subchannel: {err}");
        return;
    }

    // Establish the path group across both disk paths.
    println!("Verifying paths...");
    match cio.verify_paths(disk, None) {
        Ok(()) => {
            let info = cio.lookup(disk).expect("validated above");
            match info.path_group {
                Some(pgid) => println!("  path group established: {pgid}"),
                None => println!("  path grouping not supported"),
            }
        }
        Err(err) => println!("  path verification failed: {err}"),
    }
    println!();

    // Start an asynchronous channel program and drain its completion.
    println!("Starting channel program (asynchronous)...");
    match cio.start(disk, ChannelProgram::nop(), 1, None, StartFlags::empty()) {
        Ok(()) => {
            while cio.process_pending() {}
        }
        Err(err) => println!("  start failed: {err}"),
    }
    println!();

    // The same, but blocking inline until the completion is observed.
    println!("Starting channel program (synchronous)...");
    match cio.start(
        disk,
        ChannelProgram::nop(),
        2,
        None,
        StartFlags::WAIT_SYNCHRONOUS,
    ) {
        Ok(()) => println!("  completed inline"),
        Err(err) => println!("  start failed: {err}"),
    }
    println!();

    // Restrict an operation to the second path only.
    println!("Starting on path 1 only...");
    match cio.start(
        disk,
        ChannelProgram::nop(),
        3,
        Some(PathMask::single(1)),
        StartFlags::empty(),
    ) {
        Ok(()) => {
            while cio.process_pending() {}
        }
        Err(err) => println!("  start failed: {err}"),
    }

    println!("\nDone.");
}
