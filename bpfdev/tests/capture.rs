// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Wake, Waker};
use std::thread;
use std::time::{Duration, Instant};

use bpfdev::filter::insn::*;
use bpfdev::{
    BpfError, CaptureRecords, Credentials, Direction, FilterDrop, LinkType, PacketFilter,
    PollEvents, Verdict,
};

use common::*;

#[test]
fn loopback_round_trip() {
    let registry = registry();
    let lo0 = Lo0::attach(&registry);
    assert!(!lo0.cookie.is_active());

    let bpf = registry.open(0, Credentials::root()).unwrap();
    bpf.set_interface("lo0").unwrap();
    bpf.set_immediate(true).unwrap();
    assert!(lo0.cookie.is_active());
    assert_eq!(bpf.link_type().unwrap(), LinkType::LOOP);
    assert_eq!(bpf.interface().unwrap(), "lo0");

    let payload = [0x45u8; 60];
    assert_eq!(lo0.input(AF_INET, &payload), Some(Verdict::Pass));

    let mut buf = vec![0; bpf.buffer_len().unwrap() as usize];
    let len = bpf.read(&mut buf).unwrap();
    assert_eq!(len, 20 + 64);

    let records: Vec<_> = CaptureRecords::new(&buf[..len]).collect();
    assert_eq!(records.len(), 1);
    let record = records[0];
    assert_eq!(record.header().hdrlen, 20);
    assert_eq!(record.captured_len(), 64);
    assert_eq!(record.original_len(), 64);
    assert!(!record.truncated());
    assert!(!record.timestamp().is_zero());
    assert_eq!(&record.data()[..4], &AF_INET.to_be_bytes());
    assert_eq!(&record.data()[4..], &payload[..]);

    let stats = bpf.stats().unwrap();
    assert_eq!(stats.received(), 1);
    assert_eq!(stats.captured(), 1);
    assert_eq!(stats.dropped(), 0);

    bpf.close().unwrap();
    assert!(!lo0.cookie.is_active());
}

#[test]
fn buffers_rotate_then_drop() {
    let registry = registry();
    let em = Em::attach(&registry, "em0");

    let bpf = registry.open(1, Credentials::root()).unwrap();
    assert_eq!(bpf.set_buffer_len(256).unwrap(), 256);
    bpf.set_interface("em0").unwrap();

    // 18 byte capture header + 46 byte frame = 64 bytes, so four records fill a buffer.
    for i in 0..20u8 {
        assert_eq!(em.tap(&ether_frame(46, i), Direction::IN), Some(Verdict::Pass));
    }

    let stats = bpf.stats().unwrap();
    assert_eq!(stats.received(), 20);
    assert_eq!(stats.captured(), 8);
    assert_eq!(stats.dropped(), 12);
    // A full hold buffer plus a full store buffer.
    assert_eq!(bpf.readable_bytes().unwrap(), 512);

    let mut buf = vec![0; 256];
    assert_eq!(bpf.read(&mut buf).unwrap(), 256);
    let fills: Vec<u8> = CaptureRecords::new(&buf).map(|r| r.data()[20]).collect();
    assert_eq!(fills, vec![0, 1, 2, 3]);

    bpf.set_nonblocking(true).unwrap();
    assert_eq!(bpf.read(&mut buf).unwrap(), 256);
    let fills: Vec<u8> = CaptureRecords::new(&buf).map(|r| r.data()[20]).collect();
    assert_eq!(fills, vec![4, 5, 6, 7]);

    assert!(matches!(bpf.read(&mut buf), Err(BpfError::WouldBlock)));
}

#[test]
fn read_requires_exact_buffer_length() {
    let registry = registry();
    let _em = Em::attach(&registry, "em0");
    let bpf = registry.open(1, Credentials::root()).unwrap();
    bpf.set_interface("em0").unwrap();

    let len = bpf.buffer_len().unwrap() as usize;
    let mut buf = vec![0; len + 1];
    let err = bpf.read(&mut buf).unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);
    let err = bpf.read(&mut buf[..len - 1]).unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);
}

#[test]
fn filter_replacement_leaves_no_residue() {
    let registry = registry();
    let em = Em::attach(&registry, "em0");
    let bpf = registry.open(1, Credentials::root()).unwrap();
    bpf.set_interface("em0").unwrap();

    for _ in 0..3 {
        let _ = em.tap(&ether_frame(60, 0), Direction::IN);
    }
    assert_eq!(bpf.stats().unwrap().captured(), 3);

    bpf.set_filter(Some(&PacketFilter::reject_all())).unwrap();
    assert_eq!(bpf.stats().unwrap().captured(), 0);
    assert_eq!(bpf.stats().unwrap().received(), 0);

    bpf.set_immediate(true).unwrap();
    bpf.set_nonblocking(true).unwrap();
    assert_eq!(bpf.readable_bytes().unwrap(), 0);

    let _ = em.tap(&ether_frame(60, 0), Direction::IN);
    let stats = bpf.stats().unwrap();
    assert_eq!(stats.received(), 1);
    assert_eq!(stats.captured(), 0);

    let mut buf = vec![0; bpf.buffer_len().unwrap() as usize];
    assert!(matches!(bpf.read(&mut buf), Err(BpfError::WouldBlock)));
}

#[test]
fn filter_selects_and_truncates() {
    let registry = registry();
    let em = Em::attach(&registry, "em0");
    let bpf = registry.open(1, Credentials::root()).unwrap();
    bpf.set_interface("em0").unwrap();
    bpf.set_immediate(true).unwrap();

    // ldh [12]; jeq #0x0800, 0, 1; ret #20; ret #0
    let ipv4_only = PacketFilter::from_insns(vec![
        stmt(BPF_LD | BPF_H | BPF_ABS, 12),
        jump(BPF_JMP | BPF_JEQ | BPF_K, 0x0800, 0, 1),
        stmt(BPF_RET | BPF_K, 20),
        stmt(BPF_RET | BPF_K, 0),
    ]);
    bpf.set_filter(Some(&ipv4_only)).unwrap();

    let mut arp = ether_frame(60, 1);
    arp[12..14].copy_from_slice(&[0x08, 0x06]);
    let _ = em.tap(&arp, Direction::IN);
    let _ = em.tap(&ether_frame(60, 2), Direction::IN);

    let mut buf = vec![0; bpf.buffer_len().unwrap() as usize];
    let len = bpf.read(&mut buf).unwrap();
    let records: Vec<_> = CaptureRecords::new(&buf[..len]).collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].captured_len(), 20);
    assert_eq!(records[0].original_len(), 60);
    assert!(records[0].truncated());
    assert_eq!(records[0].data()[19], 2);
}

#[test]
fn invalid_filter_is_rejected_without_side_effects() {
    let registry = registry();
    let em = Em::attach(&registry, "em0");
    let bpf = registry.open(1, Credentials::root()).unwrap();
    bpf.set_interface("em0").unwrap();
    let _ = em.tap(&ether_frame(60, 0), Direction::IN);

    let no_ret = PacketFilter::from_insns(vec![stmt(BPF_LD | BPF_W | BPF_LEN, 0)]);
    let err = bpf.set_filter(Some(&no_ret)).unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);
    assert_eq!(bpf.stats().unwrap().captured(), 1);
}

#[test]
fn direction_filter_skips_packets() {
    let registry = registry();
    let em = Em::attach(&registry, "em0");
    let bpf = registry.open(1, Credentials::root()).unwrap();
    bpf.set_interface("em0").unwrap();
    bpf.set_direction_filter(Direction::OUT).unwrap();
    assert_eq!(bpf.direction_filter().unwrap(), Direction::OUT);

    let _ = em.tap(&ether_frame(60, 0), Direction::OUT);
    let _ = em.tap(&ether_frame(60, 0), Direction::IN);

    let stats = bpf.stats().unwrap();
    assert_eq!(stats.received(), 2);
    assert_eq!(stats.captured(), 1);
}

#[test]
fn filter_drop_modes() {
    let registry = registry();
    let em = Em::attach(&registry, "em0");
    let dropper = registry.open(1, Credentials::root()).unwrap();
    let watcher = registry.open(2, Credentials::root()).unwrap();
    dropper.set_interface("em0").unwrap();
    watcher.set_interface("em0").unwrap();

    let frame = ether_frame(60, 0);

    dropper.set_filter_drop(FilterDrop::Capture).unwrap();
    assert_eq!(em.tap(&frame, Direction::IN), Some(Verdict::Drop));
    assert_eq!(dropper.stats().unwrap().captured(), 1);

    dropper.set_filter_drop(FilterDrop::Drop).unwrap();
    assert_eq!(em.tap(&frame, Direction::IN), Some(Verdict::Drop));
    assert_eq!(dropper.stats().unwrap().captured(), 1);
    assert_eq!(watcher.stats().unwrap().captured(), 2);

    // Packets the filter rejects are never dropped.
    dropper.set_filter(Some(&PacketFilter::reject_all())).unwrap();
    assert_eq!(em.tap(&frame, Direction::IN), Some(Verdict::Pass));
    assert_eq!(dropper.filter_drop().unwrap(), FilterDrop::Drop);
}

#[test]
fn read_timeout_returns_partial_buffer() {
    let registry = registry();
    let em = Em::attach(&registry, "em0");
    let bpf = registry.open(1, Credentials::root()).unwrap();
    bpf.set_interface("em0").unwrap();
    bpf.set_read_timeout(Some(Duration::from_millis(50))).unwrap();

    let mut buf = vec![0; bpf.buffer_len().unwrap() as usize];
    let start = Instant::now();
    assert_eq!(bpf.read(&mut buf).unwrap(), 0);
    assert!(start.elapsed() >= Duration::from_millis(50));

    let _ = em.tap(&ether_frame(46, 9), Direction::IN);
    assert_eq!(bpf.read(&mut buf).unwrap(), 64);
}

#[test]
fn blocked_reader_wakes_on_rotation() {
    let registry = registry();
    let em = Em::attach(&registry, "em0");
    let bpf = registry.open(1, Credentials::root()).unwrap();
    bpf.set_buffer_len(256).unwrap();
    bpf.set_interface("em0").unwrap();

    thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut buf = vec![0; 256];
            bpf.read(&mut buf)
        });

        thread::sleep(Duration::from_millis(20));
        for i in 0..5 {
            let _ = em.tap(&ether_frame(46, i), Direction::IN);
        }

        assert_eq!(reader.join().unwrap().unwrap(), 256);
    });
}

#[test]
fn interrupt_fails_blocked_read() {
    let registry = registry();
    let _em = Em::attach(&registry, "em0");
    let bpf = registry.open(1, Credentials::root()).unwrap();
    bpf.set_interface("em0").unwrap();

    thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut buf = vec![0; bpf.buffer_len().unwrap() as usize];
            bpf.read(&mut buf)
        });

        while !reader.is_finished() {
            bpf.interrupt();
            thread::sleep(Duration::from_millis(5));
        }

        let err = reader.join().unwrap().unwrap_err();
        assert_eq!(err.errno(), libc::EINTR);
    });
}

#[test]
fn interface_teardown_fails_readers() {
    let registry = registry();
    let em = Em::attach(&registry, "em0");
    let bpf = registry.open(1, Credentials::root()).unwrap();
    bpf.set_interface("em0").unwrap();

    thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut buf = vec![0; bpf.buffer_len().unwrap() as usize];
            bpf.read(&mut buf)
        });

        thread::sleep(Duration::from_millis(20));
        registry.detach_interface(&em.ifp);

        let err = reader.join().unwrap().unwrap_err();
        assert_eq!(err.errno(), libc::EIO);
    });

    assert!(!em.cookie.is_active());
    assert_eq!(em.tap(&ether_frame(60, 0), Direction::IN), None);
    assert_eq!(bpf.state(), bpfdev::DescriptorState::Open);
    registry.detach_interface(&em.ifp);

    // The descriptor survives and can be bound elsewhere, with a new buffer size.
    assert_eq!(bpf.set_interface("em0").unwrap_err().errno(), libc::ENXIO);
    assert_eq!(bpf.set_buffer_len(1024).unwrap(), 1024);
    let em1 = Em::attach(&registry, "em1");
    bpf.set_interface("em1").unwrap();
    bpf.set_immediate(true).unwrap();
    let _ = em1.tap(&ether_frame(60, 0), Direction::IN);

    let mut buf = vec![0; 1024];
    assert_eq!(bpf.read(&mut buf).unwrap(), 18 + 60);
}

#[test]
fn packets_captured_before_teardown_remain_readable() {
    let registry = registry();
    let em = Em::attach(&registry, "em0");
    let bpf = registry.open(1, Credentials::root()).unwrap();
    bpf.set_interface("em0").unwrap();

    for i in 0..3u8 {
        let _ = em.tap(&ether_frame(60, i), Direction::IN);
    }
    assert_eq!(bpf.stats().unwrap().captured(), 3);

    registry.detach_interface(&em.ifp);
    assert_eq!(bpf.readable_bytes().unwrap(), 3 * 80 - 2);

    let mut buf = vec![0; bpf.buffer_len().unwrap() as usize];
    let len = bpf.read(&mut buf).unwrap();
    let fills: Vec<u8> = CaptureRecords::new(&buf[..len])
        .map(|r| r.data()[14])
        .collect();
    assert_eq!(fills, vec![0, 1, 2]);

    assert_eq!(bpf.read(&mut buf).unwrap_err().errno(), libc::EIO);
}

#[test]
fn bytes_readable_matches_next_read() {
    let registry = registry();
    let em = Em::attach(&registry, "em0");
    let bpf = registry.open(1, Credentials::root()).unwrap();
    bpf.set_interface("em0").unwrap();
    bpf.set_nonblocking(true).unwrap();

    let _ = em.tap(&ether_frame(60, 0), Direction::IN);
    let readable = bpf.readable_bytes().unwrap();
    assert_eq!(readable, 18 + 60);

    let mut buf = vec![0; bpf.buffer_len().unwrap() as usize];
    assert_eq!(bpf.read(&mut buf).unwrap(), readable);
    assert_eq!(bpf.readable_bytes().unwrap(), 0);
}

#[test]
fn close_wakes_readers() {
    let registry = registry();
    let _em = Em::attach(&registry, "em0");
    let bpf = registry.open(1, Credentials::root()).unwrap();
    bpf.set_interface("em0").unwrap();

    let len = bpf.buffer_len().unwrap() as usize;
    thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut buf = vec![0; len];
            bpf.read(&mut buf)
        });

        thread::sleep(Duration::from_millis(20));
        bpf.close().unwrap();

        let err = reader.join().unwrap().unwrap_err();
        assert_eq!(err.errno(), libc::EIO);
    });
}

struct CountingWaker(AtomicUsize);

impl Wake for CountingWaker {
    fn wake(self: Arc<Self>) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn poll_and_wakers() {
    let registry = registry();
    let em = Em::attach(&registry, "em0");
    let bpf = registry.open(1, Credentials::root()).unwrap();
    bpf.set_interface("em0").unwrap();
    bpf.set_immediate(true).unwrap();

    assert_eq!(bpf.poll(PollEvents::READABLE), PollEvents::empty());
    assert_eq!(bpf.poll(PollEvents::OUT), PollEvents::OUT);

    let counter = Arc::new(CountingWaker(AtomicUsize::new(0)));
    bpf.register_waker(&Waker::from(counter.clone()));
    let _ = em.tap(&ether_frame(60, 0), Direction::IN);
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    assert_eq!(bpf.poll(PollEvents::IN), PollEvents::IN);

    registry.detach_interface(&em.ifp);
    assert!(bpf.poll(PollEvents::IN).contains(PollEvents::HUP));
}

#[test]
fn segmented_packets_are_captured_whole() {
    let registry = registry();
    let lo0 = Lo0::attach(&registry);
    let bpf = registry.open(1, Credentials::root()).unwrap();
    bpf.set_interface("lo0").unwrap();
    bpf.set_immediate(true).unwrap();

    // ld [0]; jeq #AF_INET, 0, 1; ret #8; ret #0
    let filter = PacketFilter::from_insns(vec![
        stmt(BPF_LD | BPF_W | BPF_ABS, 0),
        jump(BPF_JMP | BPF_JEQ | BPF_K, AF_INET, 0, 1),
        stmt(BPF_RET | BPF_K, 8),
        stmt(BPF_RET | BPF_K, 0),
    ]);
    bpf.set_filter(Some(&filter)).unwrap();

    let _ = lo0.input(24, &[1, 2, 3, 4, 5, 6]);
    let _ = lo0.input(AF_INET, &[1, 2, 3, 4, 5, 6]);

    let mut buf = vec![0; bpf.buffer_len().unwrap() as usize];
    let len = bpf.read(&mut buf).unwrap();
    let records: Vec<_> = CaptureRecords::new(&buf[..len]).collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].data(), &[0, 0, 0, 2, 1, 2, 3, 4]);
    assert_eq!(records[0].original_len(), 10);
}
