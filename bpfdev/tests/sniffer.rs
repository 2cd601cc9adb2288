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

use std::io;
use std::time::Duration;

use bpfdev::{Credentials, Direction, PacketFilter, Sniffer};

use common::*;

#[test]
fn sniffer_captures_only_after_activation() {
    let registry = registry();
    let em = Em::attach(&registry, "em0");

    let mut sniffer = Sniffer::new(&registry, "em0").unwrap();
    // Unit 0 is left for last.
    assert_eq!(sniffer.bpf().unit(), 1);
    sniffer.set_nonblocking(true).unwrap();
    assert!(sniffer.nonblocking());

    let _ = em.tap(&ether_frame(60, 1), Direction::IN);
    let err = sniffer.recv().unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

    sniffer.activate(None).unwrap();
    let _ = em.tap(&ether_frame(60, 2), Direction::IN);
    let _ = em.tap(&ether_frame(70, 3), Direction::OUT);

    let first = sniffer.recv().unwrap();
    assert_eq!(first.captured_len(), 60);
    assert_eq!(first.data()[14], 2);

    let second = sniffer.recv().unwrap();
    assert_eq!(second.captured_len(), 70);
    assert_eq!(second.data()[14], 3);

    assert_eq!(
        sniffer.recv().unwrap_err().kind(),
        io::ErrorKind::WouldBlock
    );
}

#[test]
fn sniffer_applies_filter_and_deactivates() {
    let registry = registry();
    let em = Em::attach(&registry, "em0");

    let mut sniffer = Sniffer::new(&registry, "em0").unwrap();
    sniffer.activate(Some(PacketFilter::snap(20))).unwrap();

    let _ = em.tap(&ether_frame(100, 9), Direction::IN);
    let mut buf = [0u8; 64];
    assert_eq!(sniffer.recv_into(&mut buf).unwrap(), 20);
    assert_eq!(buf[14], 9);

    sniffer.deactivate().unwrap();
    sniffer.bpf().set_read_timeout(Some(Duration::from_millis(20))).unwrap();
    let _ = em.tap(&ether_frame(100, 10), Direction::IN);
    assert_eq!(sniffer.recv().unwrap_err().kind(), io::ErrorKind::TimedOut);
}

#[test]
fn sniffer_sends() {
    let registry = registry();
    let em = Em::attach(&registry, "em0");

    let mut sniffer = Sniffer::new(&registry, "em0").unwrap();
    assert_eq!(sniffer.send(&ether_frame(60, 0)).unwrap(), 60);
    assert_eq!(em.driver.sent.lock().unwrap().len(), 1);
}

#[test]
fn sniffer_setup_errors() {
    let registry = registry();
    let _em = Em::attach(&registry, "em0");

    let err = Sniffer::new(&registry, "em7").err().unwrap();
    assert_eq!(err.raw_os_error(), Some(libc::ENXIO));
    // The unit opened for the failed sniffer was released.
    assert_eq!(registry.open_units(), 0);

    let sniffer = Sniffer::with_credentials(&registry, "em0", Credentials::user(1000)).unwrap();
    assert_eq!(
        sniffer.bpf().set_promiscuous().unwrap_err().errno(),
        libc::EPERM
    );
}
