// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Berkeley Packet Filter capture devices.
//!
//! This crate implements the packet capture subsystem behind `/dev/bpfN`: network drivers
//! register their interfaces with a [`CaptureRegistry`] and offer every packet they send or
//! receive to the interface's [`Tap`](interface::Tap); consumers open capture descriptors
//! ([`Bpf`]), attach them to an interface, install a classic BPF filter program and read back
//! buffers of [`CaptureRecord`]s. Descriptors can also inject packets through the interface's
//! driver.
//!
//! ```ignore
//! let registry = CaptureRegistry::new(BpfConfig::default());
//! let lo0 = Arc::new(NetInterface::new("lo0", driver));
//! let cookie = registry.attach_interface(&lo0, LinkType::LOOP, 4);
//!
//! let bpf = registry.open(0, Credentials::root())?;
//! bpf.set_interface("lo0")?;
//! bpf.set_immediate(true)?;
//!
//! let mut buf = vec![0; bpf.buffer_len()? as usize];
//! let len = bpf.read(&mut buf)?;
//! for record in CaptureRecords::new(&buf[..len]) {
//!     println!("{} bytes", record.original_len());
//! }
//! ```

// Show required OS/features on docs.rs.
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod buffer;
pub mod config;
mod descriptor;
pub mod device;
pub mod dlt;
pub mod error;
pub mod filter;
pub mod interface;
pub mod notify;
pub mod packet;
pub mod registry;
mod sniffer;
#[cfg(feature = "tokio")]
pub mod tokio;
mod write;

pub use buffer::{CaptureHeader, CaptureRecord, CaptureRecords, Timestamp};
pub use config::{BpfConfig, Sysctl};
pub use descriptor::{DescriptorState, FilterDrop};
pub use device::{Bpf, BpfVersion, Ioctl, IoctlReply};
pub use dlt::LinkType;
pub use error::{BpfError, Result};
pub use filter::{FilterDirection, PacketFilter, PacketStatistics};
pub use interface::{Direction, LinkDriver, NetInterface, OutboundPacket, TapCookie, Verdict};
pub use notify::{Credentials, PollEvents, SigTarget, SignalSink};
pub use packet::{ContiguousPacket, PacketView, SegmentedPacket};
pub use registry::CaptureRegistry;
pub use sniffer::Sniffer;
