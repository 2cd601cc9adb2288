// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The capture registry: unit allocation, interface taps and shared configuration.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::{BpfConfig, Sysctl};
use crate::descriptor::Descriptor;
use crate::device::Bpf;
use crate::dlt::LinkType;
use crate::error::{BpfError, Result};
use crate::interface::{NetInterface, Tap, TapCookie};
use crate::notify::{Credentials, NoSignals, SignalSink};

enum UnitSlot {
    Free,
    Open(Arc<Descriptor>),
}

/// Owns every capture unit and every interface tap of one capture subsystem instance.
///
/// Drivers register their interfaces with [`attach_interface()`](Self::attach_interface);
/// consumers open descriptors with [`open()`](Self::open) and bind them to an interface by name.
pub struct CaptureRegistry {
    config: RwLock<BpfConfig>,
    units: Mutex<Vec<UnitSlot>>,
    taps: RwLock<Vec<Arc<Tap>>>,
    signals: Arc<dyn SignalSink>,
}

impl CaptureRegistry {
    /// Creates a registry whose descriptors never deliver signals.
    #[inline]
    pub fn new(config: BpfConfig) -> Arc<Self> {
        Self::with_signal_sink(config, Arc::new(NoSignals))
    }

    /// Creates a registry that delivers async I/O signals through `signals`.
    pub fn with_signal_sink(config: BpfConfig, signals: Arc<dyn SignalSink>) -> Arc<Self> {
        let units = (0..config.max_units()).map(|_| UnitSlot::Free).collect();
        Arc::new(Self {
            config: RwLock::new(config),
            units: Mutex::new(units),
            taps: RwLock::new(Vec::new()),
            signals,
        })
    }

    /// A snapshot of the current configuration.
    #[inline]
    pub fn config(&self) -> BpfConfig {
        self.config.read().clone()
    }

    #[inline]
    pub fn sysctl(&self, name: Sysctl) -> u32 {
        self.config.read().get(name)
    }

    /// Updates a runtime setting. Descriptors already open keep their buffer size.
    pub fn set_sysctl(&self, name: Sysctl, value: u32) -> Result<()> {
        self.config.write().set(name, value)?;
        log::debug!("bpf: {:?} set to {}", name, value);
        Ok(())
    }

    // Interfaces

    /// Registers a tap for `ifp` presenting packets with link type `dlt`, whose link-layer header
    /// is `link_hdrlen` bytes long.
    ///
    /// The driver must offer packets to the returned cookie's tap whenever it is active.
    pub fn attach_interface(
        &self,
        ifp: &Arc<NetInterface>,
        dlt: LinkType,
        link_hdrlen: usize,
    ) -> Arc<TapCookie> {
        let tap = Tap::new(ifp.clone(), dlt, link_hdrlen);
        let cookie = tap.cookie().clone();
        self.taps.write().push(tap);

        log::info!("bpf: attached {} ({:?})", ifp.name(), dlt);
        cookie
    }

    /// Removes every tap of `ifp`, forcibly detaching their descriptors.
    ///
    /// Blocked readers of those descriptors fail with `EIO`; the descriptors themselves stay open
    /// and may be bound to another interface. Detaching an unknown interface does nothing.
    pub fn detach_interface(&self, ifp: &NetInterface) {
        let removed: Vec<Arc<Tap>> = {
            let mut taps = self.taps.write();
            let (removed, kept): (Vec<_>, Vec<_>) = taps
                .drain(..)
                .partition(|tap| std::ptr::eq(Arc::as_ptr(tap.interface()), ifp));
            *taps = kept;
            removed
        };

        for tap in removed {
            tap.teardown();
        }
    }

    /// Names of every interface with at least one registered tap.
    pub fn interfaces(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .taps
            .read()
            .iter()
            .map(|tap| tap.interface().name().to_owned())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Finds the tap of the interface named `name` with the lowest link type.
    pub(crate) fn find_tap(&self, name: &str) -> Option<Arc<Tap>> {
        self.taps
            .read()
            .iter()
            .filter(|tap| tap.interface().name() == name)
            .min_by_key(|tap| tap.link_type())
            .cloned()
    }

    /// Finds the tap of `ifp` with link type `dlt`.
    pub(crate) fn find_tap_dlt(&self, ifp: &Arc<NetInterface>, dlt: LinkType) -> Option<Arc<Tap>> {
        self.taps
            .read()
            .iter()
            .find(|tap| Arc::ptr_eq(tap.interface(), ifp) && tap.link_type() == dlt)
            .cloned()
    }

    /// Every link type `ifp` is registered with, in ascending order.
    pub(crate) fn link_types(&self, ifp: &Arc<NetInterface>) -> Vec<LinkType> {
        let mut dlts: Vec<LinkType> = self
            .taps
            .read()
            .iter()
            .filter(|tap| Arc::ptr_eq(tap.interface(), ifp))
            .map(|tap| tap.link_type())
            .collect();
        dlts.sort_unstable();
        dlts.dedup();
        dlts
    }

    // Units

    /// Opens capture unit `unit` on behalf of a process with credentials `cred`.
    pub fn open(self: &Arc<Self>, unit: u32, cred: Credentials) -> Result<Bpf> {
        let bufsize = self.config.read().bufsize();
        let mut units = self.units.lock();
        let Some(slot) = units.get_mut(unit as usize) else {
            return Err(BpfError::NoDevice("unit out of range"));
        };

        if let UnitSlot::Open(_) = slot {
            return Err(BpfError::Busy(unit));
        }

        let desc = Descriptor::new(unit, bufsize, self.signals.clone());
        *slot = UnitSlot::Open(desc.clone());
        drop(units);

        log::debug!("bpf{} opened", unit);
        Ok(Bpf::new(self.clone(), desc, cred))
    }

    /// Opens the first free unit.
    ///
    /// Unit 0 is only used when every other unit is busy, since some tools expect to find it free.
    pub fn open_any(self: &Arc<Self>, cred: Credentials) -> Result<Bpf> {
        let max_units = self.config.read().max_units();
        for unit in (1..max_units).chain(std::iter::once(0)) {
            match self.open(unit, cred) {
                Err(BpfError::Busy(_)) => continue,
                res => return res,
            }
        }

        Err(BpfError::Busy(max_units))
    }

    /// Returns the unit of `desc` to the free pool.
    pub(crate) fn release(&self, desc: &Arc<Descriptor>) {
        let mut units = self.units.lock();
        if let Some(slot) = units.get_mut(desc.unit() as usize) {
            if matches!(slot, UnitSlot::Open(d) if Arc::ptr_eq(d, desc)) {
                *slot = UnitSlot::Free;
            }
        }
    }

    /// The number of currently open units.
    pub fn open_units(&self) -> usize {
        self.units
            .lock()
            .iter()
            .filter(|slot| matches!(slot, UnitSlot::Open(_)))
            .count()
    }
}

impl std::fmt::Debug for CaptureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureRegistry")
            .field("config", &*self.config.read())
            .field("taps", &*self.taps.read())
            .finish()
    }
}
