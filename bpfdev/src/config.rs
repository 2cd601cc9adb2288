// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Tunables of a capture registry.

use crate::error::{BpfError, Result};

/// Smallest buffer size a descriptor may be configured with.
pub const BPF_MINBUFSIZE: u32 = 32;
/// Default upper bound on descriptor buffer sizes.
pub const BPF_MAXBUFSIZE: u32 = 2 * 1024 * 1024;
/// Default buffer size of newly opened descriptors.
pub const BPF_DEFAULT_BUFSIZE: u32 = 32 * 1024;
/// Default maximum number of instructions in a filter program.
pub const BPF_MAXINSNS: usize = 512;
/// Default number of capture units a registry manages.
pub const BPF_MAXUNITS: u32 = 256;
/// Largest packet (including link framing) that may be injected with a single write.
pub const BPF_MAXPACKET: usize = 64 * 1024;

/// Runtime-adjustable registry settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sysctl {
    /// Buffer size assigned to newly opened descriptors.
    BufSize,
    /// Upper bound for buffer sizes requested by descriptors.
    MaxBufSize,
}

/// Configuration shared by every descriptor of a registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BpfConfig {
    bufsize: u32,
    max_bufsize: u32,
    max_units: u32,
    max_insns: usize,
    max_packet: usize,
}

impl Default for BpfConfig {
    fn default() -> Self {
        Self {
            bufsize: BPF_DEFAULT_BUFSIZE,
            max_bufsize: BPF_MAXBUFSIZE,
            max_units: BPF_MAXUNITS,
            max_insns: BPF_MAXINSNS,
            max_packet: BPF_MAXPACKET,
        }
    }
}

impl BpfConfig {
    #[inline]
    pub fn builder() -> BpfConfigBuilder {
        BpfConfigBuilder {
            config: BpfConfig::default(),
        }
    }

    /// Buffer size assigned to newly opened descriptors.
    #[inline]
    pub fn bufsize(&self) -> u32 {
        self.bufsize
    }

    /// Upper bound for descriptor buffer sizes.
    #[inline]
    pub fn max_bufsize(&self) -> u32 {
        self.max_bufsize
    }

    /// Number of units (`0..max_units`) that may be opened.
    #[inline]
    pub fn max_units(&self) -> u32 {
        self.max_units
    }

    /// Maximum number of instructions in an installed filter program.
    #[inline]
    pub fn max_insns(&self) -> usize {
        self.max_insns
    }

    /// Largest packet (including link framing) accepted by a single write.
    #[inline]
    pub fn max_packet(&self) -> usize {
        self.max_packet
    }

    /// Clamps a requested buffer size into the permitted range.
    #[inline]
    pub fn clamp_bufsize(&self, requested: u32) -> u32 {
        requested.clamp(BPF_MINBUFSIZE, self.max_bufsize)
    }

    /// Reads a runtime setting.
    pub fn get(&self, name: Sysctl) -> u32 {
        match name {
            Sysctl::BufSize => self.bufsize,
            Sysctl::MaxBufSize => self.max_bufsize,
        }
    }

    /// Updates a runtime setting, rejecting values outside of its permitted range.
    ///
    /// `BufSize` must lie within `[BPF_MINBUFSIZE, max_bufsize]`; `MaxBufSize` within
    /// `[BPF_MINBUFSIZE, i32::MAX]`. Lowering `MaxBufSize` below the current default buffer size
    /// lowers the default as well.
    pub fn set(&mut self, name: Sysctl, value: u32) -> Result<()> {
        match name {
            Sysctl::BufSize => {
                if !(BPF_MINBUFSIZE..=self.max_bufsize).contains(&value) {
                    return Err(BpfError::InvalidArgument("buffer size out of range"));
                }
                self.bufsize = value;
            }
            Sysctl::MaxBufSize => {
                if !(BPF_MINBUFSIZE..=i32::MAX as u32).contains(&value) {
                    return Err(BpfError::InvalidArgument("maximum buffer size out of range"));
                }
                self.max_bufsize = value;
                self.bufsize = self.bufsize.min(value);
            }
        }

        Ok(())
    }
}

/// Builder for [`BpfConfig`].
#[derive(Clone, Debug)]
pub struct BpfConfigBuilder {
    config: BpfConfig,
}

impl BpfConfigBuilder {
    pub fn bufsize(mut self, bufsize: u32) -> Self {
        self.config.bufsize = bufsize;
        self
    }

    pub fn max_bufsize(mut self, max_bufsize: u32) -> Self {
        self.config.max_bufsize = max_bufsize;
        self
    }

    pub fn max_units(mut self, max_units: u32) -> Self {
        self.config.max_units = max_units;
        self
    }

    pub fn max_insns(mut self, max_insns: usize) -> Self {
        self.config.max_insns = max_insns;
        self
    }

    pub fn max_packet(mut self, max_packet: usize) -> Self {
        self.config.max_packet = max_packet;
        self
    }

    pub fn build(self) -> Result<BpfConfig> {
        let config = self.config;
        if !(BPF_MINBUFSIZE..=i32::MAX as u32).contains(&config.max_bufsize) {
            return Err(BpfError::InvalidArgument("maximum buffer size out of range"));
        }

        if !(BPF_MINBUFSIZE..=config.max_bufsize).contains(&config.bufsize) {
            return Err(BpfError::InvalidArgument("buffer size out of range"));
        }

        if config.max_units == 0 {
            return Err(BpfError::InvalidArgument("at least one unit is required"));
        }

        if config.max_insns == 0 {
            return Err(BpfError::InvalidArgument("instruction limit must be non-zero"));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BpfConfig::default();
        assert_eq!(config.bufsize(), 32768);
        assert_eq!(config.max_bufsize(), 2 * 1024 * 1024);
        assert_eq!(config.clamp_bufsize(1), BPF_MINBUFSIZE);
        assert_eq!(config.clamp_bufsize(u32::MAX), BPF_MAXBUFSIZE);
    }

    #[test]
    fn sysctl_bounds() {
        let mut config = BpfConfig::default();
        assert!(config.set(Sysctl::BufSize, 16).is_err());
        assert!(config.set(Sysctl::BufSize, BPF_MAXBUFSIZE + 1).is_err());
        config.set(Sysctl::BufSize, 4096).unwrap();
        assert_eq!(config.get(Sysctl::BufSize), 4096);

        config.set(Sysctl::MaxBufSize, 1024).unwrap();
        assert_eq!(config.bufsize(), 1024);
        assert!(config.set(Sysctl::MaxBufSize, u32::MAX).is_err());
    }

    #[test]
    fn builder_validates() {
        assert!(BpfConfig::builder().bufsize(64).max_bufsize(32).build().is_err());
        assert!(BpfConfig::builder().max_units(0).build().is_err());
        let config = BpfConfig::builder().bufsize(100).max_units(4).build().unwrap();
        assert_eq!(config.bufsize(), 100);
        assert_eq!(config.max_units(), 4);
    }
}
