// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Errors returned by capture devices.
//!
//! Every variant corresponds to exactly one `errno` value so that callers used to the `/dev/bpf`
//! interface can keep matching on raw OS errors after converting into [`io::Error`].

use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BpfError>;

/// An error produced by a BPF device operation.
#[derive(Debug, thiserror::Error)]
pub enum BpfError {
    /// The requested unit is already open.
    #[error("capture unit {0} is already open")]
    Busy(u32),
    /// The unit or interface does not exist, or the descriptor is not bound to an interface.
    #[error("no such device: {0}")]
    NoDevice(&'static str),
    /// A configuration value was malformed or not permitted in the descriptor's current state.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A filter program failed validation.
    #[error("invalid filter program: {0}")]
    InvalidFilter(&'static str),
    /// The operation is not permitted (locked descriptor, unprivileged caller, write filter).
    #[error("operation not permitted: {0}")]
    PermissionDenied(&'static str),
    /// The interface was detached or the descriptor closed while the operation was in progress.
    #[error("capture interface detached")]
    Detached,
    /// The link type of the bound interface does not support injecting packets.
    #[error("cannot construct packet for link type {0}")]
    UnsupportedLink(u32),
    /// The bound interface is administratively down.
    #[error("network interface is down")]
    NetworkDown,
    /// The packet exceeds the maximum packet size or the interface MTU.
    #[error("message of {len} bytes exceeds limit of {limit} bytes")]
    MessageSize { len: usize, limit: usize },
    /// The descriptor is in non-blocking mode and no data is available.
    #[error("operation would block")]
    WouldBlock,
    /// A blocked read was interrupted.
    #[error("interrupted")]
    Interrupted,
    /// The network driver reported an error.
    #[error("driver error: {0}")]
    Driver(#[source] io::Error),
}

impl BpfError {
    /// The `errno` value associated with this error.
    pub fn errno(&self) -> i32 {
        match self {
            BpfError::Busy(_) => libc::EBUSY,
            BpfError::NoDevice(_) => libc::ENXIO,
            BpfError::InvalidArgument(_) | BpfError::InvalidFilter(_) => libc::EINVAL,
            BpfError::PermissionDenied(_) => libc::EPERM,
            BpfError::Detached | BpfError::UnsupportedLink(_) => libc::EIO,
            BpfError::NetworkDown => libc::ENETDOWN,
            BpfError::MessageSize { .. } => libc::EMSGSIZE,
            BpfError::WouldBlock => libc::EWOULDBLOCK,
            BpfError::Interrupted => libc::EINTR,
            BpfError::Driver(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl From<BpfError> for io::Error {
    fn from(err: BpfError) -> Self {
        match err {
            BpfError::Driver(e) => e,
            e => io::Error::from_raw_os_error(e.errno()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(BpfError::Busy(0).errno(), libc::EBUSY);
        assert_eq!(BpfError::InvalidFilter("x").errno(), libc::EINVAL);
        assert_eq!(BpfError::Detached.errno(), libc::EIO);
        assert_eq!(
            BpfError::MessageSize { len: 2, limit: 1 }.errno(),
            libc::EMSGSIZE
        );
    }

    #[test]
    fn io_conversion_keeps_errno() {
        let err: io::Error = BpfError::WouldBlock.into();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        let err: io::Error = BpfError::PermissionDenied("locked").into();
        assert_eq!(err.raw_os_error(), Some(libc::EPERM));

        let inner = io::Error::from_raw_os_error(libc::ENODEV);
        let err: io::Error = BpfError::Driver(inner).into();
        assert_eq!(err.raw_os_error(), Some(libc::ENODEV));
    }
}
