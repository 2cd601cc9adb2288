// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2024 Nathaniel Bennett <me[at]nathanielbennett[dotcom]>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Asynchronous capture for use within a `tokio` runtime.

use std::future;
use std::task::Poll;

use crate::device::Bpf;
use crate::error::{BpfError, Result};
use crate::notify::PollEvents;

/// A capture descriptor whose reads await captured data instead of blocking the thread.
pub struct AsyncBpf {
    bpf: Bpf,
}

impl AsyncBpf {
    /// Wraps `bpf`, switching it to nonblocking mode.
    pub fn new(bpf: Bpf) -> Result<Self> {
        bpf.set_nonblocking(true)?;
        Ok(Self { bpf })
    }

    #[inline]
    pub fn get_ref(&self) -> &Bpf {
        &self.bpf
    }

    /// Returns the underlying descriptor, still in nonblocking mode.
    #[inline]
    pub fn into_inner(self) -> Bpf {
        self.bpf
    }

    /// Waits until a read would return data (or fail because the descriptor was detached).
    pub async fn readable(&self) {
        future::poll_fn(|cx| {
            self.bpf.register_waker(cx.waker());
            if self.bpf.poll(PollEvents::READABLE).is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        })
        .await
    }

    /// Reads one buffer of capture records into `buf`, which must be exactly the descriptor's
    /// buffer length.
    ///
    /// If the descriptor has a read timeout and it expires, whatever has been captured so far is
    /// returned; 0 means nothing was.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let timeout = self.bpf.read_timeout()?;

        let wait = async {
            loop {
                match self.bpf.read(buf) {
                    Err(BpfError::WouldBlock) => self.readable().await,
                    res => return res,
                }
            }
        };

        let Some(timeout) = timeout else {
            return wait.await;
        };

        let res = ::tokio::time::timeout(timeout, wait).await;
        match res {
            Ok(res) => res,
            Err(_) => match self.bpf.read(buf) {
                Err(BpfError::WouldBlock) => Ok(0),
                res => res,
            },
        }
    }

    /// Injects one link-layer packet on the bound interface.
    #[inline]
    pub async fn write(&self, packet: &[u8]) -> Result<usize> {
        self.bpf.write(packet)
    }
}

impl std::fmt::Debug for AsyncBpf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncBpf").field("bpf", &self.bpf).finish()
    }
}
