/*
 * SPDX-FileCopyrightText: Copyright (c) 2021-2024 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
 * SPDX-License-Identifier: LicenseRef-NvidiaProprietary
 *
 * NVIDIA CORPORATION, its affiliates and licensors retain all intellectual
 * property and proprietary rights in and to this material, related
 * documentation and any modifications thereto. Any use, reproduction,
 * disclosure or distribution of this material and related documentation
 * without an express license agreement from NVIDIA CORPORATION or
 * its affiliates is strictly prohibited.
 */

//! Network namespace handles and the thread-pinned context that switches
//! between them.
//!
//! `setns(2)` changes the namespace of the calling thread only. Everything
//! that depends on the current namespace (netlink sockets, interface
//! lookups) therefore runs on the thread that owns the [`PinnedContext`],
//! which cannot be sent elsewhere and returns the thread to its original
//! namespace when dropped.

use std::cell::Cell;
use std::fs::File;
use std::future::Future;
use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::sched::{CloneFlags, setns};

use crate::error::SriovError;

const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// An open network namespace.
#[derive(Debug)]
pub struct NetNs {
    path: PathBuf,
    file: File,
}

impl NetNs {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SriovError> {
        let path = path.into();
        match File::open(&path) {
            Ok(file) => Ok(Self { path, file }),
            Err(source) => Err(SriovError::NamespaceOpenFailed { path, source }),
        }
    }

    /// The namespace the calling thread is in right now.
    pub fn current() -> Result<Self, SriovError> {
        Self::open(THREAD_NETNS)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Moves the calling thread into this namespace.
    pub fn enter(&self) -> Result<(), SriovError> {
        setns(&self.file, CloneFlags::CLONE_NEWNET).map_err(|source| {
            SriovError::NamespaceSwitchFailed {
                path: self.path.clone(),
                source,
            }
        })
    }
}

impl AsFd for NetNs {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// Owns the thread all namespace-sensitive work runs on.
///
/// Holds the namespace the thread started in plus a single-threaded runtime
/// for netlink requests, whose tasks never leave this thread.
pub struct PinnedContext {
    origin: NetNs,
    runtime: tokio::runtime::Runtime,
    switched: Cell<bool>,
    // setns state is per thread
    _not_send: PhantomData<*const ()>,
}

impl PinnedContext {
    pub fn acquire() -> Result<Self, SriovError> {
        let origin = NetNs::current()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(SriovError::Runtime)?;
        tracing::trace!(origin = %origin.path().display(), "Acquired pinned namespace context");
        Ok(Self {
            origin,
            runtime,
            switched: Cell::new(false),
            _not_send: PhantomData,
        })
    }

    pub fn origin(&self) -> &NetNs {
        &self.origin
    }

    /// Moves the owning thread into `netns`.
    pub fn enter(&self, netns: &NetNs) -> Result<(), SriovError> {
        netns.enter()?;
        self.switched.set(true);
        Ok(())
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

impl Drop for PinnedContext {
    fn drop(&mut self) {
        if !self.switched.get() {
            return;
        }
        if let Err(e) = self.origin.enter() {
            tracing::error!(error = %e, "Failed to return to the original network namespace");
        }
    }
}

impl std::fmt::Debug for PinnedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedContext")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_namespace() {
        let err = NetNs::open("/proc/self/ns/definitely-not-a-namespace").unwrap_err();
        assert!(matches!(err, SriovError::NamespaceOpenFailed { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_enter_non_namespace_file_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let ns = NetNs::open(file.path()).unwrap();
        let err = ns.enter().unwrap_err();
        assert!(matches!(err, SriovError::NamespaceSwitchFailed { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_current_namespace() {
        let ns = NetNs::current().unwrap();
        assert_eq!(ns.path(), Path::new(THREAD_NETNS));
        assert!(ns.raw_fd() >= 0);
    }
}
