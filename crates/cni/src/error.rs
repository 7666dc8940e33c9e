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
use std::io;
use std::path::PathBuf;

use crate::cmd::CmdError;

/// Failures of host-side VF handling. None of these are retried.
#[derive(thiserror::Error, Debug)]
pub enum SriovError {
    #[error("No virtual function with a network device found under {pf}")]
    DeviceNotFound { pf: String },
    #[error("Network device {name} not found")]
    LinkNotFound { name: String },
    #[error("VF {vf} of {pf} exposes {count} network devices, at most {max} expected")]
    AmbiguousDevice {
        pf: String,
        vf: u32,
        count: usize,
        max: usize,
    },
    #[error("Binding {device} to driver {driver} failed: {reason}")]
    DriverBindFailed {
        device: String,
        driver: String,
        reason: String,
    },
    #[error("Switching to network namespace {path} failed: {source}")]
    NamespaceSwitchFailed {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("Opening network namespace {path} failed: {source}")]
    NamespaceOpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Setting tx rate on {pf} VF {vf} failed: {reason}")]
    RateLimitFailed { pf: String, vf: u32, reason: String },
    #[error("Setting VLAN {vlan} on {pf} VF {vf} failed: {reason}")]
    VlanFailed {
        pf: String,
        vf: u32,
        vlan: u16,
        reason: String,
    },
    #[error("VF {vf} of {pf} is shared by two network devices and can only be used with l2enable")]
    SharedVfRequiresL2 { pf: String, vf: u32 },
    #[error("Link operation '{action}' on {link} failed: {reason}")]
    LinkFailed {
        link: String,
        action: &'static str,
        reason: String,
    },
    #[error("Persisting interface config at {path} failed: {reason}")]
    ConfigPersistFailed { path: PathBuf, reason: String },
    #[error("No persisted interface config at {path}")]
    ConfigNotFound { path: PathBuf },
    #[error("Accessing {path} failed: {source}")]
    Sysfs {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Starting netlink runtime failed: {0}")]
    Runtime(#[source] io::Error),
    #[error(transparent)]
    Cmd(#[from] CmdError),
}

impl SriovError {
    pub fn link_failed(link: impl Into<String>, action: &'static str, reason: impl ToString) -> Self {
        Self::LinkFailed {
            link: link.into(),
            action,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn sysfs(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Sysfs { path, source }
    }
}
