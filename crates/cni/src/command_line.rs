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
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Invocation arguments. The container runtime passes them as `CNI_*`
/// environment variables; the flags exist for running the plugin by hand.
#[derive(Parser, Debug)]
#[clap(name = "rdma-sriov", about = "CNI plugin attaching SR-IOV VFs to pods")]
pub struct Options {
    #[clap(long, env = "CNI_COMMAND", value_enum)]
    pub command: CniCommand,

    #[clap(long, env = "CNI_CONTAINERID", default_value = "")]
    pub container_id: String,

    /// Path of the pod network namespace. Empty on some DEL calls.
    #[clap(long, env = "CNI_NETNS", default_value = "")]
    pub netns: String,

    #[clap(long, env = "CNI_IFNAME", default_value = "eth0")]
    pub if_name: String,

    #[clap(long = "cni-args", env = "CNI_ARGS", default_value = "")]
    pub args: String,

    /// Colon-separated directories searched for IPAM plugins.
    #[clap(long, env = "CNI_PATH", default_value = "/opt/cni/bin")]
    pub cni_path: String,
}

impl Options {
    pub fn load() -> Self {
        Self::parse()
    }

    pub fn plugin_dirs(&self) -> Vec<PathBuf> {
        self.cni_path
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .collect()
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CniCommand {
    #[value(name = "ADD")]
    Add,
    #[value(name = "DEL")]
    Del,
    #[value(name = "CHECK")]
    Check,
    #[value(name = "VERSION")]
    Version,
}

impl CniCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            CniCommand::Add => "ADD",
            CniCommand::Del => "DEL",
            CniCommand::Check => "CHECK",
            CniCommand::Version => "VERSION",
        }
    }
}
