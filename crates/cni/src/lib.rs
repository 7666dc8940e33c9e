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

//! CNI plugin attaching SR-IOV virtual functions to pods, with per-interface
//! bandwidth guarantees placed across the node's physical functions.

pub mod cmd;
pub mod command_line;
pub mod config;
pub mod error;
pub mod host;
pub mod ipam;
pub mod logging;
pub mod metadata;
pub mod netlink;
pub mod netns;
pub mod plugin;
pub mod store;
pub mod sysfs;
pub mod vf;

#[cfg(test)]
mod tests;

pub use command_line::{CniCommand, Options};
pub use config::NetConf;
pub use error::SriovError;
pub use logging::init_logging;
pub use plugin::{ErrorReport, Plugin, PluginError};
