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

//! Hand-off of per-interface state from ADD to DEL.
//!
//! Each configured pod interface gets one JSON file named
//! `<container id>-<pod interface name>` in the scratch directory. DEL reads
//! it exactly once and deletes it.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sriov_inventory::InterfaceRequest;

use crate::config::DpdkConf;
use crate::error::SriovError;

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

/// Everything DEL needs to undo what ADD did to one VF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedInterfaceConfig {
    pub container_id: String,
    /// Name of the interface inside the pod.
    pub if_name: String,
    pub pf_name: String,
    pub vf_index: u32,
    pub pci_addr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_address: Option<String>,
    #[serde(default)]
    pub shared_vf: bool,
    /// The other PF whose netdev also maps to a shared VF.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_pf: Option<String>,
    #[serde(default)]
    pub vlan: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpdk: Option<DpdkConf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_rate: Option<InterfaceRequest>,
}

#[derive(Debug, Clone)]
pub struct ScratchStore {
    dir: PathBuf,
}

impl ScratchStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, container_id: &str, if_name: &str) -> PathBuf {
        self.dir.join(format!("{container_id}-{if_name}"))
    }

    pub fn save(&self, config: &PersistedInterfaceConfig) -> Result<PathBuf, SriovError> {
        let path = self.path_for(&config.container_id, &config.if_name);
        let persist_err = |reason: String| SriovError::ConfigPersistFailed {
            path: path.clone(),
            reason,
        };

        let data = serde_json::to_vec(config).map_err(|e| persist_err(e.to_string()))?;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(&self.dir)
            .map_err(|e| persist_err(format!("creating {}: {e}", self.dir.display())))?;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(FILE_MODE)
            .open(&path)
            .and_then(|mut file| file.write_all(&data))
            .map_err(|e| persist_err(e.to_string()))?;

        tracing::debug!(path = %path.display(), "Saved interface config");
        Ok(path)
    }

    /// Reads the record and deletes it. A second call for the same key fails
    /// with [`SriovError::ConfigNotFound`].
    pub fn consume(
        &self,
        container_id: &str,
        if_name: &str,
    ) -> Result<PersistedInterfaceConfig, SriovError> {
        let path = self.path_for(container_id, if_name);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SriovError::ConfigNotFound { path });
            }
            Err(e) => {
                return Err(SriovError::ConfigPersistFailed {
                    path,
                    reason: e.to_string(),
                });
            }
        };
        fs::remove_file(&path).map_err(|e| SriovError::ConfigPersistFailed {
            path: path.clone(),
            reason: format!("removing after read: {e}"),
        })?;

        serde_json::from_slice(&data).map_err(|e| SriovError::ConfigPersistFailed {
            path,
            reason: e.to_string(),
        })
    }

    /// Removes a record without reading it. Missing records are fine.
    pub fn discard(&self, container_id: &str, if_name: &str) -> Result<(), SriovError> {
        let path = self.path_for(container_id, if_name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SriovError::ConfigPersistFailed {
                path,
                reason: e.to_string(),
            }),
        }
    }

    /// Pod interface names that still have a record for `container_id`.
    pub fn interfaces_for(&self, container_id: &str) -> Result<Vec<String>, SriovError> {
        let prefix = format!("{container_id}-");
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SriovError::ConfigPersistFailed {
                    path: self.dir.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter_map(|name| name.strip_prefix(&prefix).map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }
}
