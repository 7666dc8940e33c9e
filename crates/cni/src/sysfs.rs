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
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::SriovError;

const SYSFS_NET_BASE: &str = "class/net";
const VF_DIR_PREFIX: &str = "virtfn";

/// Read access to the SR-IOV parts of sysfs, rooted at `root` (normally
/// `/sys`) so tests can point it at a directory tree of their own.
///
/// Only meaningful from the host network namespace: `class/net` lists the
/// netdevs of the namespace that mounted sysfs.
#[derive(Debug, Clone)]
pub struct Sysfs {
    root: PathBuf,
}

impl Sysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn net_dir(&self, netdev: &str) -> PathBuf {
        self.root.join(SYSFS_NET_BASE).join(netdev)
    }

    fn device_dir(&self, pf: &str) -> PathBuf {
        self.net_dir(pf).join("device")
    }

    fn vf_dir(&self, pf: &str, vf: u32) -> PathBuf {
        self.device_dir(pf).join(format!("{VF_DIR_PREFIX}{vf}"))
    }

    pub fn num_vfs(&self, pf: &str) -> Result<u32, SriovError> {
        read_u32(&self.device_dir(pf).join("sriov_numvfs"))
    }

    pub fn total_vfs(&self, pf: &str) -> Result<u32, SriovError> {
        read_u32(&self.device_dir(pf).join("sriov_totalvfs"))
    }

    /// Turns on every VF the device supports if none are enabled yet.
    pub fn ensure_sriov_enabled(&self, pf: &str) -> Result<(), SriovError> {
        if self.num_vfs(pf)? > 0 {
            return Ok(());
        }
        let total = self.total_vfs(pf)?;
        if total == 0 {
            return Err(SriovError::DeviceNotFound { pf: pf.to_string() });
        }
        let path = self.device_dir(pf).join("sriov_numvfs");
        fs::write(&path, total.to_string()).map_err(SriovError::sysfs(&path))?;
        tracing::info!(pf, total, "Enabled SR-IOV virtual functions");
        Ok(())
    }

    /// Netdevs bound to one VF, ordered by interface index. A VF without a
    /// `net` directory (e.g. bound to a userspace driver) has none.
    pub fn vf_netdevs(&self, pf: &str, vf: u32) -> Result<Vec<String>, SriovError> {
        let dir = self.vf_dir(pf, vf).join("net");
        let mut netdevs = match list_dir(&dir) {
            Ok(names) => names,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(SriovError::Sysfs { path: dir, source }),
        };
        netdevs.sort_by_cached_key(|name| (self.ifindex(name).unwrap_or(u32::MAX), name.clone()));
        Ok(netdevs)
    }

    /// The VF's PCI address, from the target of its `virtfnN` symlink.
    pub fn vf_pci_address(&self, pf: &str, vf: u32) -> Result<String, SriovError> {
        let link = self.vf_dir(pf, vf);
        let target = fs::read_link(&link).map_err(SriovError::sysfs(&link))?;
        target
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| SriovError::Sysfs {
                path: link,
                source: io::Error::new(io::ErrorKind::InvalidData, "symlink has no target name"),
            })
    }

    /// The other netdev sharing this PF's PCI function, if the function
    /// exposes exactly two of them.
    pub fn shared_sibling(&self, pf: &str) -> Result<Option<String>, SriovError> {
        let dir = self.device_dir(pf).join("net");
        let netdevs = list_dir(&dir).map_err(SriovError::sysfs(&dir))?;
        if netdevs.len() != 2 {
            return Ok(None);
        }
        Ok(netdevs.into_iter().find(|name| name != pf))
    }

    /// Number of VF netdevs currently present under `pf`.
    pub fn vf_netdev_count(&self, pf: &str) -> Result<usize, SriovError> {
        let total = self.num_vfs(pf)?;
        let mut count = 0;
        for vf in 0..total {
            count += self.vf_netdevs(pf, vf)?.len();
        }
        Ok(count)
    }

    /// Enables SR-IOV on every candidate and orders them by how many VF
    /// netdevs they still have, most first.
    pub fn ordered_pfs(&self, candidates: &[String]) -> Result<Vec<String>, SriovError> {
        let mut counted = Vec::with_capacity(candidates.len());
        for pf in candidates {
            self.ensure_sriov_enabled(pf)?;
            counted.push((self.vf_netdev_count(pf)?, pf.clone()));
        }
        counted.sort_by_key(|(count, _)| std::cmp::Reverse(*count));
        Ok(counted.into_iter().map(|(_, pf)| pf).collect())
    }

    pub fn ifindex(&self, netdev: &str) -> Result<u32, SriovError> {
        read_u32(&self.net_dir(netdev).join("ifindex"))
    }
}

fn read_u32(path: &Path) -> Result<u32, SriovError> {
    let data = fs::read_to_string(path).map_err(SriovError::sysfs(path))?;
    data.trim().parse().map_err(|e| SriovError::Sysfs {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidData, format!("'{}': {e}", data.trim())),
    })
}

fn list_dir(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = fs::read_dir(dir)?
        .map(|entry| entry.map(|entry| entry.file_name().to_string_lossy().to_string()))
        .collect::<io::Result<Vec<_>>>()?;
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::common::FakeSysfs;

    #[test]
    fn test_vf_netdevs_and_pci_address() {
        let fake = FakeSysfs::new()
            .pf("ens1f0", 4, 8)
            .vf("ens1f0", 0, &[])
            .vf("ens1f0", 1, &[("ens1f0v1", 31)])
            .vf("ens1f0", 2, &[("ens1f0v2b", 12), ("ens1f0v2a", 40)]);
        let sysfs = fake.sysfs();

        assert!(sysfs.vf_netdevs("ens1f0", 0).unwrap().is_empty());
        assert_eq!(sysfs.vf_netdevs("ens1f0", 1).unwrap(), vec!["ens1f0v1"]);
        // Ordered by ifindex, not by name.
        assert_eq!(
            sysfs.vf_netdevs("ens1f0", 2).unwrap(),
            vec!["ens1f0v2b", "ens1f0v2a"]
        );
        // VF 3 exists in sriov_numvfs but has no directory at all.
        assert!(sysfs.vf_netdevs("ens1f0", 3).unwrap().is_empty());

        assert_eq!(sysfs.vf_pci_address("ens1f0", 1).unwrap(), "0000:3b:00.3");
        assert!(matches!(
            sysfs.vf_pci_address("ens1f0", 3).unwrap_err(),
            SriovError::Sysfs { .. }
        ));

        assert_eq!(sysfs.vf_netdev_count("ens1f0").unwrap(), 3);
    }

    #[test]
    fn test_shared_sibling() {
        let fake = FakeSysfs::new()
            .pf("p0", 1, 1)
            .pf("p1", 1, 1)
            .pf("solo", 1, 1)
            .shared_pfs("p0", "p1");
        let sysfs = fake.sysfs();

        assert_eq!(sysfs.shared_sibling("p0").unwrap().as_deref(), Some("p1"));
        assert_eq!(sysfs.shared_sibling("p1").unwrap().as_deref(), Some("p0"));
        assert_eq!(sysfs.shared_sibling("solo").unwrap(), None);
    }

    #[test]
    fn test_ensure_sriov_enabled_writes_total() {
        let fake = FakeSysfs::new().pf("ens1f0", 0, 16).pf("dead", 0, 0);
        let sysfs = fake.sysfs();

        sysfs.ensure_sriov_enabled("ens1f0").unwrap();
        assert_eq!(sysfs.num_vfs("ens1f0").unwrap(), 16);

        assert!(matches!(
            sysfs.ensure_sriov_enabled("dead").unwrap_err(),
            SriovError::DeviceNotFound { .. }
        ));
        assert!(matches!(
            sysfs.ensure_sriov_enabled("missing").unwrap_err(),
            SriovError::Sysfs { .. }
        ));
    }

    #[test]
    fn test_ordered_pfs() {
        let fake = FakeSysfs::new()
            .pf("a", 2, 2)
            .vf("a", 0, &[("a0", 10)])
            .pf("b", 2, 2)
            .vf("b", 0, &[("b0", 11)])
            .vf("b", 1, &[("b1", 12)])
            .pf("c", 2, 2)
            .vf("c", 1, &[("c1", 13)]);
        let sysfs = fake.sysfs();

        let order = sysfs
            .ordered_pfs(&["a".to_string(), "b".to_string(), "c".to_string()])
            .unwrap();
        assert_eq!(order, vec!["b", "a", "c"]);
    }
}
