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

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::net::IpAddr;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use ipnetwork::IpNetwork;
use sriov_inventory::{InterfaceRequest, PhysicalFunction};
use tempfile::TempDir;

use crate::command_line::{CniCommand, Options};
use crate::config::NetConf;
use crate::error::SriovError;
use crate::host::{Host, LinkInfo};
use crate::netns::NetNs;
use crate::sysfs::Sysfs;

pub const ORIGIN: &str = "origin";
pub const POD: &str = "pod";
pub const CONTAINER_ID: &str = "c0ffee";
pub const POD_ARGS: &str = "IgnoreUnknown=1;K8S_POD_NAMESPACE=team-a;K8S_POD_NAME=trainer-0";

/// A network config pointing at `sysfs` and `scratch`, with `overrides`
/// replacing top level keys. Returns the parsed config and its raw bytes.
pub fn net_conf(
    sysfs: &FakeSysfs,
    scratch: &Path,
    overrides: serde_json::Value,
) -> (NetConf, Vec<u8>) {
    let mut doc = serde_json::json!({
        "cniVersion": "0.3.1",
        "name": "rdma-net",
        "type": "rdma-sriov",
        "if0": "ens1f0",
        "cniDir": scratch,
        "sysfsRoot": sysfs.path(),
        "ipam": { "type": "host-local", "subnet": "10.1.0.0/24" },
        "dns": { "nameservers": ["10.0.0.10"] },
    });
    if let (Some(doc), serde_json::Value::Object(overrides)) = (doc.as_object_mut(), overrides) {
        doc.extend(overrides);
    }
    let raw = serde_json::to_vec(&doc).unwrap();
    (NetConf::parse(&raw).unwrap(), raw)
}

pub fn options(command: CniCommand, netns: &Path) -> Options {
    Options {
        command,
        container_id: CONTAINER_ID.to_string(),
        netns: netns.to_string_lossy().to_string(),
        if_name: "eth0".to_string(),
        args: POD_ARGS.to_string(),
        cni_path: String::new(),
    }
}

pub fn pf(name: &str, capacity_tx_rate: u64, capacity_vfs: u32) -> PhysicalFunction {
    PhysicalFunction {
        name: name.to_string(),
        capacity_tx_rate,
        capacity_vfs,
        ..Default::default()
    }
}

pub fn request(min_tx_rate: u64, max_tx_rate: u64) -> InterfaceRequest {
    InterfaceRequest {
        min_tx_rate,
        max_tx_rate,
    }
}

pub fn vf_mac(pf: u32, vf: u32) -> String {
    format!("0a:00:00:00:{pf:02x}:{vf:02x}")
}

/// `ens1f0` with 4 VFs and `ens1f1` with 8. Every VF has one netdev
/// `<pf>v<n>` that also exists as a link in the origin namespace of `host`,
/// and `host` keeps the tree in step with link moves.
pub fn two_pf_node(host: &FakeHost) -> FakeSysfs {
    let mut sysfs = FakeSysfs::new().pf("ens1f0", 4, 4).pf("ens1f1", 8, 8);
    for (pf_number, (pf, vfs)) in [("ens1f0", 4), ("ens1f1", 8)].into_iter().enumerate() {
        for vf in 0..vfs {
            let netdev = format!("{pf}v{vf}");
            let ifindex = 200 + pf_number as u32 * 16 + vf;
            sysfs = sysfs.vf(pf, vf, &[(netdev.as_str(), ifindex)]);
            host.add_link(ORIGIN, &netdev, &vf_mac(pf_number as u32, vf));
        }
    }
    host.track_sysfs(sysfs.path());
    sysfs
}

/// Every mutating call a [`FakeHost`] received, with links named as they
/// were at the time of the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Enter(String),
    Up(String),
    Down(String),
    Rename { from: String, to: String },
    Move { link: String, netns: String },
    AddAddress { link: String, address: String },
    AddRoute { link: String, dst: String, gw: Option<String> },
    Vlan { pf: String, vf: u32, vlan: u16 },
    Rate { pf: String, vf: u32, min: u64, max: u64 },
    Bind { driver: String, device: String },
}

type FailWhen = Box<dyn Fn(&HostCall) -> bool>;

#[derive(Default)]
struct FakeState {
    current: String,
    links: BTreeMap<String, Vec<LinkInfo>>,
    next_index: u32,
    calls: Vec<HostCall>,
    fail_when: Vec<FailWhen>,
}

/// In-memory host: namespaces are named link tables, netns handles are
/// plain files in a temporary directory.
pub struct FakeHost {
    dir: TempDir,
    origin: NetNs,
    state: RefCell<FakeState>,
    sysfs_root: RefCell<Option<PathBuf>>,
}

impl FakeHost {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(ORIGIN), b"").unwrap();
        let origin = NetNs::open(dir.path().join(ORIGIN)).unwrap();
        let mut state = FakeState {
            current: ORIGIN.to_string(),
            next_index: 10,
            ..Default::default()
        };
        state.links.insert(ORIGIN.to_string(), Vec::new());
        Self {
            dir,
            origin,
            state: RefCell::new(state),
            sysfs_root: RefCell::new(None),
        }
    }

    /// Keeps a [`FakeSysfs`] tree in step with link moves: a VF netdev
    /// leaving the origin namespace disappears from its `virtfnN/net`.
    pub fn track_sysfs(&self, root: &Path) {
        *self.sysfs_root.borrow_mut() = Some(root.to_path_buf());
    }

    fn forget_vf_netdev(&self, name: &str) {
        let Some(root) = self.sysfs_root.borrow().clone() else {
            return;
        };
        let Ok(netdevs) = fs::read_dir(root.join("class/net")) else {
            return;
        };
        for netdev in netdevs.flatten() {
            for function in fs::read_dir(netdev.path()).into_iter().flatten().flatten() {
                let vf_netdev = function.path().join("net").join(name);
                if function.file_name() != "device" && vf_netdev.is_dir() {
                    fs::remove_dir_all(vf_netdev).unwrap();
                }
            }
        }
    }

    /// Creates (or reopens) the namespace `name`.
    pub fn netns(&self, name: &str) -> NetNs {
        let path = self.dir.path().join(name);
        if !path.exists() {
            fs::write(&path, b"").unwrap();
        }
        self.state
            .borrow_mut()
            .links
            .entry(name.to_string())
            .or_default();
        NetNs::open(path).unwrap()
    }

    pub fn add_link(&self, netns: &str, name: &str, mac: &str) -> u32 {
        let mut state = self.state.borrow_mut();
        let index = state.next_index;
        state.next_index += 1;
        state
            .links
            .entry(netns.to_string())
            .or_default()
            .push(LinkInfo {
                index,
                name: name.to_string(),
                mac: Some(mac.to_string()),
            });
        index
    }

    pub fn remove_link(&self, netns: &str, name: &str) {
        if let Some(links) = self.state.borrow_mut().links.get_mut(netns) {
            links.retain(|link| link.name != name);
        }
    }

    pub fn link_names(&self, netns: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .state
            .borrow()
            .links
            .get(netns)
            .map(|links| links.iter().map(|link| link.name.clone()).collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn current(&self) -> String {
        self.state.borrow().current.clone()
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.state.borrow().calls.clone()
    }

    /// Calls other than namespace switches.
    pub fn mutations(&self) -> Vec<HostCall> {
        self.calls()
            .into_iter()
            .filter(|call| !matches!(call, HostCall::Enter(_)))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    /// Makes every call matching `predicate` fail (after being recorded).
    pub fn fail_when(&self, predicate: impl Fn(&HostCall) -> bool + 'static) {
        self.state.borrow_mut().fail_when.push(Box::new(predicate));
    }

    fn ns_name(&self, netns: &NetNs) -> String {
        netns
            .path()
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    // Records the call and reports whether it should fail.
    fn record(&self, call: HostCall) -> Result<(), SriovError> {
        let mut state = self.state.borrow_mut();
        let fail = state.fail_when.iter().any(|predicate| predicate(&call));
        state.calls.push(call.clone());
        if fail {
            return Err(SriovError::link_failed(format!("{call:?}"), "fake", "injected failure"));
        }
        Ok(())
    }

    fn current_link_name(&self, index: u32) -> Result<String, SriovError> {
        let state = self.state.borrow();
        state
            .links
            .get(&state.current)
            .and_then(|links| links.iter().find(|link| link.index == index))
            .map(|link| link.name.clone())
            .ok_or_else(|| SriovError::LinkNotFound {
                name: format!("index {index} in {}", state.current),
            })
    }
}

impl Host for FakeHost {
    fn origin_netns(&self) -> &NetNs {
        &self.origin
    }

    fn enter_netns(&self, netns: &NetNs) -> Result<(), SriovError> {
        let name = self.ns_name(netns);
        self.record(HostCall::Enter(name.clone()))?;
        if !self.state.borrow().links.contains_key(&name) {
            return Err(SriovError::NamespaceSwitchFailed {
                path: netns.path().to_path_buf(),
                source: nix::Error::ENOENT,
            });
        }
        self.state.borrow_mut().current = name;
        Ok(())
    }

    fn links(&self) -> Result<Vec<LinkInfo>, SriovError> {
        let state = self.state.borrow();
        Ok(state.links.get(&state.current).cloned().unwrap_or_default())
    }

    fn set_link_up(&self, index: u32) -> Result<(), SriovError> {
        let name = self.current_link_name(index)?;
        self.record(HostCall::Up(name))
    }

    fn set_link_down(&self, index: u32) -> Result<(), SriovError> {
        let name = self.current_link_name(index)?;
        self.record(HostCall::Down(name))
    }

    fn rename_link(&self, index: u32, name: &str) -> Result<(), SriovError> {
        let from = self.current_link_name(index)?;
        self.record(HostCall::Rename {
            from,
            to: name.to_string(),
        })?;
        let mut state = self.state.borrow_mut();
        let current = state.current.clone();
        if let Some(link) = state
            .links
            .get_mut(&current)
            .and_then(|links| links.iter_mut().find(|link| link.index == index))
        {
            link.name = name.to_string();
        }
        Ok(())
    }

    fn move_link(&self, index: u32, netns: &NetNs) -> Result<(), SriovError> {
        let link = self.current_link_name(index)?;
        let target = self.ns_name(netns);
        self.record(HostCall::Move {
            link: link.clone(),
            netns: target.clone(),
        })?;
        if self.current() == ORIGIN && target != ORIGIN {
            self.forget_vf_netdev(&link);
        }
        let mut state = self.state.borrow_mut();
        let current = state.current.clone();
        let links = state.links.entry(current).or_default();
        let Some(position) = links.iter().position(|link| link.index == index) else {
            return Ok(());
        };
        let moved = links.remove(position);
        state.links.entry(target).or_default().push(moved);
        Ok(())
    }

    fn add_address(&self, index: u32, address: IpNetwork) -> Result<(), SriovError> {
        let link = self.current_link_name(index)?;
        self.record(HostCall::AddAddress {
            link,
            address: address.to_string(),
        })
    }

    fn add_route(
        &self,
        index: u32,
        destination: IpNetwork,
        gateway: Option<IpAddr>,
    ) -> Result<(), SriovError> {
        let link = self.current_link_name(index)?;
        self.record(HostCall::AddRoute {
            link,
            dst: destination.to_string(),
            gw: gateway.map(|gw| gw.to_string()),
        })
    }

    fn set_vf_vlan(&self, pf: &str, vf: u32, vlan: u16) -> Result<(), SriovError> {
        self.record(HostCall::Vlan {
            pf: pf.to_string(),
            vf,
            vlan,
        })
    }

    fn set_vf_rate(&self, pf: &str, vf: u32, rate: &InterfaceRequest) -> Result<(), SriovError> {
        self.record(HostCall::Rate {
            pf: pf.to_string(),
            vf,
            min: rate.min_tx_rate,
            max: rate.max_tx_rate,
        })
    }

    fn bind_driver(&self, _tool: &str, driver: &str, device: &str) -> Result<(), SriovError> {
        self.record(HostCall::Bind {
            driver: driver.to_string(),
            device: device.to_string(),
        })
    }
}

/// Builds a sysfs tree shaped like the SR-IOV parts of the real one.
///
/// VF `n` of a PF gets PCI address `0000:3b:00.<n + 2>`.
pub struct FakeSysfs {
    dir: TempDir,
    next_ifindex: u32,
}

impl FakeSysfs {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            next_ifindex: 100,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn sysfs(&self) -> Sysfs {
        Sysfs::new(self.dir.path())
    }

    fn net(&self, netdev: &str) -> PathBuf {
        self.dir.path().join("class/net").join(netdev)
    }

    pub fn pf(mut self, name: &str, num_vfs: u32, total_vfs: u32) -> Self {
        let device = self.net(name).join("device");
        fs::create_dir_all(device.join("net").join(name)).unwrap();
        fs::write(device.join("sriov_numvfs"), format!("{num_vfs}\n")).unwrap();
        fs::write(device.join("sriov_totalvfs"), format!("{total_vfs}\n")).unwrap();
        let ifindex = self.next_ifindex;
        self.next_ifindex += 1;
        fs::write(self.net(name).join("ifindex"), format!("{ifindex}\n")).unwrap();
        self
    }

    /// Adds VF `vf` under `pf` with the given `(netdev, ifindex)` pairs.
    pub fn vf(self, pf: &str, vf: u32, netdevs: &[(&str, u32)]) -> Self {
        let pci_addr = format!("0000:3b:00.{}", vf + 2);
        let function = self.net(pf).join(&pci_addr);
        fs::create_dir_all(&function).unwrap();
        symlink(
            format!("../{pci_addr}"),
            self.net(pf).join("device").join(format!("virtfn{vf}")),
        )
        .unwrap();
        for (netdev, ifindex) in netdevs {
            fs::create_dir_all(function.join("net").join(netdev)).unwrap();
            fs::create_dir_all(self.net(netdev)).unwrap();
            fs::write(self.net(netdev).join("ifindex"), format!("{ifindex}\n")).unwrap();
        }
        self
    }

    /// Makes `a` and `b` two netdevs of the same PCI function.
    pub fn shared_pfs(self, a: &str, b: &str) -> Self {
        fs::create_dir_all(self.net(a).join("device/net").join(b)).unwrap();
        fs::create_dir_all(self.net(b).join("device/net").join(a)).unwrap();
        self
    }
}
