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

use std::io::Read;

use sriov_cni::ipam::ExecIpam;
use sriov_cni::metadata::KubeMetadata;
use sriov_cni::netlink::LinuxHost;
use sriov_cni::plugin::{CniResult, version_info};
use sriov_cni::{CniCommand, ErrorReport, NetConf, Options, Plugin, PluginError};

// Used for VERSION and for errors raised before the config could be read.
const FALLBACK_CNI_VERSION: &str = "0.3.1";

fn main() -> eyre::Result<()> {
    let options = Options::load();
    if options.command == CniCommand::Version {
        println!("{}", version_info(FALLBACK_CNI_VERSION));
        return Ok(());
    }

    let mut raw_conf = Vec::new();
    std::io::stdin().read_to_end(&mut raw_conf)?;
    let conf = match NetConf::parse(&raw_conf) {
        Ok(conf) => conf,
        Err(e) => fail(FALLBACK_CNI_VERSION, &e.into()),
    };
    sriov_cni::init_logging(conf.log_file.as_deref())?;
    tracing::info!(
        command = options.command.as_str(),
        container_id = %options.container_id,
        netns = %options.netns,
        if_name = %options.if_name,
        "Invoked"
    );

    let outcome = run(&options, &conf, &raw_conf);
    let cni_version = if conf.cni_version.is_empty() {
        FALLBACK_CNI_VERSION
    } else {
        &conf.cni_version
    };
    match outcome {
        Ok(Some(result)) => println!("{}", serde_json::to_string(&result)?),
        Ok(None) => {}
        Err(e) => {
            tracing::error!(error = %e, "{} failed", options.command.as_str());
            fail(cni_version, &e);
        }
    }
    Ok(())
}

fn run(
    options: &Options,
    conf: &NetConf,
    raw_conf: &[u8],
) -> Result<Option<CniResult>, PluginError> {
    if options.command == CniCommand::Check {
        return Ok(None);
    }

    let host = LinuxHost::new()?;
    let inventory = conf.inventory.node_inventory();
    let metadata = KubeMetadata::new(&conf.kubeconfig);
    let ipam = ExecIpam::new(options.plugin_dirs());
    let plugin = Plugin::new(conf, raw_conf, &host, &inventory, &metadata, &ipam);

    match options.command {
        CniCommand::Add => plugin.attach(options).map(Some),
        CniCommand::Del => plugin.detach(options).map(|()| None),
        CniCommand::Check | CniCommand::Version => Ok(None),
    }
}

fn fail(cni_version: &str, error: &PluginError) -> ! {
    let report = ErrorReport::from_plugin_error(cni_version, error);
    match serde_json::to_string(&report) {
        Ok(document) => println!("{document}"),
        Err(_) => eprintln!("{error}"),
    }
    std::process::exit(1)
}
