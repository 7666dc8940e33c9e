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
use std::path::Path;
use std::sync::Once;

use eyre::eyre;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

static LOG_SETUP: Once = Once::new();

/// Initialize global logging output to STDERR, plus `log_file` when given.
/// STDOUT belongs to the CNI result.
/// Use `export RUST_LOG=trace|debug|info|warn|error` to change log level.
pub fn init_logging(log_file: Option<&Path>) -> eyre::Result<()> {
    let mut result = Ok(());
    LOG_SETUP.call_once(|| {
        result = subscriber(log_file).and_then(|subscriber| Ok(subscriber.try_init()?));
    });
    result
}

// A logging subscriber for use on the current thread.
// Usually you want `init_logging()` instead.
//
// Usage: `let guard = subscriber(None)?.set_default()`
// Subscriber is unregistered when guard is dropped.
pub fn subscriber(log_file: Option<&Path>) -> eyre::Result<impl SubscriberInitExt> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
        .add_directive("rustls=warn".parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("hyper_util=warn".parse()?)
        .add_directive("tower=warn".parse()?)
        .add_directive("kube_client=info".parse()?)
        .add_directive("netlink_proto=warn".parse()?);

    let stderr_formatter = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let file_formatter = match log_file {
        Some(path) => {
            let directory = path
                .parent()
                .ok_or_else(|| eyre!("log file {} has no parent directory", path.display()))?;
            let file_name = path
                .file_name()
                .ok_or_else(|| eyre!("log file {} has no file name", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(tracing_appender::rolling::never(directory, file_name)),
            )
        }
        None => None,
    };

    Ok(tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_formatter)
        .with(file_formatter))
}
