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
use std::ffi::OsStr;
use std::io::Write;
use std::process::{Command, Output, Stdio};

#[derive(thiserror::Error, Debug)]
pub enum CmdError {
    #[error("Subprocess {0} with arguments {1:?} failed with output: {2}")]
    Subprocess(String, Vec<String>, String),
    #[error("Command {0} with args {1:?} produced output that is not valid UTF8")]
    OutputParse(String, Vec<String>),
    #[error("Error running '{0}': {1:#}")]
    RunError(String, String),
}

impl CmdError {
    pub fn subprocess_error(command: &Command, output: &Output) -> Self {
        let error_details = if output.stderr.is_empty() {
            String::from_utf8_lossy(&output.stdout).to_string()
        } else {
            String::from_utf8_lossy(&output.stderr).to_string()
        };

        Self::Subprocess(
            command.get_program().to_string_lossy().to_string(),
            arg_list(command),
            error_details.trim().to_string(),
        )
    }

    pub fn output_parse_error(command: &Command) -> Self {
        Self::OutputParse(
            command.get_program().to_string_lossy().to_string(),
            arg_list(command),
        )
    }
}

pub type CmdResult<T> = std::result::Result<T, CmdError>;

/// Blocking subprocess runner. Used for `ip`, the DPDK bind tool and IPAM
/// plugins, none of which we want to retry.
#[derive(Debug)]
pub struct Cmd {
    command: Command,
    input: Option<Vec<u8>>,
}

impl Cmd {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            command: Command::new(program),
            input: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.command.args(args);
        self
    }

    pub fn env<K, V>(mut self, key: K, value: V) -> Self
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.command.env(key, value);
        self
    }

    /// Bytes written to the child's stdin.
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Runs the command and returns stdout. A non-zero exit is an error
    /// carrying stderr (or stdout when stderr is empty).
    pub fn output(mut self) -> CmdResult<String> {
        tracing::trace!(cmd = %self.pretty_cmd(), "Running");

        let output = match self.input.take() {
            None => self.command.stdin(Stdio::null()).output(),
            Some(input) => self.run_with_input(&input),
        }
        .map_err(|x| CmdError::RunError(self.pretty_cmd(), x.to_string()))?;

        if !output.status.success() {
            tracing::debug!(
                cmd = %self.pretty_cmd(),
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "Command failed"
            );
            return Err(CmdError::subprocess_error(&self.command, &output));
        }
        String::from_utf8(output.stdout).map_err(|_| CmdError::output_parse_error(&self.command))
    }

    fn run_with_input(&mut self, input: &[u8]) -> std::io::Result<Output> {
        let mut child = self
            .command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            // A child may exit without reading its input; its status decides.
            match stdin.write_all(input) {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                _ => {}
            }
        }
        child.wait_with_output()
    }

    pub fn pretty_cmd(&self) -> String {
        format!(
            "{} {}",
            self.command.get_program().to_string_lossy(),
            arg_list(&self.command).join(" ")
        )
    }
}

fn arg_list(command: &Command) -> Vec<String> {
    command
        .get_args()
        .map(|arg| arg.to_string_lossy().to_string())
        .collect()
}
