// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use experiment::{EnvMap, Error, Result};
use log::{debug, info};
use shell_quote::Sh;
use testbed::{Node, RunLogs, SshEndpoint, Testbed};
use tokio::process::Command;

use crate::children::{exit_code, KillScope, ManagedChild};
use crate::policy::RunPolicy;
use crate::CommandRunner;

///
/// Runs commands and file transfers on a remote node through the OpenSSH
/// client, multiplexed over a persistent control master per endpoint. Every
/// handshake first passes the testbed's SSH throttle.
///
pub struct SshRunner {
    testbed: Arc<Testbed>,
    node: Arc<Node>,
    endpoint: SshEndpoint,
}

impl SshRunner {
    pub fn new(testbed: Arc<Testbed>, node: Arc<Node>, endpoint: SshEndpoint) -> SshRunner {
        SshRunner {
            testbed,
            node,
            endpoint,
        }
    }

    ///
    /// Make sure a control master for this endpoint is up. Reuse is keyed on
    /// the control socket existing; the master itself persists past this
    /// process (`ControlPersist=yes`), so later experiments share it too.
    ///
    async fn ensure_master(&self) -> Result<()> {
        let control_path = self.endpoint.control_path()?;
        if control_path.exists() {
            info!("using existing master for '{}'", self.node.name);
            return Ok(());
        }
        info!("creating new master for '{}'", self.node.name);
        let argv = master_argv(&self.endpoint, &control_path.to_string_lossy());
        let mut child = ManagedChild::spawn(&mut command_from_argv(&argv), KillScope::Process)?;
        let status = child.wait().await?;
        if exit_code(status) != 0 {
            return Err(Error::execution(format!(
                "failed to create SSH master connection to '{}'",
                self.node.name
            )));
        }
        Ok(())
    }

    async fn scp_copy(&self, scp_source: &str, scp_destination: &str) -> Result<()> {
        let _permit = self.testbed.ssh_acquire().await;
        self.ensure_master().await?;
        let control_path = self.endpoint.control_path()?;
        let argv = scp_argv(
            &self.endpoint,
            &control_path.to_string_lossy(),
            scp_source,
            scp_destination,
        );
        debug!("SCP command {argv:?}");
        let mut child = ManagedChild::spawn(&mut command_from_argv(&argv), KillScope::Process)?;
        let status = child.wait().await?;
        if exit_code(status) != 0 {
            return Err(Error::execution(format!(
                "copy from '{scp_source}' to '{scp_destination}' failed"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn execute(
        &self,
        policy: &RunPolicy,
        logs: Option<RunLogs>,
        var_env: &EnvMap,
    ) -> Result<()> {
        let _permit = self.testbed.ssh_acquire().await;

        let mut env = self.node.env.clone();
        env.extend(var_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        let command = if env.is_empty() {
            policy.command.clone()
        } else {
            wrap_env(&policy.command, &env)
        };

        info!(
            "executing command '{}' on '{}'",
            policy.command, self.node.name
        );
        self.ensure_master().await?;

        let control_path = self.endpoint.control_path()?;
        let argv = ssh_argv(&self.endpoint, &control_path.to_string_lossy(), &command);
        debug!("SSH command {argv:?}");
        let mut invocation = command_from_argv(&argv);
        if let Some(logs) = logs {
            invocation.stdout(Stdio::from(logs.stdout));
            invocation.stderr(Stdio::from(logs.stderr));
        }
        let mut child = ManagedChild::spawn(&mut invocation, KillScope::Process)?;
        let status = child.wait().await?;
        let code = exit_code(status);
        info!("SSH command terminated with status {code}");
        policy.check_status(code)
    }

    async fn put(&self, source: &str, destination: &str) -> Result<()> {
        let scp_source = if Path::new(source).is_absolute() {
            source.to_owned()
        } else {
            format!("./{source}")
        };
        let scp_destination = format!("{}:{}", self.endpoint.target(), destination);

        // The remote parent directory must exist before scp will copy.
        let mkdir = format!(
            "mkdir -p $(dirname $(readlink -fm {}))",
            sh_quote(destination)
        );
        self.execute(&RunPolicy::expect_success(mkdir), None, &EnvMap::new())
            .await?;
        self.scp_copy(&scp_source, &scp_destination).await
    }

    async fn get(&self, source: &str, destination: &str) -> Result<()> {
        let scp_source = format!("{}:{}", self.endpoint.target(), source);
        let scp_destination = if Path::new(destination).is_absolute() {
            destination.to_owned()
        } else {
            format!("./{destination}")
        };
        if let Some(parent) = Path::new(destination).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    Error::execution(format!("could not create directory {parent:?}: {e}"))
                })?;
            }
        }
        self.scp_copy(&scp_source, &scp_destination).await
    }
}

fn command_from_argv(argv: &[String]) -> Command {
    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]);
    command
}

fn sh_quote(text: &str) -> String {
    String::from_utf8(Sh::quote_vec(text)).expect("quoting preserves UTF-8")
}

///
/// Wrap a shell command in a call to `env` that sets the given variables on
/// the remote side, with everything escaped for the remote shell.
///
pub(crate) fn wrap_env(command: &str, env: &EnvMap) -> String {
    let mut argv = vec!["env".to_owned()];
    for (key, value) in env {
        argv.push(sh_quote(&format!("{key}={value}")));
    }
    argv.push("sh".to_owned());
    argv.push("-c".to_owned());
    argv.push(sh_quote(command));
    argv.join(" ")
}

pub(crate) fn master_argv(endpoint: &SshEndpoint, control_path: &str) -> Vec<String> {
    let mut argv = vec!["ssh".to_owned()];
    push_option(&mut argv, "BatchMode=yes");
    push_option(&mut argv, "StrictHostKeyChecking=no");
    push_option(&mut argv, &format!("ControlPath={control_path}"));
    push_option(&mut argv, "ControlMaster=yes");
    push_option(&mut argv, "ControlPersist=yes");
    argv.push("-p".to_owned());
    argv.push(endpoint.port.to_string());
    argv.extend(endpoint.extra_args.iter().cloned());
    argv.push(endpoint.target());
    argv.push("true".to_owned());
    argv
}

pub(crate) fn ssh_argv(endpoint: &SshEndpoint, control_path: &str, command: &str) -> Vec<String> {
    let mut argv = vec!["ssh".to_owned()];
    push_option(&mut argv, "StrictHostKeyChecking=no");
    push_option(&mut argv, "BatchMode=yes");
    push_option(&mut argv, "ControlMaster=no");
    push_option(&mut argv, &format!("ControlPath={control_path}"));
    argv.push("-p".to_owned());
    argv.push(endpoint.port.to_string());
    argv.extend(endpoint.extra_args.iter().cloned());
    argv.push(endpoint.target());
    argv.push("--".to_owned());
    argv.push(command.to_owned());
    argv
}

pub(crate) fn scp_argv(
    endpoint: &SshEndpoint,
    control_path: &str,
    source: &str,
    destination: &str,
) -> Vec<String> {
    let mut argv = vec!["scp".to_owned()];
    push_option(&mut argv, "StrictHostKeyChecking=no");
    push_option(&mut argv, "BatchMode=yes");
    push_option(&mut argv, "ControlMaster=no");
    push_option(&mut argv, &format!("ControlPath={control_path}"));
    argv.push("-P".to_owned());
    argv.push(endpoint.port.to_string());
    argv.extend(endpoint.extra_args.iter().cloned());
    argv.push("--".to_owned());
    argv.push(source.to_owned());
    argv.push(destination.to_owned());
    argv
}

fn push_option(argv: &mut Vec<String>, option: &str) {
    argv.push("-o".to_owned());
    argv.push(option.to_owned());
}
