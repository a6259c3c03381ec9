// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use experiment::{EnvMap, Result};
use log::{info, warn};
use testbed::{Node, RunLogs, Testbed};
use tokio::process::Command;

use crate::children::{exit_code, KillScope, ManagedChild};
use crate::policy::RunPolicy;
use crate::CommandRunner;

///
/// Runs commands on the controller machine itself. File transfers have no
/// meaning here and are ignored with a warning.
///
pub struct LocalRunner {
    node: Arc<Node>,
    _testbed: Arc<Testbed>,
}

impl LocalRunner {
    pub fn new(testbed: Arc<Testbed>, node: Arc<Node>) -> LocalRunner {
        LocalRunner {
            node,
            _testbed: testbed,
        }
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn execute(
        &self,
        policy: &RunPolicy,
        logs: Option<RunLogs>,
        var_env: &EnvMap,
    ) -> Result<()> {
        info!("locally executing command '{}'", policy.command);
        let mut env = self.node.env.clone();
        env.extend(var_env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut command = Command::new("sh");
        command.arg("-c").arg(&policy.command).env_clear().envs(&env);
        if let Some(logs) = logs {
            command.stdout(Stdio::from(logs.stdout));
            command.stderr(Stdio::from(logs.stderr));
        }

        let mut child = ManagedChild::spawn(&mut command, KillScope::ProcessGroup)?;
        let status = child.wait().await?;
        policy.check_status(exit_code(status))
    }

    async fn put(&self, _source: &str, _destination: &str) -> Result<()> {
        warn!(
            "task type 'put' not available for local node '{}', ignoring",
            self.node.name
        );
        Ok(())
    }

    async fn get(&self, _source: &str, _destination: &str) -> Result<()> {
        warn!(
            "task type 'get' not available for local node '{}', ignoring",
            self.node.name
        );
        Ok(())
    }
}
