// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Command and transfer execution against a single node: local subprocesses
//! in their own session, or the OpenSSH client multiplexed over a persistent
//! control master, with SIGTERM-based teardown on cancellation.

use std::sync::Arc;

use async_trait::async_trait;
use experiment::{EnvMap, Result};
use testbed::{Node, NodeKind, RunLogs, Testbed};

mod children;
mod local;
mod policy;
mod ssh;

pub use crate::children::{exit_code, KillScope, ManagedChild};
pub use crate::local::LocalRunner;
pub use crate::policy::RunPolicy;
pub use crate::ssh::SshRunner;

///
/// Executes work against one node. One runner exists per (tasklist run,
/// node); all shared state lives on the `Testbed`.
///
#[async_trait]
pub trait CommandRunner: Send + Sync {
    ///
    /// Run a shell command. Streams go to `logs` when given, otherwise to the
    /// controller's own stdio. The policy's status check decides success.
    ///
    async fn execute(
        &self,
        policy: &RunPolicy,
        logs: Option<RunLogs>,
        var_env: &EnvMap,
    ) -> Result<()>;

    /// Copy a local file to the node.
    async fn put(&self, source: &str, destination: &str) -> Result<()>;

    /// Copy a file from the node to the controller.
    async fn get(&self, source: &str, destination: &str) -> Result<()>;
}

pub fn runner_for(testbed: Arc<Testbed>, node: Arc<Node>) -> Box<dyn CommandRunner> {
    match &node.kind {
        NodeKind::Local => Box::new(LocalRunner::new(testbed, node.clone())),
        NodeKind::Ssh(endpoint) => {
            let endpoint = endpoint.clone();
            Box::new(SshRunner::new(testbed, node.clone(), endpoint))
        }
    }
}
