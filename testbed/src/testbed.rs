// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use async_throttle::{AsyncThrottle, Permit};
use experiment::{
    EnvMap, Error, Result, StopScope, TargetDecl, Task, TaskKind, Tasklist,
};
use parking_lot::Mutex;
use regex::Regex;

use crate::nodes::Node;
use crate::planetlab::SliceDirectory;
use crate::registry::TargetRegistry;

/// Destinations eligible for automatic post-experiment removal: simple file
/// names only, so a synthesized `rm` can never walk out of the remote home
/// directory.
static AUTO_REMOVAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[.A-Za-z][-.A-Za-z0-9]*$").unwrap());

#[derive(Clone, Debug)]
pub struct Settings {
    pub batch: bool,
    pub logroot_dir: Option<PathBuf>,
    /// Minimum spacing between SSH handshakes; `None` disables the cooldown.
    pub ssh_cooldown: Option<Duration>,
    /// Maximum concurrent SSH handshakes.
    pub ssh_parallelism: usize,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            batch: false,
            logroot_dir: None,
            ssh_cooldown: Some(Duration::from_secs(1)),
            ssh_parallelism: 30,
        }
    }
}

///
/// A teardown obligation: run `tasklist` against `targets` with the captured
/// environment once the execution loop is over, regardless of how it ended.
///
#[derive(Clone, Debug)]
pub struct Teardown {
    pub targets: String,
    pub tasklist: Arc<Tasklist>,
    pub env: EnvMap,
}

///
/// Process-wide testbed state: the resolved node registry, the SSH admission
/// throttle, the teardown registry, and the run counter behind log-file
/// numbering. One `Testbed` exists per experiment, shared by every task.
///
pub struct Testbed {
    pub settings: Settings,
    registry: TargetRegistry,
    ssh_throttle: AsyncThrottle,
    teardowns: Mutex<Vec<Teardown>>,
    run_counter: AtomicU64,
}

impl Testbed {
    pub async fn new(
        declarations: &[TargetDecl],
        settings: Settings,
        directory: &dyn SliceDirectory,
    ) -> Result<Testbed> {
        let registry = TargetRegistry::build(declarations, directory, settings.batch).await?;
        let ssh_throttle = AsyncThrottle::new(settings.ssh_parallelism, settings.ssh_cooldown);
        Ok(Testbed {
            settings,
            registry,
            ssh_throttle,
            teardowns: Mutex::new(Vec::new()),
            run_counter: AtomicU64::new(0),
        })
    }

    pub fn resolve(&self, expression: &str) -> Result<Vec<Arc<Node>>> {
        self.registry.resolve(expression)
    }

    ///
    /// Wait for an SSH admission slot; see `AsyncThrottle` for the
    /// parallelism and cooldown contract.
    ///
    pub async fn ssh_acquire(&self) -> Permit {
        self.ssh_throttle.acquire().await
    }

    pub fn register_teardown(&self, teardown: Teardown) {
        log::info!(
            "registering teardown for '{}' on '{}'",
            teardown.tasklist.name,
            teardown.targets
        );
        self.teardowns.lock().push(teardown);
    }

    /// Take the registered teardowns, in registration order.
    pub fn take_teardowns(&self) -> Vec<Teardown> {
        std::mem::take(&mut self.teardowns.lock())
    }

    ///
    /// Open the stdout/stderr files for one `run`, bumping the run counter.
    /// Returns `None` when no log root is configured (child output then goes
    /// to the controller's own streams).
    ///
    pub fn open_run_logs(&self, node: &str, task: &str) -> Result<Option<RunLogs>> {
        let Some(logroot) = &self.settings.logroot_dir else {
            return Ok(None);
        };
        let run = self.run_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let dir = logroot.join(node);
        fs::create_dir_all(&dir)
            .map_err(|e| Error::execution(format!("could not create log dir {dir:?}: {e}")))?;
        let stdout_path = dir.join(format!("{task}.{run}.out"));
        let stderr_path = dir.join(format!("{task}.{run}.err"));
        let stdout = File::create(&stdout_path)
            .map_err(|e| Error::execution(format!("could not open {stdout_path:?}: {e}")))?;
        let stderr = File::create(&stderr_path)
            .map_err(|e| Error::execution(format!("could not open {stderr_path:?}: {e}")))?;
        Ok(Some(RunLogs { stdout, stderr }))
    }
}

/// Open stream files for a single run of a `run` task.
pub struct RunLogs {
    pub stdout: File,
    pub stderr: File,
}

///
/// Whether a `put` destination qualifies for automatic removal at teardown.
///
pub fn auto_removal_allowed(destination: &str) -> bool {
    AUTO_REMOVAL_RE.is_match(destination)
}

///
/// The synthesized tasklist that removes an uploaded file during teardown.
/// `destination` must have passed `auto_removal_allowed`, which is what makes
/// the unquoted interpolation safe.
///
pub fn removal_tasklist(destination: &str) -> Tasklist {
    Tasklist {
        name: format!("_rm_{destination}"),
        on_error: StopScope::StopTasklist,
        timeout: None,
        cleanup: None,
        tasks: vec![Task {
            enabled: true,
            kind: TaskKind::Run {
                name: format!("rm-{destination}"),
                command: format!("rm {destination}"),
                expected_status: None,
            },
        }],
    }
}
