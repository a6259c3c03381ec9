// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;

use experiment::{EnvMap, Error, Result, StopScope, Task, TaskKind, Tasklist};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use log::{error, info, warn};
use node_execution::{runner_for, CommandRunner, RunPolicy};
use testbed::{auto_removal_allowed, removal_tasklist, Node, Teardown, Testbed};
use tokio::time::{timeout_at, Instant};

/// The literal substituted with the node's name in transfer paths.
const TARGET_VAR: &str = "$GPLMT_TARGET";

///
/// Interprets one tasklist definition against one node: sequential and
/// parallel task trees, tasklist timeouts merged with the caller's stop
/// deadline, the `on-error` policy, and the cleanup tasklist.
///
pub struct TaskRunner {
    testbed: Arc<Testbed>,
    node: Arc<Node>,
    tasklists: Arc<HashMap<String, Arc<Tasklist>>>,
    runner: Box<dyn CommandRunner>,
}

impl TaskRunner {
    pub fn new(
        testbed: Arc<Testbed>,
        node: Arc<Node>,
        tasklists: Arc<HashMap<String, Arc<Tasklist>>>,
    ) -> TaskRunner {
        let runner = runner_for(testbed.clone(), node.clone());
        TaskRunner {
            testbed,
            node,
            tasklists,
            runner,
        }
    }

    pub async fn run_tasklist(
        &self,
        tasklist: &Arc<Tasklist>,
        var_env: &EnvMap,
        deadline: Option<Instant>,
    ) -> Result<()> {
        self.run_tasklist_inner(tasklist, var_env, deadline, true)
            .await
    }

    ///
    /// Cleanup runs (`with_cleanup == false`) get no timeout of their own and
    /// never recurse into their own cleanup.
    ///
    fn run_tasklist_inner<'a>(
        &'a self,
        tasklist: &'a Arc<Tasklist>,
        var_env: &'a EnvMap,
        deadline: Option<Instant>,
        with_cleanup: bool,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            // An enclosing stop time and the tasklist's own timeout compose by
            // taking whichever expires first.
            let effective_deadline = match (deadline, tasklist.timeout) {
                (Some(deadline), Some(timeout)) => Some(deadline.min(Instant::now() + timeout)),
                (Some(deadline), None) => Some(deadline),
                (None, Some(timeout)) => Some(Instant::now() + timeout),
                (None, None) => None,
            };
            info!(
                "running tasklist '{}' on '{}' (deadline: {:?})",
                tasklist.name, self.node.name, effective_deadline
            );

            let body = self.run_tasks(&tasklist.tasks, var_env);
            let outcome = match effective_deadline {
                Some(at) => match timeout_at(at, body).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(
                            "tasklist '{}' on node '{}' timed out",
                            tasklist.name, self.node.name
                        );
                        Ok(())
                    }
                },
                None => body.await,
            };

            let result = match outcome {
                Ok(()) => Ok(()),
                Err(Error::Stop(scope)) => {
                    if scope == StopScope::StopExperiment {
                        // Propagates all the way to the driver; cleanup of
                        // intermediate frames is the teardowns' job.
                        return Err(Error::Stop(scope));
                    }
                    Ok(())
                }
                Err(Error::Execution(msg)) => {
                    error!(
                        "tasklist execution ({} on {}) failed ({msg})",
                        tasklist.name, self.node.name
                    );
                    Err(Error::Stop(tasklist.on_error))
                }
                Err(other) => return Err(other),
            };

            if with_cleanup {
                self.run_cleanup(tasklist, var_env).await?;
            }
            result
        }
        .boxed()
    }

    ///
    /// The cleanup tasklist's own failures and stops are logged, never
    /// masking the originating outcome. A dangling cleanup name is the one
    /// error that does escape.
    ///
    async fn run_cleanup(&self, tasklist: &Tasklist, var_env: &EnvMap) -> Result<()> {
        let Some(name) = &tasklist.cleanup else {
            return Ok(());
        };
        let cleanup = self
            .tasklists
            .get(name)
            .ok_or_else(|| Error::syntax(format!("cleanup tasklist '{name}' not found")))?;
        match self
            .run_tasklist_inner(cleanup, var_env, None, false)
            .await
        {
            Ok(()) => Ok(()),
            Err(Error::Stop(scope)) => {
                warn!(
                    "cleanup tasklist '{name}' on node '{}' stopped ({})",
                    self.node.name,
                    scope.as_ref()
                );
                Ok(())
            }
            Err(Error::Execution(msg)) => {
                warn!(
                    "cleanup tasklist '{name}' on node '{}' failed ({msg})",
                    self.node.name
                );
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    async fn run_tasks(&self, tasks: &[Task], var_env: &EnvMap) -> Result<()> {
        for task in tasks {
            self.run_task(task, var_env).await?;
        }
        Ok(())
    }

    fn run_task<'a>(&'a self, task: &'a Task, var_env: &'a EnvMap) -> BoxFuture<'a, Result<()>> {
        async move {
            if !task.enabled {
                info!("skipping disabled task on '{}'", self.node.name);
                return Ok(());
            }
            match &task.kind {
                TaskKind::Run {
                    name,
                    command,
                    expected_status,
                } => {
                    let policy = RunPolicy::new(name.clone(), command.clone(), *expected_status);
                    let logs = self.testbed.open_run_logs(&self.node.name, name)?;
                    self.runner.execute(&policy, logs, var_env).await
                }
                TaskKind::Get {
                    source,
                    destination,
                } => {
                    let source = source.replace(TARGET_VAR, &self.node.name);
                    let destination = destination.replace(TARGET_VAR, &self.node.name);
                    self.runner.get(&source, &destination).await
                }
                TaskKind::Put {
                    source,
                    destination,
                    keep,
                } => {
                    let source = source.replace(TARGET_VAR, &self.node.name);
                    let destination = destination.replace(TARGET_VAR, &self.node.name);
                    if !keep {
                        // Registered before the transfer starts, so the file
                        // is removed even if the copy itself fails partway.
                        if auto_removal_allowed(&destination) {
                            self.testbed.register_teardown(Teardown {
                                targets: self.node.name.clone(),
                                tasklist: Arc::new(removal_tasklist(&destination)),
                                env: EnvMap::new(),
                            });
                        } else {
                            warn!(
                                "no automated removal, invalid characters in destination: {destination}"
                            );
                        }
                    }
                    self.runner.put(&source, &destination).await
                }
                TaskKind::Sequence(tasks) => self.run_tasks(tasks, var_env).await,
                TaskKind::Parallel(tasks) => {
                    // All siblings start before any is awaited; the first
                    // failure surfaces only after every sibling finished.
                    let results =
                        join_all(tasks.iter().map(|task| self.run_task(task, var_env))).await;
                    results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
                }
                TaskKind::Call { tasklist } => {
                    let definition = self.tasklists.get(tasklist).ok_or_else(|| {
                        Error::syntax(format!("tasklist '{tasklist}' not defined"))
                    })?;
                    self.run_tasklist_inner(definition, var_env, None, true)
                        .await
                }
                TaskKind::Fail => Err(Error::execution("user-requested fail")),
            }
        }
        .boxed()
    }
}
