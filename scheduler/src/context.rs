// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use experiment::{
    EnvMap, Error, LoopMode, LoopSpec, Result, Step, StepSpec, StopScope, Tasklist, TimeSpec,
};
use futures::future::{select_all, BoxFuture};
use futures::FutureExt;
use log::{info, warn};
use testbed::{Teardown, Testbed};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

use crate::task_runner::TaskRunner;

///
/// A task in flight, with the metadata `join` filters on. The metadata lives
/// here, on an owned handle, rather than being attached to the future itself.
///
struct TaskHandle {
    background: bool,
    /// Node names this task runs against; empty for loop tasks.
    nodes: Vec<String>,
    handle: JoinHandle<Result<()>>,
}

///
/// The scope a wave of concurrent tasks runs in: the in-flight set plus the
/// variable environment inherited from the enclosing loop. Loops run their
/// bodies in a nested context of their own.
///
pub struct ExecutionContext {
    testbed: Arc<Testbed>,
    tasklists: Arc<HashMap<String, Arc<Tasklist>>>,
    tasks: Vec<TaskHandle>,
    /// Cloned-with-overrides at each loop iteration, never shared mutably.
    var: EnvMap,
}

impl ExecutionContext {
    pub fn new(
        testbed: Arc<Testbed>,
        tasklists: Arc<HashMap<String, Arc<Tasklist>>>,
    ) -> ExecutionContext {
        ExecutionContext {
            testbed,
            tasklists,
            tasks: Vec::new(),
            var: EnvMap::new(),
        }
    }

    fn nested(&self, var: EnvMap) -> ExecutionContext {
        ExecutionContext {
            testbed: self.testbed.clone(),
            tasklists: self.tasklists.clone(),
            tasks: Vec::new(),
            var,
        }
    }

    ///
    /// Dispatch one step. Scheduling steps return as soon as their tasks are
    /// spawned; only `synchronize` (and loop iterations, internally) block.
    ///
    pub fn run_step<'a>(&'a mut self, step: &'a Step) -> BoxFuture<'a, Result<()>> {
        async move {
            match step {
                Step::Step(spec) => self.run_tasklist_step(spec),
                Step::Synchronize { targets } => {
                    let targets = match targets {
                        Some(expression) => Some(
                            self.testbed
                                .resolve(expression)?
                                .iter()
                                .map(|node| node.name.clone())
                                .collect::<HashSet<String>>(),
                        ),
                        None => None,
                    };
                    self.join(targets.as_ref()).await
                }
                Step::RegisterTeardown(spec) => {
                    let tasklist = self.lookup_tasklist(&spec.tasklist)?;
                    let mut env = self.var.clone();
                    env.extend(spec.env.iter().map(|(k, v)| (k.clone(), v.clone())));
                    self.testbed.register_teardown(Teardown {
                        targets: spec.targets.clone(),
                        tasklist,
                        env,
                    });
                    Ok(())
                }
                Step::Loop(spec) => {
                    let handle = tokio::spawn(run_loop(self.nested(self.var.clone()), spec.clone()));
                    self.tasks.push(TaskHandle {
                        background: false,
                        nodes: Vec::new(),
                        handle,
                    });
                    Ok(())
                }
            }
        }
        .boxed()
    }

    fn run_tasklist_step(&mut self, spec: &StepSpec) -> Result<()> {
        let tasklist = self.lookup_tasklist(&spec.tasklist)?;
        let delay = delay_from(spec.start.as_ref());
        let stop_time = deadline_from(spec.stop.as_ref());
        info!(
            "scheduling tasklist '{}' on '{}' (delay: {delay:?})",
            spec.tasklist, spec.targets
        );
        let mut env = self.var.clone();
        env.extend(spec.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.schedule_tasklist(
            &spec.targets,
            tasklist,
            env,
            spec.background,
            delay,
            stop_time,
        )
    }

    ///
    /// Spawn one TaskRunner per resolved node, with an optional start delay
    /// and a stop deadline handed down as the runner's outer deadline.
    ///
    pub fn schedule_tasklist(
        &mut self,
        targets: &str,
        tasklist: Arc<Tasklist>,
        var_env: EnvMap,
        background: bool,
        delay: Option<Duration>,
        stop_time: Option<Instant>,
    ) -> Result<()> {
        for node in self.testbed.resolve(targets)? {
            let testbed = self.testbed.clone();
            let tasklists = self.tasklists.clone();
            let tasklist = tasklist.clone();
            let var_env = var_env.clone();
            let node_name = node.name.clone();
            let handle = tokio::spawn(async move {
                if let Some(delay) = delay {
                    sleep(delay).await;
                }
                TaskRunner::new(testbed, node, tasklists)
                    .run_tasklist(&tasklist, &var_env, stop_time)
                    .await
            });
            self.tasks.push(TaskHandle {
                background,
                nodes: vec![node_name],
                handle,
            });
        }
        Ok(())
    }

    fn lookup_tasklist(&self, name: &str) -> Result<Arc<Tasklist>> {
        self.tasklists
            .get(name)
            .cloned()
            .ok_or_else(|| Error::syntax(format!("tasklist '{name}' not found")))
    }

    ///
    /// Wait for in-flight tasks, re-surfacing their failures here. Returns
    /// once the set is empty, or no remaining task touches `targets` (when
    /// given), or only background tasks remain. A stop of tasklist or step
    /// scope ends with the completed task; experiment scope propagates.
    ///
    pub async fn join(&mut self, targets: Option<&HashSet<String>>) -> Result<()> {
        if self.tasks.is_empty() {
            info!("synchronized nodes (no tasks)");
            return Ok(());
        }
        loop {
            if self.tasks.is_empty() {
                break;
            }
            if let Some(targets) = targets {
                let intersects = self
                    .tasks
                    .iter()
                    .any(|task| task.nodes.iter().any(|node| targets.contains(node)));
                if !intersects {
                    break;
                }
            }
            if self.tasks.iter().all(|task| task.background) {
                break;
            }

            let (result, index, _) =
                select_all(self.tasks.iter_mut().map(|task| &mut task.handle)).await;
            self.tasks.remove(index);
            info!("1 task done, {} tasks pending", self.tasks.len());

            match result {
                Ok(Ok(())) => (),
                Ok(Err(Error::Stop(scope))) => match scope {
                    StopScope::StopTasklist | StopScope::StopStep => {
                        info!("stopped execution ({})", scope.as_ref());
                    }
                    StopScope::StopExperiment => {
                        info!("stopping experiment");
                        return Err(Error::Stop(scope));
                    }
                },
                Ok(Err(other)) => return Err(other),
                Err(join_error) if join_error.is_cancelled() => (),
                Err(join_error) => {
                    return Err(Error::execution(format!("task panicked: {join_error}")));
                }
            }
        }
        info!("synchronized nodes");
        Ok(())
    }

    /// Cancel everything still in flight and wait the cancellations out.
    pub async fn cancel_pending(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        warn!("cancelling {} pending task(s)", self.tasks.len());
        for task in &self.tasks {
            task.handle.abort();
        }
        for task in self.tasks.drain(..) {
            let _ = task.handle.await;
        }
    }
}

///
/// Run a loop's body to completion in its nested context. Whatever is still
/// in flight when the loop ends (only background tasks can be) is bounded by
/// the loop: it is cancelled rather than leaked.
///
async fn run_loop(mut nested: ExecutionContext, spec: LoopSpec) -> Result<()> {
    let var = nested.var.clone();
    let result = run_loop_iterations(&mut nested, &spec, &var).await;
    nested.cancel_pending().await;
    result
}

async fn run_loop_iterations(
    nested: &mut ExecutionContext,
    spec: &LoopSpec,
    var: &EnvMap,
) -> Result<()> {
    match &spec.mode {
        LoopMode::Repeat(count) => {
            for _ in 0..*count {
                run_loop_body(nested, &spec.body).await?;
            }
        }
        LoopMode::Duration(duration) => {
            // The first iteration always runs; the deadline is checked after
            // each pass, so a zero duration means exactly one iteration.
            let deadline = Instant::now() + *duration;
            loop {
                run_loop_body(nested, &spec.body).await?;
                if Instant::now() >= deadline {
                    break;
                }
            }
        }
        LoopMode::Until(timestamp) => {
            while Local::now() < *timestamp {
                run_loop_body(nested, &spec.body).await?;
            }
        }
        LoopMode::List { items, param } => {
            for item in items {
                let mut env = var.clone();
                env.insert(param.clone(), item.clone());
                nested.var = env;
                run_loop_body(nested, &spec.body).await?;
            }
        }
    }
    Ok(())
}

async fn run_loop_body(nested: &mut ExecutionContext, body: &[Step]) -> Result<()> {
    for step in body {
        nested.run_step(step).await?;
    }
    nested.join(None).await
}

fn delay_from(spec: Option<&TimeSpec>) -> Option<Duration> {
    match spec {
        None => None,
        Some(TimeSpec::Relative(duration)) => Some(*duration),
        // A start time in the past means an immediate start.
        Some(TimeSpec::Absolute(timestamp)) => Some(
            (*timestamp - Local::now())
                .to_std()
                .unwrap_or(Duration::ZERO),
        ),
    }
}

fn deadline_from(spec: Option<&TimeSpec>) -> Option<Instant> {
    delay_from(spec).map(|offset| Instant::now() + offset)
}
