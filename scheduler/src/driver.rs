// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;

use experiment::{Error, Experiment, Result, Step, StopScope, Tasklist};
use log::{error, warn};
use testbed::Testbed;

use crate::context::ExecutionContext;

///
/// The top-level execution loop: run the steps through the root context,
/// join, then drain the teardown registry and cancel whatever is left. Step
/// failures are logged, never skipping teardowns; only setup problems abort
/// before any step runs.
///
pub struct Driver {
    testbed: Arc<Testbed>,
    tasklists: Arc<HashMap<String, Arc<Tasklist>>>,
    steps: Vec<Step>,
}

impl Driver {
    pub fn new(testbed: Arc<Testbed>, experiment: &Experiment) -> Driver {
        Driver {
            testbed,
            tasklists: Arc::new(experiment.tasklists.clone()),
            steps: experiment.steps.clone(),
        }
    }

    pub async fn run(&self) {
        let mut root = ExecutionContext::new(self.testbed.clone(), self.tasklists.clone());

        let outcome = {
            let execution = async {
                for step in &self.steps {
                    root.run_step(step).await?;
                }
                root.join(None).await
            };
            tokio::select! {
                outcome = execution => outcome,
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupted; stopping the experiment");
                    Err(Error::Stop(StopScope::StopExperiment))
                }
            }
        };
        match outcome {
            Ok(()) => (),
            Err(Error::Syntax(msg)) => error!("syntax error: {msg}"),
            Err(Error::Stop(scope)) => error!("stop requested ({})", scope.as_ref()),
            Err(other) => error!("{other}"),
        }

        self.run_teardowns(&mut root).await;

        // Whatever is still pending now is background work (or survivors of a
        // stop); it does not outlive the experiment.
        root.cancel_pending().await;
    }

    ///
    /// Teardowns drain in registration order, each as a foreground tasklist
    /// in the root context. One teardown's failure never skips the next.
    ///
    async fn run_teardowns(&self, root: &mut ExecutionContext) {
        for teardown in self.testbed.take_teardowns() {
            let result: Result<()> = async {
                root.schedule_tasklist(
                    &teardown.targets,
                    teardown.tasklist.clone(),
                    teardown.env.clone(),
                    false,
                    None,
                    None,
                )?;
                root.join(None).await
            }
            .await;
            if let Err(e) = result {
                error!(
                    "error during teardown of '{}': {e}",
                    teardown.tasklist.name
                );
            }
        }
    }
}
