// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use experiment::{Error, Result};

///
/// What to run and how to judge the outcome of one `run` task. Derived from
/// the task definition; also constructed internally for housekeeping commands
/// that must succeed.
///
#[derive(Clone, Debug)]
pub struct RunPolicy {
    pub task_name: String,
    pub command: String,
    /// `None` means any exit status is acceptable.
    pub expected_status: Option<i32>,
}

impl RunPolicy {
    pub fn new(task_name: String, command: String, expected_status: Option<i32>) -> RunPolicy {
        RunPolicy {
            task_name,
            command,
            expected_status,
        }
    }

    /// An internal command that must exit 0.
    pub fn expect_success(command: String) -> RunPolicy {
        RunPolicy {
            task_name: "_internal".to_owned(),
            command,
            expected_status: Some(0),
        }
    }

    pub fn check_status(&self, status: i32) -> Result<()> {
        match self.expected_status {
            None => Ok(()),
            Some(expected) if expected == status => Ok(()),
            Some(expected) => Err(Error::execution(format!(
                "task '{}' exited with status {status}, expected {expected}",
                self.task_name
            ))),
        }
    }
}
