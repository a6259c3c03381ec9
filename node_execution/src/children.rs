// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

use experiment::{Error, Result};
use log::info;
use nix::sys::signal;
use nix::unistd::{getpgid, Pid};
use tokio::process::{Child, Command};

///
/// How a child is torn down when its logical task is cancelled: commands that
/// run user shell lines get their own session so the whole process group can
/// be signalled; ssh/scp clients are signalled individually, which closes
/// their channel while leaving the shared control master alive.
///
#[derive(Clone, Copy, Debug)]
pub enum KillScope {
    ProcessGroup,
    Process,
}

///
/// A spawned subprocess whose `Drop` sends SIGTERM if the process has not
/// been waited to completion. Cancellation of the owning future is therefore
/// enough to tear the subprocess down; reaping is left to the runtime.
///
pub struct ManagedChild {
    child: Child,
    kill_scope: KillScope,
    completed: bool,
}

impl ManagedChild {
    pub fn spawn(command: &mut Command, kill_scope: KillScope) -> Result<ManagedChild> {
        if let KillScope::ProcessGroup = kill_scope {
            // A fresh session makes it safe to signal the child's PGID later.
            unsafe {
                command.pre_exec(|| {
                    nix::unistd::setsid().map(|_pgid| ()).map_err(|e| {
                        std::io::Error::new(
                            std::io::ErrorKind::Other,
                            format!("could not create new session: {e}"),
                        )
                    })
                });
            }
        }
        let child = command
            .spawn()
            .map_err(|e| Error::execution(format!("error launching process: {e}")))?;
        Ok(ManagedChild {
            child,
            kill_scope,
            completed: false,
        })
    }

    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| Error::execution(format!("error waiting for process: {e}")))?;
        self.completed = true;
        Ok(status)
    }

    fn terminate(&self) -> std::result::Result<(), String> {
        let pid = self.child.id().ok_or("process had no PID")? as i32;
        let target = match self.kill_scope {
            KillScope::ProcessGroup => {
                let pgid = getpgid(Some(Pid::from_raw(pid)))
                    .map_err(|e| format!("could not get process group: {e}"))?;
                // The negative PGID signals the entire process group.
                Pid::from_raw(-pgid.as_raw())
            }
            KillScope::Process => Pid::from_raw(pid),
        };
        signal::kill(target, signal::Signal::SIGTERM)
            .map_err(|e| format!("could not signal process: {e}"))
    }
}

impl Drop for ManagedChild {
    fn drop(&mut self) {
        if !self.completed {
            info!("terminating subprocess {:?}", self.child.id());
            if let Err(e) = self.terminate() {
                log::warn!("failed to terminate subprocess: {e}");
            }
        }
    }
}

/// Exit code of a finished process, mapping death-by-signal to the negated
/// signal number.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .expect("child process exits via code or signal")
}
