// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};

use crate::error::StopScope;

/// Variable environment passed down to commands. A BTreeMap keeps `env K=V …`
/// wrappers and test assertions deterministic.
pub type EnvMap = BTreeMap<String, String>;

///
/// A parsed, include-merged, name-normalized experiment description.
///
#[derive(Clone, Debug)]
pub struct Experiment {
    pub targets: Vec<TargetDecl>,
    pub tasklists: HashMap<String, Arc<Tasklist>>,
    pub steps: Vec<Step>,
}

///
/// One `target` declaration. Group members may be references to other
/// declarations or inline declarations of their own.
///
#[derive(Clone, Debug)]
pub struct TargetDecl {
    pub name: String,
    pub kind: TargetKind,
}

#[derive(Clone, Debug)]
pub enum TargetKind {
    Local {
        env: EnvMap,
    },
    Ssh(SshConfig),
    Group {
        members: Vec<GroupMember>,
    },
    PlanetLab {
        api_url: String,
        slice: String,
        user: String,
        password: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub enum GroupMember {
    Ref(String),
    Decl(TargetDecl),
}

#[derive(Clone, Debug)]
pub struct SshConfig {
    pub host: String,
    pub user: String,
    pub port: u16,
    /// Extra argv fragments spliced into every ssh/scp invocation.
    pub extra_args: Vec<String>,
    pub env: EnvMap,
}

///
/// A named, reusable tree of tasks. Definitions are immutable and shared
/// (behind `Arc`) between concurrent runs on different nodes.
///
#[derive(Clone, Debug)]
pub struct Tasklist {
    pub name: String,
    pub on_error: StopScope,
    pub timeout: Option<Duration>,
    /// Name of another tasklist to run after this one completes or fails.
    pub cleanup: Option<String>,
    pub tasks: Vec<Task>,
}

#[derive(Clone, Debug)]
pub struct Task {
    pub enabled: bool,
    pub kind: TaskKind,
}

#[derive(Clone, Debug)]
pub enum TaskKind {
    Run {
        /// Always present after name normalization.
        name: String,
        command: String,
        expected_status: Option<i32>,
    },
    Get {
        source: String,
        destination: String,
    },
    Put {
        source: String,
        destination: String,
        keep: bool,
    },
    Sequence(Vec<Task>),
    Parallel(Vec<Task>),
    Call {
        tasklist: String,
    },
    Fail,
}

///
/// One item of the experiment's top-level (or loop-body) execution sequence.
///
#[derive(Clone, Debug)]
pub enum Step {
    Step(StepSpec),
    Synchronize { targets: Option<String> },
    RegisterTeardown(TeardownSpec),
    Loop(LoopSpec),
}

#[derive(Clone, Debug)]
pub struct StepSpec {
    pub targets: String,
    pub tasklist: String,
    pub background: bool,
    pub start: Option<TimeSpec>,
    pub stop: Option<TimeSpec>,
    pub env: EnvMap,
}

#[derive(Clone, Debug)]
pub struct TeardownSpec {
    pub targets: String,
    pub tasklist: String,
    pub env: EnvMap,
}

/// A point in time given either as an offset from scheduling or as a wall
/// clock timestamp.
#[derive(Clone, Debug)]
pub enum TimeSpec {
    Relative(Duration),
    Absolute(DateTime<Local>),
}

#[derive(Clone, Debug)]
pub struct LoopSpec {
    pub mode: LoopMode,
    pub body: Vec<Step>,
}

#[derive(Clone, Debug)]
pub enum LoopMode {
    Repeat(u64),
    Duration(Duration),
    Until(DateTime<Local>),
    List { items: Vec<String>, param: String },
}
