// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use strum_macros::{AsRefStr, EnumString};

///
/// How far a tasklist failure propagates, as selected by the tasklist's
/// `on-error` attribute.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq, AsRefStr, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum StopScope {
    StopTasklist,
    StopStep,
    StopExperiment,
}

///
/// The error taxonomy shared by every crate in the workspace.
///
/// `Stop` is not a failure in itself: it is the control-flow marker produced
/// when an `on-error` policy fires, and is matched on scope by whichever
/// join/driver frame is responsible for that scope.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// Ill-formed experiment: unknown element, dangling reference, cyclic
    /// include or group, conflicting loop attributes.
    Syntax(String),
    /// Resource acquisition failed before any step ran: unreadable experiment
    /// file, slice directory lookup failure.
    Setup(String),
    /// A task failed at run time: unexpected exit status, transfer failure,
    /// explicit `fail` element.
    Execution(String),
    /// A tasklist's `on-error` policy fired with the given scope.
    Stop(StopScope),
}

impl Error {
    pub fn syntax<S: Into<String>>(msg: S) -> Error {
        Error::Syntax(msg.into())
    }

    pub fn setup<S: Into<String>>(msg: S) -> Error {
        Error::Setup(msg.into())
    }

    pub fn execution<S: Into<String>>(msg: S) -> Error {
        Error::Execution(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Syntax(msg) => write!(f, "syntax error: {msg}"),
            Error::Setup(msg) => write!(f, "setup error: {msg}"),
            Error::Execution(msg) => write!(f, "execution error: {msg}"),
            Error::Stop(scope) => write!(f, "stop requested ({})", scope.as_ref()),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
