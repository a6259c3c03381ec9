// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Runtime testbed state: resolved nodes and groups, the PlanetLab slice
//! directory seam, the SSH admission throttle, the teardown registry, and the
//! per-run log tree.

mod nodes;
mod planetlab;
mod registry;
mod testbed;

pub use crate::nodes::{Node, NodeKind, SshEndpoint};
pub use crate::planetlab::{PlanetLabDirectory, SliceCredentials, SliceDirectory};
pub use crate::registry::TargetRegistry;
pub use crate::testbed::{
    auto_removal_allowed, removal_tasklist, RunLogs, Settings, Teardown, Testbed,
};

#[cfg(test)]
mod testbed_tests;
