// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::PathBuf;

use experiment::{EnvMap, Error, Result, SshConfig};

///
/// A uniquely-named execution endpoint, created once during testbed
/// construction and shared (behind `Arc`) by every task that targets it.
///
#[derive(Clone, Debug)]
pub struct Node {
    pub name: String,
    /// Environment captured from the node's `export-env` declarations.
    pub env: EnvMap,
    pub kind: NodeKind,
}

#[derive(Clone, Debug)]
pub enum NodeKind {
    Local,
    Ssh(SshEndpoint),
}

#[derive(Clone, Debug)]
pub struct SshEndpoint {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub extra_args: Vec<String>,
}

impl Node {
    pub fn local(name: String, env: EnvMap) -> Node {
        Node {
            name,
            env,
            kind: NodeKind::Local,
        }
    }

    pub fn ssh(name: String, config: SshConfig) -> Node {
        Node {
            name,
            env: config.env,
            kind: NodeKind::Ssh(SshEndpoint {
                host: config.host,
                user: config.user,
                port: config.port,
                extra_args: config.extra_args,
            }),
        }
    }
}

impl SshEndpoint {
    /// The `user@host` string handed to ssh and scp.
    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    ///
    /// Path of the control socket for the persistent master connection to
    /// this endpoint. Keyed on (host, user, port) so nodes that share an
    /// endpoint share a master.
    ///
    pub fn control_path(&self) -> Result<PathBuf> {
        let home = dirs_next::home_dir()
            .ok_or_else(|| Error::execution("could not determine the home directory"))?;
        Ok(home
            .join(".ssh")
            .join(format!("gplmt-{}@{}:{}", self.host, self.user, self.port)))
    }
}
