// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use experiment::{EnvMap, Error, GroupMember, Result, SshConfig, TargetDecl, TargetKind};
use futures::future::BoxFuture;
use futures::FutureExt;
use log::info;

use crate::nodes::Node;
use crate::planetlab::{SliceCredentials, SliceDirectory};

///
/// Maps target and group names to runtime nodes, and resolves target
/// expressions (whitespace-separated node or group names) into ordered,
/// first-seen-deduplicated node lists.
///
#[derive(Debug)]
pub struct TargetRegistry {
    nodes: HashMap<String, Arc<Node>>,
    groups: HashMap<String, Vec<String>>,
}

impl TargetRegistry {
    ///
    /// Process the experiment's target declarations. PlanetLab slices are
    /// expanded eagerly: one synthetic SSH node per hostname the directory
    /// reports, grouped under the declaration's name.
    ///
    pub async fn build(
        declarations: &[TargetDecl],
        directory: &dyn SliceDirectory,
        batch: bool,
    ) -> Result<TargetRegistry> {
        let mut registry = TargetRegistry {
            nodes: HashMap::new(),
            groups: HashMap::new(),
        };
        for declaration in declarations {
            registry.declare(declaration, directory, batch).await?;
        }
        Ok(registry)
    }

    fn declare<'a>(
        &'a mut self,
        declaration: &'a TargetDecl,
        directory: &'a dyn SliceDirectory,
        batch: bool,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            match &declaration.kind {
                TargetKind::Local { env } => {
                    self.declare_node(Node::local(declaration.name.clone(), env.clone()))
                }
                TargetKind::Ssh(config) => {
                    self.declare_node(Node::ssh(declaration.name.clone(), config.clone()))
                }
                TargetKind::Group { members } => {
                    let mut member_names = Vec::new();
                    for member in members {
                        match member {
                            GroupMember::Ref(name) => member_names.push(name.clone()),
                            GroupMember::Decl(decl) => {
                                member_names.push(decl.name.clone());
                                self.declare(decl, directory, batch).await?;
                            }
                        }
                    }
                    self.declare_group(declaration.name.clone(), member_names)
                }
                TargetKind::PlanetLab {
                    api_url,
                    slice,
                    user,
                    password,
                } => {
                    let credentials =
                        SliceCredentials::obtain(user.clone(), password.clone(), batch)?;
                    info!("looking up slice '{slice}' via {api_url}");
                    let hostnames = directory
                        .slice_hostnames(api_url, slice, &credentials)
                        .await?;
                    info!("slice '{slice}' has {} nodes", hostnames.len());

                    let mut member_names = Vec::new();
                    for (index, hostname) in hostnames.into_iter().enumerate() {
                        let name = format!("_pl_{slice}.{index}");
                        self.declare_node(Node::ssh(
                            name.clone(),
                            SshConfig {
                                host: hostname,
                                user: slice.clone(),
                                port: 22,
                                extra_args: Vec::new(),
                                env: EnvMap::new(),
                            },
                        ))?;
                        member_names.push(name);
                    }
                    self.declare_group(declaration.name.clone(), member_names)
                }
            }
        }
        .boxed()
    }

    fn declare_node(&mut self, node: Node) -> Result<()> {
        let name = node.name.clone();
        if self.groups.contains_key(&name) || self.nodes.insert(name.clone(), Arc::new(node)).is_some()
        {
            return Err(Error::syntax(format!("duplicate target '{name}'")));
        }
        Ok(())
    }

    fn declare_group(&mut self, name: String, members: Vec<String>) -> Result<()> {
        if self.nodes.contains_key(&name) || self.groups.insert(name.clone(), members).is_some() {
            return Err(Error::syntax(format!("duplicate target '{name}'")));
        }
        Ok(())
    }

    ///
    /// Resolve a target expression to nodes. Groups flatten depth-first in
    /// declaration order; a node reached twice is kept at its first position;
    /// unknown names and cyclic group membership are hard errors.
    ///
    pub fn resolve(&self, expression: &str) -> Result<Vec<Arc<Node>>> {
        let mut resolved = Vec::new();
        let mut seen = HashSet::new();
        let mut expanding = Vec::new();
        for token in expression.split_whitespace() {
            self.resolve_name(token, &mut resolved, &mut seen, &mut expanding)?;
        }
        Ok(resolved)
    }

    fn resolve_name(
        &self,
        name: &str,
        resolved: &mut Vec<Arc<Node>>,
        seen: &mut HashSet<String>,
        expanding: &mut Vec<String>,
    ) -> Result<()> {
        if let Some(node) = self.nodes.get(name) {
            if seen.insert(name.to_owned()) {
                resolved.push(node.clone());
            }
            return Ok(());
        }
        let members = self
            .groups
            .get(name)
            .ok_or_else(|| Error::syntax(format!("unknown target '{name}'")))?;
        if expanding.iter().any(|expanded| expanded == name) {
            return Err(Error::syntax(format!("cyclic group '{name}'")));
        }
        expanding.push(name.to_owned());
        for member in members {
            self.resolve_name(member, resolved, seen, expanding)?;
        }
        expanding.pop();
        Ok(())
    }
}
