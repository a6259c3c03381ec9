// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::warn;

use crate::error::{Error, Result};
use crate::model::{Experiment, Step, TargetDecl, Tasklist};
use crate::parse::{parse_document, AnonNamer, ParsedDocument};
use crate::reader::parse_element_tree;

///
/// Read an experiment description from disk: parse, normalize run-task names,
/// recursively merge includes, and reject duplicate tasklist names.
///
pub fn load_experiment(path: &Path) -> Result<Experiment> {
    let mut namer = AnonNamer::new();
    let root_path = canonical(path)?;
    let doc = load_file(&root_path, &mut namer, &[])?;

    let mut tasklists: HashMap<String, Arc<Tasklist>> = HashMap::new();
    for tasklist in doc.tasklists {
        let name = tasklist.name.clone();
        if tasklists.insert(name.clone(), Arc::new(tasklist)).is_some() {
            return Err(Error::syntax(format!("duplicate tasklist '{name}'")));
        }
    }

    if !doc.has_steps_element {
        warn!("element 'steps' missing; did you try to execute an extension library?");
    }

    Ok(Experiment {
        targets: doc.targets,
        tasklists,
        steps: doc.steps,
    })
}

struct MergedDocument {
    targets: Vec<TargetDecl>,
    tasklists: Vec<Tasklist>,
    steps: Vec<Step>,
    has_steps_element: bool,
}

fn load_file(
    path: &Path,
    namer: &mut AnonNamer,
    ancestors: &[PathBuf],
) -> Result<MergedDocument> {
    let file = File::open(path)
        .map_err(|e| Error::setup(format!("could not read experiment file {path:?}: {e}")))?;
    let root = parse_element_tree(file)?;
    let doc: ParsedDocument = parse_document(&root, namer)?;

    let mut merged = MergedDocument {
        targets: doc.targets,
        tasklists: doc.tasklists,
        steps: doc.steps,
        has_steps_element: doc.has_steps_element,
    };

    let mut chain: Vec<PathBuf> = ancestors.to_vec();
    chain.push(path.to_path_buf());

    for include in doc.includes {
        let expanded = shellexpand::env(&include.file)
            .map_err(|e| Error::syntax(format!("bad include path '{}': {e}", include.file)))?;
        let mut included_path = PathBuf::from(expanded.as_ref());
        if included_path.is_relative() {
            let parent = path.parent().unwrap_or_else(|| Path::new("."));
            included_path = parent.join(included_path);
        }
        let included_path = canonical(&included_path)?;
        if chain.contains(&included_path) {
            return Err(Error::syntax(format!(
                "recursive include detected at {included_path:?}"
            )));
        }

        let included = load_file(&included_path, namer, &chain)?;
        if included.has_steps_element {
            warn!(
                "included experiment {included_path:?} has 'steps': these steps will not be executed"
            );
        }

        let prefixed = |name: &str| match &include.prefix {
            Some(prefix) => format!("{prefix}.{name}"),
            None => name.to_owned(),
        };
        merged.targets.extend(included.targets.into_iter().map(|mut target| {
            target.name = prefixed(&target.name);
            target
        }));
        merged
            .tasklists
            .extend(included.tasklists.into_iter().map(|mut tasklist| {
                tasklist.name = prefixed(&tasklist.name);
                tasklist
            }));
    }

    Ok(merged)
}

fn canonical(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .map_err(|e| Error::setup(format!("could not read experiment file {path:?}: {e}")))
}
