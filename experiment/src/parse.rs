// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::str::FromStr;

use log::{error, warn};

use crate::error::{Error, Result, StopScope};
use crate::model::{
    EnvMap, GroupMember, LoopMode, LoopSpec, SshConfig, Step, StepSpec, TargetDecl, TargetKind,
    Task, TaskKind, Tasklist, TeardownSpec, TimeSpec,
};
use crate::reader::Element;
use crate::time::{parse_iso_duration, parse_timestamp};

pub(crate) const DEFAULT_SSH_PORT: u16 = 22;

///
/// Assigns `_anon<N>` names to `run` tasks declared without one, so that every
/// run has a stable log-file name. The counter spans the root document and all
/// of its includes.
///
pub(crate) struct AnonNamer {
    counter: usize,
}

impl AnonNamer {
    pub fn new() -> AnonNamer {
        AnonNamer { counter: 0 }
    }

    fn next(&mut self) -> String {
        let name = format!("_anon{}", self.counter);
        self.counter += 1;
        name
    }
}

/// One document's worth of declarations, before include merging.
#[derive(Debug)]
pub(crate) struct ParsedDocument {
    pub includes: Vec<IncludeDecl>,
    pub targets: Vec<TargetDecl>,
    pub tasklists: Vec<Tasklist>,
    pub steps: Vec<Step>,
    pub has_steps_element: bool,
}

#[derive(Debug)]
pub(crate) struct IncludeDecl {
    pub file: String,
    pub prefix: Option<String>,
}

pub(crate) fn parse_document(root: &Element, namer: &mut AnonNamer) -> Result<ParsedDocument> {
    if root.tag != "experiment" {
        return Err(Error::syntax(format!(
            "root element must be 'experiment', not '{}'",
            root.tag
        )));
    }

    let mut doc = ParsedDocument {
        includes: Vec::new(),
        targets: Vec::new(),
        tasklists: Vec::new(),
        steps: Vec::new(),
        has_steps_element: false,
    };

    for child in &root.children {
        match child.tag.as_str() {
            "include" => {
                let file = child
                    .attr("file")
                    .ok_or_else(|| Error::syntax("attribute 'file' missing in include"))?;
                doc.includes.push(IncludeDecl {
                    file: file.to_owned(),
                    prefix: child.attr("prefix").map(str::to_owned),
                });
            }
            "targets" => {
                for target in &child.children {
                    doc.targets.push(parse_target(target)?);
                }
            }
            "tasklists" => {
                for tasklist in &child.children {
                    match tasklist.attr("name") {
                        Some(_) => doc.tasklists.push(parse_tasklist(tasklist, namer)?),
                        None => warn!("ignoring tasklist without a name"),
                    }
                }
            }
            "steps" => {
                doc.has_steps_element = true;
                for step in &child.children {
                    if let Some(step) = parse_step(step)? {
                        doc.steps.push(step);
                    }
                }
            }
            other => {
                return Err(Error::syntax(format!(
                    "unknown element '{other}' in experiment"
                )));
            }
        }
    }

    Ok(doc)
}

fn parse_target(el: &Element) -> Result<TargetDecl> {
    if el.tag != "target" {
        return Err(Error::syntax(format!(
            "expected 'target' element, found '{}'",
            el.tag
        )));
    }
    let name = el
        .attr("name")
        .ok_or_else(|| Error::syntax("target needs a name"))?
        .to_owned();
    let kind = match el.attr("type") {
        Some("local") => TargetKind::Local {
            env: export_env(el)?,
        },
        Some("ssh") => TargetKind::Ssh(parse_ssh_config(el, &name)?),
        Some("group") => TargetKind::Group {
            members: parse_group_members(el)?,
        },
        Some("planetlab") => parse_planetlab(el)?,
        Some(other) => {
            return Err(Error::syntax(format!("unknown target type '{other}'")));
        }
        None => return Err(Error::syntax(format!("target '{name}' needs a type"))),
    };
    Ok(TargetDecl { name, kind })
}

fn parse_ssh_config(el: &Element, name: &str) -> Result<SshConfig> {
    let host = el
        .find_text("host")
        .ok_or_else(|| Error::syntax(format!("ssh target '{name}' requires a host")))?
        .to_owned();
    let user = el
        .find_text("user")
        .ok_or_else(|| Error::syntax(format!("ssh target '{name}' requires a user")))?
        .to_owned();
    let port = match el.find_text("port") {
        Some(text) => text.parse::<u16>().map_err(|_| {
            Error::syntax(format!("ssh target '{name}' has invalid port '{text}'"))
        })?,
        None => DEFAULT_SSH_PORT,
    };
    let extra_args = match el.find_text("extra-args") {
        Some(text) => shlex::split(text).ok_or_else(|| {
            Error::syntax(format!("ssh target '{name}' has unparsable extra-args"))
        })?,
        None => Vec::new(),
    };
    Ok(SshConfig {
        host,
        user,
        port,
        extra_args,
        env: export_env(el)?,
    })
}

fn parse_group_members(el: &Element) -> Result<Vec<GroupMember>> {
    let mut members = Vec::new();
    for child in &el.children {
        match child.attr("ref") {
            Some(refname) => members.push(GroupMember::Ref(refname.to_owned())),
            None => members.push(GroupMember::Decl(parse_target(child)?)),
        }
    }
    Ok(members)
}

fn parse_planetlab(el: &Element) -> Result<TargetKind> {
    let api_url = el
        .find_text("apiurl")
        .ok_or_else(|| Error::syntax("planetlab slice requires 'apiurl'"))?
        .to_owned();
    let slice = el
        .find_text("slicename")
        .ok_or_else(|| Error::syntax("planetlab slice requires 'slicename'"))?
        .to_owned();
    let user = el
        .find_text("user")
        .ok_or_else(|| Error::syntax("planetlab slice requires 'user'"))?
        .to_owned();
    Ok(TargetKind::PlanetLab {
        api_url,
        slice,
        user,
        password: el.find_text("password").map(str::to_owned),
    })
}

fn parse_tasklist(el: &Element, namer: &mut AnonNamer) -> Result<Tasklist> {
    let name = el
        .attr("name")
        .expect("caller checked the name attribute")
        .to_owned();
    let on_error = match el.attr("on-error") {
        Some(policy) => StopScope::from_str(policy)
            .map_err(|_| Error::syntax(format!("unexpected error policy '{policy}'")))?,
        None => StopScope::StopTasklist,
    };
    let timeout = el.attr("timeout").map(parse_iso_duration).transpose()?;
    let mut tasks = Vec::new();
    for child in &el.children {
        tasks.push(parse_task(child, namer)?);
    }
    Ok(Tasklist {
        name,
        on_error,
        timeout,
        cleanup: el.attr("cleanup").map(str::to_owned),
        tasks,
    })
}

fn parse_task(el: &Element, namer: &mut AnonNamer) -> Result<Task> {
    let enabled = el
        .attr("enabled")
        .map_or(true, |value| !value.eq_ignore_ascii_case("false"));
    let kind = match el.tag.as_str() {
        "run" => {
            let name = match el.attr("name") {
                Some(name) => name.to_owned(),
                None => namer.next(),
            };
            if el.text.is_empty() {
                return Err(Error::syntax(format!("run task '{name}' has no command")));
            }
            let expected_status = el.attr("expected-status").and_then(|text| {
                match text.parse::<i32>() {
                    Ok(status) => Some(status),
                    Err(_) => {
                        error!("invalid expected-status '{text}' on task '{name}', ignoring");
                        None
                    }
                }
            });
            TaskKind::Run {
                name,
                command: el.text.clone(),
                expected_status,
            }
        }
        "get" => TaskKind::Get {
            source: transfer_path(el, "source")?,
            destination: transfer_path(el, "destination")?,
        },
        "put" => TaskKind::Put {
            source: transfer_path(el, "source")?,
            destination: transfer_path(el, "destination")?,
            keep: el
                .attr("keep")
                .map_or(false, |value| !value.eq_ignore_ascii_case("false")),
        },
        "seq" | "sequence" => TaskKind::Sequence(parse_task_children(el, namer)?),
        "par" | "parallel" => TaskKind::Parallel(parse_task_children(el, namer)?),
        "call" => TaskKind::Call {
            tasklist: el
                .attr("tasklist")
                .ok_or_else(|| Error::syntax("no tasklist name in 'call'"))?
                .to_owned(),
        },
        "fail" => TaskKind::Fail,
        other => return Err(Error::syntax(format!("unknown task element '{other}'"))),
    };
    Ok(Task { enabled, kind })
}

fn parse_task_children(el: &Element, namer: &mut AnonNamer) -> Result<Vec<Task>> {
    el.children
        .iter()
        .map(|child| parse_task(child, namer))
        .collect()
}

fn transfer_path(el: &Element, part: &str) -> Result<String> {
    el.find_text(part)
        .map(str::to_owned)
        .ok_or_else(|| Error::syntax(format!("'{}' task requires '{part}'", el.tag)))
}

/// `None` means the step is malformed in a way the original tolerated: it is
/// skipped with a log message rather than failing the experiment.
fn parse_step(el: &Element) -> Result<Option<Step>> {
    match el.tag.as_str() {
        "step" => {
            let targets = match el.attr("targets") {
                Some(targets) => targets.to_owned(),
                None => {
                    warn!("step has no targets, skipping");
                    return Ok(None);
                }
            };
            let tasklist = match el.attr("tasklist") {
                Some(tasklist) => tasklist.to_owned(),
                None => {
                    warn!("step has no tasklist, skipping");
                    return Ok(None);
                }
            };
            Ok(Some(Step::Step(StepSpec {
                targets,
                tasklist,
                background: el
                    .attr("background")
                    .map_or(false, |value| value.eq_ignore_ascii_case("true")),
                start: parse_time_spec(el, "start")?,
                stop: parse_time_spec(el, "stop")?,
                env: export_env(el)?,
            })))
        }
        "synchronize" => Ok(Some(Step::Synchronize {
            targets: el.attr("targets").map(str::to_owned),
        })),
        "register-teardown" => {
            let (Some(targets), Some(tasklist)) = (el.attr("targets"), el.attr("tasklist"))
            else {
                warn!("register-teardown lacks targets or tasklist, skipping");
                return Ok(None);
            };
            Ok(Some(Step::RegisterTeardown(TeardownSpec {
                targets: targets.to_owned(),
                tasklist: tasklist.to_owned(),
                env: export_env(el)?,
            })))
        }
        "loop" => parse_loop(el),
        other => Err(Error::syntax(format!("invalid step '{other}'"))),
    }
}

fn parse_loop(el: &Element) -> Result<Option<Step>> {
    let repeat = el.attr("repeat");
    let duration = el.attr("duration");
    let until = el.attr("until");
    let listing = el.attr("list");
    let param = el.attr("param");

    if listing.is_some() != param.is_some() {
        return Err(Error::syntax(if listing.is_none() {
            "loop has 'param' but no 'list'"
        } else {
            "loop has 'list' but no 'param'"
        }));
    }

    let mode_count = [repeat.is_some(), duration.is_some(), until.is_some(), listing.is_some()]
        .iter()
        .filter(|present| **present)
        .count();
    if mode_count != 1 {
        return Err(Error::syntax(
            "loop must set exactly one of repeat, duration, until, or list/param",
        ));
    }

    let mode = if let Some(count) = repeat {
        match count.parse::<u64>() {
            Ok(count) => LoopMode::Repeat(count),
            Err(_) => {
                error!("counted loop has malformed repeat attribute '{count}', skipping");
                return Ok(None);
            }
        }
    } else if let Some(duration) = duration {
        LoopMode::Duration(parse_iso_duration(duration)?)
    } else if let Some(until) = until {
        LoopMode::Until(parse_timestamp(until)?)
    } else {
        let listing = listing.expect("mode count checked above");
        LoopMode::List {
            items: expand_listing(listing)?,
            param: param.expect("list/param pairing checked above").to_owned(),
        }
    };

    let mut body = Vec::new();
    for child in &el.children {
        if let Some(step) = parse_step(child)? {
            body.push(step);
        }
    }
    Ok(Some(Step::Loop(LoopSpec { mode, body })))
}

/// Either whitespace-separated tokens, or an inclusive integer range `A:B`.
fn expand_listing(listing: &str) -> Result<Vec<String>> {
    if listing.contains(':') {
        let parts: Vec<&str> = listing.split(':').collect();
        let range = match parts.as_slice() {
            [start, end] => start
                .parse::<i64>()
                .and_then(|start| end.parse::<i64>().map(|end| (start, end)))
                .ok(),
            _ => None,
        };
        let (start, end) =
            range.ok_or_else(|| Error::syntax(format!("invalid range declaration '{listing}'")))?;
        Ok((start..=end).map(|n| n.to_string()).collect())
    } else {
        Ok(listing.split_whitespace().map(str::to_owned).collect())
    }
}

fn parse_time_spec(el: &Element, prefix: &str) -> Result<Option<TimeSpec>> {
    if let Some(rel) = el.attr(&format!("{prefix}_relative")) {
        return Ok(Some(TimeSpec::Relative(parse_iso_duration(rel)?)));
    }
    if let Some(abs) = el.attr(&format!("{prefix}_absolute")) {
        return Ok(Some(TimeSpec::Absolute(parse_timestamp(abs)?)));
    }
    Ok(None)
}

///
/// Collect `export-env` children into an environment map. A missing `value`
/// inherits from the controller's process environment; an unset inherited
/// variable is an error.
///
pub(crate) fn export_env(el: &Element) -> Result<EnvMap> {
    let mut env = EnvMap::new();
    for child in &el.children {
        if child.tag != "export-env" {
            continue;
        }
        let name = child
            .attr("var")
            .ok_or_else(|| Error::syntax("export-env misses 'var' attribute"))?;
        let value = match child.attr("value") {
            Some(value) => value.to_owned(),
            None => std::env::var(name).map_err(|_| {
                Error::syntax(format!(
                    "variable '{name}' not found in the controller environment"
                ))
            })?,
        };
        env.insert(name.to_owned(), value);
    }
    Ok(env)
}
