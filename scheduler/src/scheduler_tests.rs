// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use experiment::{
    load_experiment, EnvMap, Error, Result, StopScope, Task, TaskKind, Tasklist,
};
use tempfile::TempDir;
use testbed::{Node, Settings, SliceCredentials, SliceDirectory, Testbed};

use crate::driver::Driver;
use crate::task_runner::TaskRunner;

struct EmptyDirectory;

#[async_trait]
impl SliceDirectory for EmptyDirectory {
    async fn slice_hostnames(
        &self,
        _api_url: &str,
        _slice: &str,
        _credentials: &SliceCredentials,
    ) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

fn settings(logroot: &Path) -> Settings {
    Settings {
        batch: true,
        logroot_dir: Some(logroot.to_owned()),
        ssh_cooldown: None,
        ssh_parallelism: 30,
    }
}

/// Write the XML, load it, build a testbed, and run the driver to completion.
async fn run_experiment(xml: &str, logroot: &Path) {
    let scratch = TempDir::new().unwrap();
    let file = scratch.path().join("experiment.xml");
    std::fs::write(&file, xml).unwrap();
    let experiment = load_experiment(&file).unwrap();
    let testbed = Arc::new(
        Testbed::new(&experiment.targets, settings(logroot), &EmptyDirectory)
            .await
            .unwrap(),
    );
    Driver::new(testbed, &experiment).run().await;
}

fn read_log(logroot: &Path, relative: &str) -> String {
    std::fs::read_to_string(logroot.join(relative))
        .unwrap_or_else(|e| panic!("missing log file {relative}: {e}"))
}

const LOCAL_TARGET: &str =
    r#"<targets><target name="N1" type="local"/></targets>"#;

#[tokio::test]
async fn single_host_echo() {
    let logroot = TempDir::new().unwrap();
    run_experiment(
        &format!(
            r#"<experiment>
                 {LOCAL_TARGET}
                 <tasklists>
                   <tasklist name="T1">
                     <run name="hello" expected-status="0">echo hi</run>
                   </tasklist>
                 </tasklists>
                 <steps><step targets="N1" tasklist="T1"/></steps>
               </experiment>"#
        ),
        logroot.path(),
    )
    .await;
    assert_eq!(read_log(logroot.path(), "N1/hello.1.out"), "hi\n");
    assert_eq!(read_log(logroot.path(), "N1/hello.1.err"), "");
}

#[tokio::test]
async fn tasklist_timeout_still_runs_cleanup() {
    let logroot = TempDir::new().unwrap();
    let marker = logroot.path().join("cleaned");
    let started = Instant::now();
    run_experiment(
        &format!(
            r#"<experiment>
                 {LOCAL_TARGET}
                 <tasklists>
                   <tasklist name="slow" timeout="PT0.3S" cleanup="cln">
                     <run name="napper">sleep 10</run>
                   </tasklist>
                   <tasklist name="cln">
                     <run name="cleaner">echo cleaned > {marker}</run>
                   </tasklist>
                 </tasklists>
                 <steps><step targets="N1" tasklist="slow"/></steps>
               </experiment>"#,
            marker = marker.display()
        ),
        logroot.path(),
    )
    .await;
    assert!(started.elapsed() < Duration::from_secs(5), "timeout did not fire");
    assert_eq!(std::fs::read_to_string(&marker).unwrap(), "cleaned\n");
}

#[tokio::test]
async fn stop_step_lets_later_steps_run() {
    let logroot = TempDir::new().unwrap();
    run_experiment(
        &format!(
            r#"<experiment>
                 {LOCAL_TARGET}
                 <tasklists>
                   <tasklist name="fail1" on-error="stop-step"><fail/></tasklist>
                   <tasklist name="ok"><run name="after">echo after</run></tasklist>
                 </tasklists>
                 <steps>
                   <step targets="N1" tasklist="fail1"/>
                   <synchronize/>
                   <step targets="N1" tasklist="ok"/>
                 </steps>
               </experiment>"#
        ),
        logroot.path(),
    )
    .await;
    assert_eq!(read_log(logroot.path(), "N1/after.1.out"), "after\n");
}

#[tokio::test]
async fn stop_experiment_skips_later_steps_but_not_teardowns() {
    let logroot = TempDir::new().unwrap();
    run_experiment(
        &format!(
            r#"<experiment>
                 {LOCAL_TARGET}
                 <tasklists>
                   <tasklist name="fail1" on-error="stop-experiment"><fail/></tasklist>
                   <tasklist name="ok"><run name="after">echo after</run></tasklist>
                   <tasklist name="td"><run name="torndown">echo td</run></tasklist>
                 </tasklists>
                 <steps>
                   <register-teardown targets="N1" tasklist="td"/>
                   <step targets="N1" tasklist="fail1"/>
                   <synchronize/>
                   <step targets="N1" tasklist="ok"/>
                 </steps>
               </experiment>"#
        ),
        logroot.path(),
    )
    .await;
    let node_dir = logroot.path().join("N1");
    let entries: Vec<String> = std::fs::read_dir(&node_dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert!(
        !entries.iter().any(|name| name.starts_with("after.")),
        "step after stop-experiment still ran: {entries:?}"
    );
    assert_eq!(read_log(logroot.path(), "N1/torndown.1.out"), "td\n");
}

#[tokio::test]
async fn integer_range_loop_binds_param_and_teardown_runs_once() {
    let logroot = TempDir::new().unwrap();
    let marker = logroot.path().join("torn");
    run_experiment(
        &format!(
            r#"<experiment>
                 {LOCAL_TARGET}
                 <tasklists>
                   <tasklist name="mk"><run name="out">echo $I</run></tasklist>
                   <tasklist name="rm"><run name="tear">echo torn >> {marker}</run></tasklist>
                 </tasklists>
                 <steps>
                   <register-teardown targets="N1" tasklist="rm"/>
                   <loop list="1:3" param="I">
                     <step targets="N1" tasklist="mk"/>
                   </loop>
                 </steps>
               </experiment>"#,
            marker = marker.display()
        ),
        logroot.path(),
    )
    .await;
    // One iteration joins before the next starts, so run numbers follow
    // iteration order.
    assert_eq!(read_log(logroot.path(), "N1/out.1.out"), "1\n");
    assert_eq!(read_log(logroot.path(), "N1/out.2.out"), "2\n");
    assert_eq!(read_log(logroot.path(), "N1/out.3.out"), "3\n");
    assert_eq!(std::fs::read_to_string(&marker).unwrap(), "torn\n");
}

#[tokio::test]
async fn zero_duration_loop_runs_exactly_once() {
    let logroot = TempDir::new().unwrap();
    run_experiment(
        &format!(
            r#"<experiment>
                 {LOCAL_TARGET}
                 <tasklists>
                   <tasklist name="mk"><run name="once">echo once</run></tasklist>
                 </tasklists>
                 <steps>
                   <loop duration="PT0S"><step targets="N1" tasklist="mk"/></loop>
                 </steps>
               </experiment>"#
        ),
        logroot.path(),
    )
    .await;
    assert_eq!(read_log(logroot.path(), "N1/once.1.out"), "once\n");
    assert!(!logroot.path().join("N1/once.2.out").exists());
}

#[tokio::test]
async fn synchronize_with_no_tasks_returns_immediately() {
    let logroot = TempDir::new().unwrap();
    let started = Instant::now();
    run_experiment(
        &format!(
            r#"<experiment>
                 {LOCAL_TARGET}
                 <tasklists/>
                 <steps><synchronize/></steps>
               </experiment>"#
        ),
        logroot.path(),
    )
    .await;
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn disabled_tasks_contribute_no_log_files() {
    let logroot = TempDir::new().unwrap();
    run_experiment(
        &format!(
            r#"<experiment>
                 {LOCAL_TARGET}
                 <tasklists>
                   <tasklist name="t"><run name="skipped" enabled="false">echo nope</run></tasklist>
                 </tasklists>
                 <steps><step targets="N1" tasklist="t"/></steps>
               </experiment>"#
        ),
        logroot.path(),
    )
    .await;
    assert!(!logroot.path().join("N1").exists());
}

#[tokio::test]
async fn parallel_siblings_finish_before_a_failure_surfaces() {
    let logroot = TempDir::new().unwrap();
    run_experiment(
        &format!(
            r#"<experiment>
                 {LOCAL_TARGET}
                 <tasklists>
                   <tasklist name="t">
                     <par>
                       <fail/>
                       <run name="sibling">sleep 0.3; echo sib</run>
                     </par>
                   </tasklist>
                 </tasklists>
                 <steps><step targets="N1" tasklist="t"/></steps>
               </experiment>"#
        ),
        logroot.path(),
    )
    .await;
    assert_eq!(read_log(logroot.path(), "N1/sibling.1.out"), "sib\n");
}

#[tokio::test]
async fn step_stop_time_bounds_the_tasklist() {
    let logroot = TempDir::new().unwrap();
    let started = Instant::now();
    run_experiment(
        &format!(
            r#"<experiment>
                 {LOCAL_TARGET}
                 <tasklists>
                   <tasklist name="slow"><run name="napper">sleep 10</run></tasklist>
                 </tasklists>
                 <steps><step targets="N1" tasklist="slow" stop_relative="PT0.3S"/></steps>
               </experiment>"#
        ),
        logroot.path(),
    )
    .await;
    assert!(started.elapsed() < Duration::from_secs(5), "stop time did not fire");
}

#[tokio::test]
async fn background_tasks_are_cancelled_at_experiment_end() {
    let logroot = TempDir::new().unwrap();
    let started = Instant::now();
    run_experiment(
        &format!(
            r#"<experiment>
                 {LOCAL_TARGET}
                 <tasklists>
                   <tasklist name="bg"><run name="lingerer">sleep 30</run></tasklist>
                   <tasklist name="ok"><run name="after">echo after</run></tasklist>
                 </tasklists>
                 <steps>
                   <step targets="N1" tasklist="bg" background="true"/>
                   <step targets="N1" tasklist="ok"/>
                 </steps>
               </experiment>"#
        ),
        logroot.path(),
    )
    .await;
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "background task was not cancelled"
    );
    let after = std::fs::read_dir(logroot.path().join("N1"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("after.") && name.ends_with(".out"))
        .collect::<Vec<_>>();
    assert_eq!(after.len(), 1);
}

#[tokio::test]
async fn step_export_env_reaches_commands() {
    let logroot = TempDir::new().unwrap();
    run_experiment(
        &format!(
            r#"<experiment>
                 {LOCAL_TARGET}
                 <tasklists>
                   <tasklist name="t"><run name="round">echo $ROUND</run></tasklist>
                 </tasklists>
                 <steps>
                   <step targets="N1" tasklist="t">
                     <export-env var="ROUND" value="7"/>
                   </step>
                 </steps>
               </experiment>"#
        ),
        logroot.path(),
    )
    .await;
    assert_eq!(read_log(logroot.path(), "N1/round.1.out"), "7\n");
}

// Direct TaskRunner coverage for behavior the driver tests cannot observe.

async fn bare_testbed() -> Arc<Testbed> {
    Arc::new(
        Testbed::new(
            &[],
            Settings {
                batch: true,
                logroot_dir: None,
                ssh_cooldown: None,
                ssh_parallelism: 30,
            },
            &EmptyDirectory,
        )
        .await
        .unwrap(),
    )
}

fn put_tasklist(destination: &str, keep: bool) -> Arc<Tasklist> {
    Arc::new(Tasklist {
        name: "uploads".to_owned(),
        on_error: StopScope::StopTasklist,
        timeout: None,
        cleanup: None,
        tasks: vec![Task {
            enabled: true,
            kind: TaskKind::Put {
                source: "payload.bin".to_owned(),
                destination: destination.to_owned(),
                keep,
            },
        }],
    })
}

#[tokio::test]
async fn put_registers_removal_teardown_for_safe_destinations() {
    let testbed = bare_testbed().await;
    let node = Arc::new(Node::local("n1".to_owned(), EnvMap::new()));
    let runner = TaskRunner::new(testbed.clone(), node, Arc::new(HashMap::new()));

    runner
        .run_tasklist(&put_tasklist("upload-$GPLMT_TARGET.bin", false), &EnvMap::new(), None)
        .await
        .unwrap();
    let teardowns = testbed.take_teardowns();
    assert_eq!(teardowns.len(), 1);
    assert_eq!(teardowns[0].targets, "n1");
    // The node name was substituted before the destination was checked.
    match &teardowns[0].tasklist.tasks[0].kind {
        TaskKind::Run { command, .. } => assert_eq!(command, "rm upload-n1.bin"),
        other => panic!("expected run task, got {other:?}"),
    }
}

#[tokio::test]
async fn put_skips_removal_for_suspicious_destinations() {
    let testbed = bare_testbed().await;
    let node = Arc::new(Node::local("n1".to_owned(), EnvMap::new()));
    let runner = TaskRunner::new(testbed.clone(), node, Arc::new(HashMap::new()));

    runner
        .run_tasklist(&put_tasklist("../etc/passwd", false), &EnvMap::new(), None)
        .await
        .unwrap();
    assert!(testbed.take_teardowns().is_empty());
}

#[tokio::test]
async fn put_with_keep_registers_nothing() {
    let testbed = bare_testbed().await;
    let node = Arc::new(Node::local("n1".to_owned(), EnvMap::new()));
    let runner = TaskRunner::new(testbed.clone(), node, Arc::new(HashMap::new()));

    runner
        .run_tasklist(&put_tasklist("kept.bin", true), &EnvMap::new(), None)
        .await
        .unwrap();
    assert!(testbed.take_teardowns().is_empty());
}

#[tokio::test]
async fn calling_an_unknown_tasklist_is_a_syntax_error() {
    let testbed = bare_testbed().await;
    let node = Arc::new(Node::local("n1".to_owned(), EnvMap::new()));
    let runner = TaskRunner::new(testbed.clone(), node, Arc::new(HashMap::new()));

    let caller = Arc::new(Tasklist {
        name: "caller".to_owned(),
        on_error: StopScope::StopTasklist,
        timeout: None,
        cleanup: None,
        tasks: vec![Task {
            enabled: true,
            kind: TaskKind::Call {
                tasklist: "missing".to_owned(),
            },
        }],
    });
    let err = runner
        .run_tasklist(&caller, &EnvMap::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Syntax(msg) if msg.contains("missing")));
}
