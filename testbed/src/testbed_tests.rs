// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use experiment::{EnvMap, TaskKind};
use tempfile::TempDir;

use self::support::empty_testbed;
use crate::testbed::{auto_removal_allowed, removal_tasklist, Settings, Teardown};

mod support {
    use async_trait::async_trait;
    use experiment::Result;

    use crate::planetlab::{SliceCredentials, SliceDirectory};
    use crate::testbed::{Settings, Testbed};

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

    pub async fn empty_testbed(settings: Settings) -> Testbed {
        Testbed::new(&[], settings, &EmptyDirectory).await.unwrap()
    }
}

#[tokio::test]
async fn run_logs_are_numbered_from_one() {
    let logroot = TempDir::new().unwrap();
    let testbed = empty_testbed(Settings {
        logroot_dir: Some(logroot.path().to_owned()),
        ..Settings::default()
    })
    .await;

    testbed.open_run_logs("n1", "hello").unwrap().unwrap();
    testbed.open_run_logs("n1", "hello").unwrap().unwrap();
    testbed.open_run_logs("n2", "other").unwrap().unwrap();

    for expected in [
        "n1/hello.1.out",
        "n1/hello.1.err",
        "n1/hello.2.out",
        "n1/hello.2.err",
        "n2/other.3.out",
        "n2/other.3.err",
    ] {
        assert!(
            logroot.path().join(expected).exists(),
            "missing log file {expected}"
        );
    }
}

#[tokio::test]
async fn no_logroot_means_no_log_files() {
    let testbed = empty_testbed(Settings::default()).await;
    assert!(testbed.open_run_logs("n1", "hello").unwrap().is_none());
}

#[tokio::test]
async fn teardowns_drain_in_registration_order() {
    let testbed = empty_testbed(Settings::default()).await;
    for name in ["first", "second", "third"] {
        testbed.register_teardown(Teardown {
            targets: "n1".to_owned(),
            tasklist: Arc::new(removal_tasklist(name)),
            env: EnvMap::new(),
        });
    }
    let names: Vec<String> = testbed
        .take_teardowns()
        .into_iter()
        .map(|teardown| teardown.tasklist.name.clone())
        .collect();
    assert_eq!(names, vec!["_rm_first", "_rm_second", "_rm_third"]);
    assert!(testbed.take_teardowns().is_empty());
}

#[test]
fn auto_removal_allow_list() {
    for allowed in ["foo.txt", ".bashrc", "data-set.2", "a"] {
        assert!(auto_removal_allowed(allowed), "{allowed} should be allowed");
    }
    for denied in [
        "../etc/passwd",
        "/etc/passwd",
        "foo bar",
        "foo/bar",
        "-rf",
        "$HOME",
        "",
    ] {
        assert!(!auto_removal_allowed(denied), "{denied} should be denied");
    }
}

#[test]
fn removal_tasklist_runs_rm() {
    let tasklist = removal_tasklist("foo.txt");
    assert_eq!(tasklist.tasks.len(), 1);
    match &tasklist.tasks[0].kind {
        TaskKind::Run { command, .. } => assert_eq!(command, "rm foo.txt"),
        other => panic!("expected run task, got {other:?}"),
    }
}
