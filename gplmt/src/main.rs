// Copyright 2023 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use experiment::{load_experiment, Error};
use log::{error, info, warn};
use scheduler::Driver;
use testbed::{PlanetLabDirectory, Settings, Testbed};

const EXIT_SETUP_FAILURE: i32 = 1;
const EXIT_NO_STEPS: i32 = 2;

fn parse_args() -> ArgMatches {
    Command::new("gplmt")
        .about("Lightweight distributed testbed controller.")
        .arg(
            Arg::new("experiment-file")
                .value_name("FILE")
                .required(true)
                .help("Experiment description XML file."),
        )
        .arg(
            Arg::new("dry")
                .long("dry")
                .action(ArgAction::SetTrue)
                .help("Parse and validate the experiment, then exit."),
        )
        .arg(
            Arg::new("batch")
                .long("batch")
                .action(ArgAction::SetTrue)
                .help("Fail on interactive prompts instead of asking."),
        )
        .arg(
            Arg::new("logroot-dir")
                .long("logroot-dir")
                .value_name("DIR")
                .help("Root of the per-node log tree; created if missing."),
        )
        .arg(
            Arg::new("ssh-cooldown")
                .long("ssh-cooldown")
                .value_name("SECONDS")
                .value_parser(value_parser!(f64))
                .default_value("1.0")
                .help("Minimum spacing between SSH handshakes; 0 disables the cooldown."),
        )
        .arg(
            Arg::new("ssh-parallelism")
                .long("ssh-parallelism")
                .value_name("N")
                .value_parser(value_parser!(usize))
                .default_value("30")
                .help("Maximum concurrent SSH handshakes."),
        )
        .arg(
            Arg::new("rng")
                .long("rng")
                .value_name("FILE")
                .help("Experiment-tree schema (accepted for compatibility)."),
        )
        .get_matches()
}

async fn execute(args: &ArgMatches) -> Result<i32, Error> {
    let path = PathBuf::from(
        args.get_one::<String>("experiment-file")
            .expect("argument is required"),
    );
    if let Some(rng) = args.get_one::<String>("rng") {
        warn!("schema {rng} ignored: validation here is structural, not RelaxNG");
    }

    let experiment = load_experiment(&path)?;
    if args.get_flag("dry") {
        info!("dry run: experiment parsed and validated");
        return Ok(0);
    }
    if experiment.steps.is_empty() {
        warn!("nothing to do (no steps defined)");
        return Ok(EXIT_NO_STEPS);
    }

    let logroot_dir = args.get_one::<String>("logroot-dir").map(PathBuf::from);
    if let Some(dir) = &logroot_dir {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::setup(format!("could not create log root {dir:?}: {e}")))?;
    }
    let cooldown = *args
        .get_one::<f64>("ssh-cooldown")
        .expect("argument has a default");
    let settings = Settings {
        batch: args.get_flag("batch"),
        logroot_dir,
        ssh_cooldown: (cooldown > 0.0).then(|| Duration::from_secs_f64(cooldown)),
        ssh_parallelism: *args
            .get_one::<usize>("ssh-parallelism")
            .expect("argument has a default"),
    };

    let directory = PlanetLabDirectory::new();
    let testbed = Arc::new(Testbed::new(&experiment.targets, settings, &directory).await?);
    Driver::new(testbed, &experiment).run().await;
    Ok(0)
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = parse_args();
    match execute(&args).await {
        Ok(code) => exit(code),
        Err(e) => {
            error!("{e}");
            exit(EXIT_SETUP_FAILURE);
        }
    }
}
