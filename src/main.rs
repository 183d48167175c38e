// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[cfg(test)]
mod test_util;

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{info, warn, LevelFilter};
use scenario_infra::env::Env;
use scenario_infra::params::Params;
use scenario_infra::report::RunReport;
use scenario_infra::runner::{
    error_chain, LogReporter, Reporter, ScenarioOutcome, ScenarioRunner, Verdict,
};
use scenario_infra::subject::{InMemoryDomain, Subject, VirshDomain};
use virt_scenario::cli_print_error_chain;
use virt_scenario::scenarios::{self, main_vm};

fn get_cli_options_sorted() -> Box<[Arg]> {
    [
        Arg::new("dry-run")
            .long("dry-run")
            .help("Run against in-memory domains instead of libvirt")
            .action(ArgAction::SetTrue),
        Arg::new("list-scenarios")
            .long("list-scenarios")
            .help("List the available scenarios and exit")
            .action(ArgAction::SetTrue),
        Arg::new("param")
            .long("param")
            .help("Parameter overrides \"key=<value>,key2=<value2>\"")
            .num_args(1)
            .action(ArgAction::Append),
        Arg::new("params-file")
            .long("params-file")
            .help("JSON object holding scenario parameters")
            .num_args(1)
            .value_parser(clap::value_parser!(PathBuf)),
        Arg::new("report-file")
            .long("report-file")
            .help("Report file, standard output if not specified")
            .num_args(1)
            .value_parser(clap::value_parser!(PathBuf)),
        Arg::new("scenario-filter")
            .long("scenario-filter")
            .help("Only run scenarios whose name contains one of the keywords")
            .num_args(1..)
            .action(ArgAction::Append),
        Arg::new("v")
            .short('v')
            .action(ArgAction::Count)
            .help("Sets the level of debugging output"),
    ]
    .to_vec()
    .into_boxed_slice()
}

fn create_app() -> Command {
    Command::new("virt-scenario")
        .version(env!("BUILD_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Run libvirt test scenarios with guaranteed cleanup.")
        .args(get_cli_options_sorted())
}

fn init_logger(matches: &ArgMatches) {
    let level = match matches.get_count("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn default_params_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("virt-scenario").join("params.json"))
}

// Later layers win: user config file, --params-file, then --param.
fn load_params(matches: &ArgMatches, default_path: Option<&Path>) -> anyhow::Result<Params> {
    let mut params = Params::new();

    if let Some(path) = default_path.filter(|p| p.exists()) {
        info!("Loading parameters from {}", path.display());
        params.merge(
            &Params::from_json_file(path)
                .with_context(|| format!("Error loading {}", path.display()))?,
        );
    }

    if let Some(path) = matches.get_one::<PathBuf>("params-file") {
        params.merge(
            &Params::from_json_file(path)
                .with_context(|| format!("Error loading {}", path.display()))?,
        );
    }

    for overrides in matches.get_many::<String>("param").unwrap_or_default() {
        params
            .parse_overrides(overrides)
            .with_context(|| format!("Error parsing --param {overrides}"))?;
    }

    Ok(params)
}

fn build_env(params: &Params, dry_run: bool) -> anyhow::Result<Env> {
    let mut names = params.get_list("vms");
    let main = main_vm(params);
    if !names.contains(&main) {
        names.push(main);
    }

    let mut env = Env::new();
    for name in names {
        let subject: Arc<dyn Subject> = if dry_run {
            Arc::new(InMemoryDomain::new(
                &name,
                &InMemoryDomain::default_config(&name),
            ))
        } else {
            Arc::new(
                VirshDomain::from_params(&name, params)
                    .with_context(|| format!("Error configuring domain '{name}'"))?,
            )
        };
        env.register(subject);
    }
    Ok(env)
}

fn report_writer(path: Option<&PathBuf>) -> anyhow::Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => Box::new(
            File::create(path)
                .with_context(|| format!("Error opening report file {}", path.display()))?,
        ),
        None => Box::new(io::stdout()),
    })
}

/// Returns whether every selected scenario passed or was cancelled.
/// `default_params` is the user's parameter file, read first when present.
fn start_virt_scenario(
    matches: &ArgMatches,
    default_params: Option<&Path>,
) -> anyhow::Result<bool> {
    if matches.get_flag("list-scenarios") {
        for entry in scenarios::SCENARIOS {
            println!("{:<24} {}", entry.name, entry.description);
        }
        return Ok(true);
    }

    let params = load_params(matches, default_params)?;
    let env = build_env(&params, matches.get_flag("dry-run"))?;

    let filters: Vec<String> = matches
        .get_many::<String>("scenario-filter")
        .unwrap_or_default()
        .cloned()
        .collect();
    let selected: Vec<_> = scenarios::filtered(&filters).collect();
    if selected.is_empty() {
        return Err(anyhow!("No scenario matches {filters:?}"));
    }

    // Fail before running anything if the report cannot be written
    let mut writer = report_writer(matches.get_one::<PathBuf>("report-file"))?;

    let runner = ScenarioRunner::new(env, params.clone());
    let mut reporter = LogReporter;
    let mut report = RunReport::new(env!("BUILD_VERSION"));
    let mut all_ok = true;

    for entry in selected {
        let outcome = match (entry.build)(&params) {
            Ok(scenario) => runner.execute(scenario, &mut reporter),
            Err(e) => {
                let msg = error_chain(&e);
                reporter.error(entry.name, &msg);
                ScenarioOutcome {
                    name: entry.name.to_string(),
                    verdict: Verdict::Error(msg),
                    duration: Duration::ZERO,
                    teardown_errors: Vec::new(),
                }
            }
        };
        all_ok &= outcome.verdict.is_ok();
        report.add(&outcome);
    }

    info!(
        "{} passed, {} failed, {} errors, {} cancelled",
        report.count("pass"),
        report.count("fail"),
        report.count("error"),
        report.count("cancel")
    );
    if !all_ok {
        warn!("Some scenarios did not pass");
    }

    report
        .write_to(&mut writer)
        .context("Error writing report")?;

    Ok(all_ok)
}

fn main() {
    let matches = create_app().get_matches();
    init_logger(&matches);

    let exit_code = match start_virt_scenario(&matches, default_params_path().as_deref()) {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(top_error) => {
            cli_print_error_chain(top_error.as_ref(), "virt-scenario");
            1
        }
    };

    std::process::exit(exit_code);
}
