/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::{env, process};

use crate::prefs::{
    ArgumentParsingResult, RunConfig, parse_command_line_arguments, resolve_run_config,
};
use crate::runtime::control_panel::{ControlPanel, SamplerOutcome};

pub fn main() {
    // Skip the first argument, which is the binary name.
    let args: Vec<String> = env::args().skip(1).collect();
    let cli = match parse_command_line_arguments(&args) {
        ArgumentParsingResult::Run(cli) => cli,
        ArgumentParsingResult::Exit => process::exit(0),
        ArgumentParsingResult::ErrorParsing => process::exit(1),
    };

    crate::init_tracing(cli.log_filter.as_deref());

    let config = match resolve_run_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("failed to start async runtime: {e}");
            process::exit(1);
        }
    };

    let exit_code = runtime.block_on(run(config));
    // Viewer processes outlive us; don't wait on their reaper tasks.
    runtime.shutdown_background();
    process::exit(exit_code);
}

async fn run(config: RunConfig) -> i32 {
    log::info!(
        "cli: sampling localhost:{}{} ({})",
        config.diagnostic_port,
        config.diagnostic_path,
        describe_kinds(&config)
    );

    let mut panel = match ControlPanel::start(config) {
        Ok(panel) => panel,
        Err(e) => {
            log::error!("{e}");
            return 1;
        }
    };

    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("cli: cannot listen for Ctrl-C ({e})");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        outcomes = panel.join_samplers() => exit_code_for(&outcomes),
        _ = interrupted => {
            log::warn!("cli: interrupted; artifacts written so far are kept");
            130
        }
    }
}

fn describe_kinds(config: &RunConfig) -> String {
    config
        .samplers()
        .map(|spec| format!("{} x{}", spec.kind, spec.sample_count))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Non-zero only when no sampler got as far as its loop.
fn exit_code_for(outcomes: &[SamplerOutcome]) -> i32 {
    let mut any_ran = false;
    for (kind, result) in outcomes {
        match result {
            Ok(report) => {
                any_ran = true;
                match report.viewer_port {
                    Some(port) => log::info!(
                        "cli: {kind}: {} saved, {} skipped, viewer on port {port}",
                        report.saved.len(),
                        report.skipped
                    ),
                    None => log::info!(
                        "cli: {kind}: {} saved, {} skipped",
                        report.saved.len(),
                        report.skipped
                    ),
                }
            }
            Err(e) => log::error!("cli: {kind} sampling aborted: {e}"),
        }
    }
    if any_ran { 0 } else { 1 }
}
