// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::{Context, Result};
use prettytable::{row, Table};
use tracing_subscriber::EnvFilter;

use orchestrator::cli::Opts;
use orchestrator::config;
use orchestrator::executor::Status;
use orchestrator::ssh::{HostKeyPolicy, Ssh2Transport};
use orchestrator::{HaltPolicy, Orchestrator};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let opts = Opts::parse();
    init_tracing(&opts);

    let (inventory, catalog) = config::load_from_path(&opts.config)
        .wrap_err_with(|| format!("loading config from {}", opts.config.display()))?;
    tracing::info!(
        machines = inventory.len(),
        actions = catalog.actions().len(),
        "loaded config"
    );

    let host_key_policy = if opts.insecure_accept_any_host_key {
        HostKeyPolicy::InsecureAcceptAny
    } else if let Some(path) = opts.known_hosts.clone() {
        HostKeyPolicy::UseKnownHosts(path)
    } else {
        HostKeyPolicy::AutoAcceptNew
    };

    let orchestrator = Orchestrator::new(
        inventory,
        catalog,
        Arc::new(Ssh2Transport),
        host_key_policy,
        opts.halt_policy(),
    );

    let report = orchestrator.run().await?;
    print_report(&report);

    Ok(if report.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_tracing(opts: &Opts) {
    let default_level = if opts.quiet {
        "warn"
    } else {
        match opts.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_report(report: &orchestrator::RunReport) {
    let mut table = Table::new();
    table.add_row(row!["action", "machine", "status", "duration", "note"]);
    for aggregate in &report.aggregates {
        for outcome in &aggregate.outcomes {
            let note = if outcome.unchanged {
                "unchanged".to_string()
            } else {
                outcome.error_message.clone().unwrap_or_default()
            };
            table.add_row(row![
                aggregate.action_name,
                outcome.machine_name,
                status_label(&outcome.status),
                format!("{:.2?}", outcome.duration),
                note
            ]);
        }
    }
    table.printstd();

    if report.halted_early {
        tracing::warn!("run halted early after a failed action");
    }
}

fn status_label(status: &Status) -> &'static str {
    match status {
        Status::Ok => "ok",
        Status::ConnectFailed => "connect-failed",
        Status::AuthFailed => "auth-failed",
        Status::ExecFailed => "exec-failed",
        Status::Timeout => "timeout",
        Status::ValidationFailed => "validation-failed",
    }
}
