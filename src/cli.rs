// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Argument parsing for the `orchestrator` binary (A2). Out of the core's
//! scope per `spec.md` §1; kept thin.

use std::path::PathBuf;

use clap::Parser;

use crate::orchestrator::HaltPolicy;

#[derive(Debug, Parser)]
#[command(name = "orchestrator", about = "Declarative remote-command orchestrator")]
pub struct Opts {
    /// Path to a YAML document with `machines:` and `actions:`.
    #[arg(long, short = 'c')]
    pub config: PathBuf,

    /// Continue running the remaining actions after one fails, instead of
    /// halting the catalog run.
    #[arg(long)]
    pub continue_on_failure: bool,

    /// Accept any host key without checking known_hosts.
    #[arg(long)]
    pub insecure_accept_any_host_key: bool,

    /// known_hosts file to check host keys against (mutually exclusive with
    /// --insecure-accept-any-host-key).
    #[arg(long)]
    pub known_hosts: Option<PathBuf>,

    /// Increase log verbosity; repeat for more (-v, -vv).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Decrease log verbosity.
    #[arg(short = 'q', long)]
    pub quiet: bool,
}

impl Opts {
    pub fn halt_policy(&self) -> HaltPolicy {
        if self.continue_on_failure {
            HaltPolicy::ContinueOnFailure
        } else {
            HaltPolicy::HaltOnFailure
        }
    }
}
