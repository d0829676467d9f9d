// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Iterates an `ActionCatalog` in declaration order, invoking the executor
//! per action and applying the halt-on-failure policy (C6, `spec.md` §4.6).

use std::sync::Arc;

use crate::action::ActionCatalog;
use crate::error::OrchestratorError;
use crate::executor::{AggregateResult, Executor};
use crate::index::{build_content_hash, TargetIndex};
use crate::inventory::Inventory;
use crate::selector;
use crate::ssh::{HostKeyPolicy, SshTransport};

/// Whether a failed action's aggregate stops the rest of the catalog run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltPolicy {
    HaltOnFailure,
    ContinueOnFailure,
}

pub struct Orchestrator {
    inventory: Inventory,
    catalog: ActionCatalog,
    index: TargetIndex,
    executor: Executor,
    halt_policy: HaltPolicy,
}

/// Outcome of an entire catalog run: the aggregates produced before the run
/// stopped, and whether every one of them succeeded.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub aggregates: Vec<AggregateResult>,
    pub halted_early: bool,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.aggregates.iter().all(|a| a.succeeded())
    }
}

impl Orchestrator {
    pub fn new(
        inventory: Inventory,
        catalog: ActionCatalog,
        transport: Arc<dyn SshTransport>,
        host_key_policy: HostKeyPolicy,
        halt_policy: HaltPolicy,
    ) -> Self {
        Self {
            inventory,
            catalog,
            index: TargetIndex::new(),
            executor: Executor::new(transport, host_key_policy),
            halt_policy,
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> Result<RunReport, OrchestratorError> {
        let content_hash = build_content_hash(&self.inventory, &self.catalog);
        let mut aggregates = Vec::with_capacity(self.catalog.actions().len());
        let mut halted_early = false;

        for action in self.catalog.actions() {
            tracing::info!(action = %action.name, "starting action");

            let targets = {
                let mut result = None;
                self.index.get_or_build(&self.inventory, content_hash, |index| {
                    result = Some(selector::select(action, &self.inventory, index));
                });
                result.expect("get_or_build always invokes the callback")
            };

            let targets = match targets {
                Ok(targets) => targets,
                Err(err) => return Err(OrchestratorError::Selection(err)),
            };

            let aggregate = self.executor.execute(action, &targets).await?;
            let this_succeeded = aggregate.succeeded();
            aggregates.push(aggregate);

            if !this_succeeded && self.halt_policy == HaltPolicy::HaltOnFailure {
                halted_early = true;
                break;
            }
        }

        Ok(RunReport {
            aggregates,
            halted_early,
        })
    }
}
