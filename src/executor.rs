// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Drives one action across its resolved targets (C4, `spec.md` §4.4).

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::action::{Action, ActionKind, Payload};
use crate::error::ValidationError;
use crate::selector::MachineRef;
use crate::ssh::{HostKeyPolicy, SshTransport};
use crate::template;

/// Final state of one machine's attempt at an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    ConnectFailed,
    AuthFailed,
    ExecFailed,
    Timeout,
    ValidationFailed,
}

/// Per-machine, per-action result (§3).
#[derive(Debug, Clone)]
pub struct Outcome {
    pub machine_name: String,
    pub status: Status,
    pub stdout: String,
    pub stderr: String,
    pub error_message: Option<String>,
    pub duration: Duration,
    /// Set by template-deploy when the destination already matched the
    /// source byte-for-byte and no write was performed (§4.5.1 step 4).
    pub unchanged: bool,
}

impl Outcome {
    fn failure(machine_name: &str, status: Status, message: String, duration: Duration) -> Self {
        Self {
            machine_name: machine_name.to_string(),
            status,
            stdout: String::new(),
            stderr: String::new(),
            error_message: Some(message),
            duration,
            unchanged: false,
        }
    }
}

/// Per-action roll-up of outcomes (§3, §8: all-or-nothing at the action
/// level — the asymmetry the spec's sequential/parallel paths had in the
/// legacy source is resolved here the same way on both paths).
#[derive(Debug, Clone)]
pub struct AggregateResult {
    pub action_name: String,
    pub target_count: usize,
    pub duration: Duration,
    pub outcomes: Vec<Outcome>,
}

impl AggregateResult {
    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.status == Status::Ok)
    }
}

pub struct Executor {
    transport: Arc<dyn SshTransport>,
    host_key_policy: HostKeyPolicy,
}

impl Executor {
    pub fn new(transport: Arc<dyn SshTransport>, host_key_policy: HostKeyPolicy) -> Self {
        Self {
            transport,
            host_key_policy,
        }
    }

    /// Pre-execution validation (§4.4): fails the whole action before any
    /// session is opened.
    pub fn validate(action: &Action) -> Result<(), ValidationError> {
        match (&action.kind, &action.payload) {
            (ActionKind::Command, Payload::Command(_)) => {}
            (ActionKind::Script, Payload::Script(path)) => {
                if !Path::new(path).is_file() {
                    return Err(ValidationError::MissingSource {
                        action: action.name.clone(),
                        path: path.clone(),
                    });
                }
            }
            (k, Payload::Template(spec)) if k.is_template() => {
                if spec.source.is_empty() || spec.destination.is_empty() {
                    return Err(ValidationError::EmptyTemplatePaths {
                        action: action.name.clone(),
                    });
                }
                if *k == ActionKind::TemplateDeploy && !Path::new(&spec.source).is_file() {
                    return Err(ValidationError::MissingSource {
                        action: action.name.clone(),
                        path: spec.source.clone(),
                    });
                }
            }
            (k, Payload::Conflicting) => {
                let _ = k;
                return Err(ValidationError::ConflictingPayload {
                    action: action.name.clone(),
                });
            }
            (k, Payload::None) if k.is_template() => {
                return Err(ValidationError::MissingTemplateSpec {
                    action: action.name.clone(),
                })
            }
            (k, _) => {
                return Err(ValidationError::MissingPayload {
                    action: action.name.clone(),
                    kind: k.as_str().to_string(),
                })
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, action, targets), fields(action = %action.name))]
    pub async fn execute(&self, action: &Action, targets: &[MachineRef<'_>]) -> Result<AggregateResult, ValidationError> {
        Self::validate(action)?;
        let start = Instant::now();

        let outcomes = if action.parallel {
            self.execute_parallel(action, targets).await
        } else {
            self.execute_sequential(action, targets).await
        };

        tracing::info!(
            action = %action.name,
            targets = targets.len(),
            ok = outcomes.iter().filter(|o| o.status == Status::Ok).count(),
            "action complete"
        );

        Ok(AggregateResult {
            action_name: action.name.clone(),
            target_count: targets.len(),
            duration: start.elapsed(),
            outcomes,
        })
    }

    async fn execute_sequential(&self, action: &Action, targets: &[MachineRef<'_>]) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(targets.len());
        for target in targets {
            outcomes.push(self.run_one(action, target.machine).await);
        }
        outcomes
    }

    async fn execute_parallel(&self, action: &Action, targets: &[MachineRef<'_>]) -> Vec<Outcome> {
        // One task per target, fan-out = |targets|, no worker-pool queue
        // (§9): each task owns its session end to end and reports through a
        // bounded channel sized to the target count.
        let (tx, mut rx) = tokio::sync::mpsc::channel(targets.len().max(1));
        for target in targets {
            let tx = tx.clone();
            let action = action.clone();
            let machine = target.machine.clone();
            let transport = self.transport.clone();
            let host_key_policy = self.host_key_policy.clone();
            tokio::spawn(async move {
                let executor = Executor {
                    transport,
                    host_key_policy,
                };
                let outcome = executor.run_one(&action, &machine).await;
                // A send error means the receiver was already dropped; the
                // caller is gone so there is nothing left to report to.
                let _ = tx.send(outcome).await;
            });
        }
        drop(tx);

        let mut outcomes = Vec::with_capacity(targets.len());
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn run_one(&self, action: &Action, machine: &crate::inventory::Machine) -> Outcome {
        let start = Instant::now();
        if action.kind.is_template() {
            return template::run(
                self.transport.as_ref(),
                &self.host_key_policy,
                action,
                machine,
                start,
            )
            .await;
        }

        let mut session = match self
            .transport
            .open(machine, action.timeout, &self.host_key_policy)
            .await
        {
            Ok(session) => session,
            Err(err) => {
                let status = classify_connect_error(&err);
                return Outcome::failure(&machine.name, status, err.to_string(), start.elapsed());
            }
        };

        let result = match &action.payload {
            Payload::Command(command) => session.run(command).await,
            Payload::Script(path) => match std::fs::read_to_string(path) {
                Ok(content) => session.run(&content).await,
                Err(e) => Err(crate::error::SshError::ExecFailed {
                    machine: machine.name.clone(),
                    status: -1,
                    stderr: format!("failed to read local script {path}: {e}"),
                }),
            },
            // Unreachable: `validate` rejects every other payload shape
            // before `run_one` is ever called.
            _ => unreachable!("non command/script payload reached run_one"),
        };

        session.close().await;

        match result {
            Ok(output) => Outcome {
                machine_name: machine.name.clone(),
                status: Status::Ok,
                stdout: output.stdout,
                stderr: output.stderr,
                error_message: None,
                duration: start.elapsed(),
                unchanged: false,
            },
            Err(err) => Outcome::failure(&machine.name, Status::ExecFailed, err.to_string(), start.elapsed()),
        }
    }
}

fn classify_connect_error(err: &crate::error::SshError) -> Status {
    use crate::error::SshError::*;
    match err {
        NoAuth { .. } | KeyParse { .. } => Status::AuthFailed,
        Connect { .. } | KnownHostsMissing { .. } | HostKeyMismatch { .. } => Status::ConnectFailed,
        Timeout { .. } => Status::Timeout,
        ExecFailed { .. } => Status::ExecFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, Payload, TargetSpec};
    use crate::inventory::{Auth, Machine};
    use crate::testing::{exit_nonzero, ok, FakeTransport, Rule};
    use std::time::Duration;

    fn machine(name: &str) -> Machine {
        Machine {
            name: name.to_string(),
            host: "10.0.0.1".to_string(),
            port: 22,
            user: "u".to_string(),
            auth: Auth::Password("p".to_string()),
            tags: Default::default(),
        }
    }

    fn action(name: &str, parallel: bool) -> Action {
        Action {
            name: name.to_string(),
            kind: ActionKind::Command,
            payload: Payload::Command("echo hi".to_string()),
            target: TargetSpec::All,
            parallel,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn s1_single_machine_command_ok() {
        let transport = Arc::new(
            FakeTransport::new().with_rule(Rule::Exact("echo hi".into(), ok("hi\n"))),
        );
        let executor = Executor::new(transport, HostKeyPolicy::InsecureAcceptAny);
        let web1 = machine("web1");
        let targets = vec![MachineRef {
            index: 0,
            machine: &web1,
        }];
        let action = action("ping", false);
        let result = executor.execute(&action, &targets).await.unwrap();
        assert_eq!(result.outcomes.len(), 1);
        assert_eq!(result.outcomes[0].machine_name, "web1");
        assert_eq!(result.outcomes[0].status, Status::Ok);
        assert!(result.outcomes[0].stdout.contains("hi"));
    }

    #[tokio::test]
    async fn s3_conflicting_payload_fails_before_any_session() {
        let transport = Arc::new(FakeTransport::new());
        let executor = Executor::new(transport, HostKeyPolicy::InsecureAcceptAny);
        let mut action = action("both", false);
        action.payload = Payload::Conflicting;
        let web1 = machine("web1");
        let targets = vec![MachineRef {
            index: 0,
            machine: &web1,
        }];
        let err = executor.execute(&action, &targets).await.unwrap_err();
        assert!(matches!(err, ValidationError::ConflictingPayload { .. }));
    }

    #[tokio::test]
    async fn sequential_preserves_target_order() {
        let transport = Arc::new(FakeTransport::new());
        let executor = Executor::new(transport, HostKeyPolicy::InsecureAcceptAny);
        let machines = vec![machine("m0"), machine("m1"), machine("m2")];
        let targets: Vec<_> = machines
            .iter()
            .enumerate()
            .map(|(index, machine)| MachineRef { index, machine })
            .collect();
        let action = action("seq", false);
        let result = executor.execute(&action, &targets).await.unwrap();
        let names: Vec<_> = result.outcomes.iter().map(|o| o.machine_name.clone()).collect();
        assert_eq!(names, vec!["m0", "m1", "m2"]);
    }

    #[tokio::test]
    async fn s5_parallel_action_is_failure_if_any_target_fails() {
        let transport = Arc::new(
            FakeTransport::new().fail_open(
                "m1",
                crate::error::SshError::Connect {
                    machine: "m1".into(),
                    host: "10.0.0.1".into(),
                    port: 22,
                    reason: "refused".into(),
                },
            ),
        );
        let executor = Executor::new(transport, HostKeyPolicy::InsecureAcceptAny);
        let machines = vec![machine("m0"), machine("m1"), machine("m2")];
        let targets: Vec<_> = machines
            .iter()
            .enumerate()
            .map(|(index, machine)| MachineRef { index, machine })
            .collect();
        let action = action("par", true);
        let result = executor.execute(&action, &targets).await.unwrap();

        let mut names: Vec<_> = result.outcomes.iter().map(|o| o.machine_name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["m0", "m1", "m2"]);
        assert!(!result.succeeded());
        let m1 = result.outcomes.iter().find(|o| o.machine_name == "m1").unwrap();
        assert_eq!(m1.status, Status::ConnectFailed);
    }

    #[tokio::test]
    async fn nonzero_exit_is_exec_failed() {
        let transport = Arc::new(
            FakeTransport::new().with_rule(Rule::Exact("false".into(), exit_nonzero(1, "boom"))),
        );
        let executor = Executor::new(transport, HostKeyPolicy::InsecureAcceptAny);
        let mut action = action("fails", false);
        action.payload = Payload::Command("false".to_string());
        let web1 = machine("web1");
        let targets = vec![MachineRef {
            index: 0,
            machine: &web1,
        }];
        let result = executor.execute(&action, &targets).await.unwrap();
        assert_eq!(result.outcomes[0].status, Status::ExecFailed);
        assert!(!result.succeeded());
    }
}
