// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! In-memory [`SshTransport`] fake used by executor and template tests so
//! dispatch/idempotency/backup logic can be exercised without a live socket
//! or a mock SSH server (the latter is explicitly out of scope per
//! `spec.md` §1).

#![cfg(test)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SshError;
use crate::inventory::Machine;
use crate::ssh::{CommandOutput, HostKeyPolicy, SshSession, SshTransport};

/// A scripted response for one command, keyed by exact string or substring.
#[derive(Clone)]
pub enum Rule {
    Exact(String, Result<CommandOutput, SshError>),
    Contains(String, Result<CommandOutput, SshError>),
}

pub fn ok(stdout: &str) -> Result<CommandOutput, SshError> {
    Ok(CommandOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
        exit_status: 0,
    })
}

pub fn exit_nonzero(status: i32, stderr: &str) -> Result<CommandOutput, SshError> {
    Err(SshError::ExecFailed {
        machine: "fake".to_string(),
        status,
        stderr: stderr.to_string(),
    })
}

/// Shared state for a single fake target: the command log plus a remote
/// virtual filesystem used by template tests to model idempotency/backup.
#[derive(Default)]
pub struct FakeState {
    pub commands: Vec<String>,
    pub files: HashMap<String, String>,
}

pub struct FakeTransport {
    /// machine name -> Err to fail `open()` with (connect-style failures).
    pub open_failures: HashMap<String, SshError>,
    pub rules: Vec<Rule>,
    pub state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            open_failures: HashMap::new(),
            rules: Vec::new(),
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    pub fn fail_open(mut self, machine: &str, err: SshError) -> Self {
        self.open_failures.insert(machine.to_string(), err);
        self
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn seed_file(self, path: &str, content: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), content.to_string());
        self
    }
}

#[async_trait]
impl SshTransport for FakeTransport {
    async fn open(
        &self,
        machine: &Machine,
        _timeout: Duration,
        _policy: &HostKeyPolicy,
    ) -> Result<Box<dyn SshSession>, SshError> {
        if let Some(err) = self.open_failures.get(&machine.name) {
            return Err(err.clone());
        }
        Ok(Box::new(FakeSession {
            rules: self.rules.clone(),
            state: self.state.clone(),
        }))
    }
}

pub struct FakeSession {
    rules: Vec<Rule>,
    state: Arc<Mutex<FakeState>>,
}

impl FakeSession {
    fn dispatch(&self, command: &str) -> Result<CommandOutput, SshError> {
        self.state.lock().unwrap().commands.push(command.to_string());

        // Built-in virtual-filesystem semantics shared by every test that
        // exercises the template action's cat/echo/test/rm/cp/stat calls,
        // so individual tests only need to seed files and rules for the
        // behaviors they specifically want to assert on.
        let mut state = self.state.lock().unwrap();
        if let Some(rest) = command.strip_prefix("cat ") {
            let path = rest.trim();
            return match state.files.get(path) {
                Some(content) => Ok(CommandOutput {
                    stdout: content.clone(),
                    stderr: String::new(),
                    exit_status: 0,
                }),
                None => Err(SshError::ExecFailed {
                    machine: "fake".into(),
                    status: 1,
                    stderr: format!("cat: {path}: No such file or directory"),
                }),
            };
        }
        if let Some(rest) = command.strip_prefix("test -r ") {
            let path = rest.trim();
            let status = if state.files.contains_key(path) { 0 } else { 1 };
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_status: status,
            });
        }
        if let Some(rest) = command.strip_prefix("test -f ") {
            let path = rest.trim();
            let status = if state.files.contains_key(path) { 0 } else { 1 };
            return Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_status: status,
            });
        }
        if let Some(rest) = command.strip_prefix("rm -f ") {
            let path = rest.trim();
            state.files.remove(path);
            return Ok(CommandOutput::default());
        }
        if command.starts_with("cp ") {
            let parts: Vec<&str> = command.trim_start_matches("cp ").split_whitespace().collect();
            if let [src, dst] = parts[..] {
                if let Some(content) = state.files.get(src).cloned() {
                    state.files.insert(dst.to_string(), content);
                    return Ok(CommandOutput::default());
                }
                return Err(SshError::ExecFailed {
                    machine: "fake".into(),
                    status: 1,
                    stderr: format!("cp: cannot stat '{src}'"),
                });
            }
        }
        if command.starts_with("mkdir -p ") || command.starts_with("chmod ") || command.starts_with("chown ") || command.starts_with("chgrp ")
        {
            return Ok(CommandOutput::default());
        }
        drop(state);

        for rule in &self.rules {
            match rule {
                Rule::Exact(pattern, result) if pattern == command => return result.clone(),
                Rule::Contains(pattern, result) if command.contains(pattern.as_str()) => {
                    return result.clone()
                }
                _ => {}
            }
        }

        Ok(CommandOutput::default())
    }

    fn handle_echo_write(&self, command: &str) {
        // Matches the §4.5.1 step 6 write shape:
        //   echo '<escaped content>' > <destination>
        if let Some(idx) = command.find("' > ") {
            if let Some(stripped) = command.strip_prefix("echo '") {
                let content_end = stripped.find("' > ").unwrap_or(0);
                let content = &stripped[..content_end];
                let dest = command[idx + 4..].trim();
                let unescaped = content.replace(r#"'"'"'"#, "'");
                self.state
                    .lock()
                    .unwrap()
                    .files
                    .insert(dest.to_string(), unescaped);
            }
        }
    }
}

#[async_trait]
impl SshSession for FakeSession {
    async fn run(&mut self, command: &str) -> Result<CommandOutput, SshError> {
        if command.starts_with("echo '") {
            self.handle_echo_write(command);
        }
        self.dispatch(command)
    }

    async fn run_with_stdin(&mut self, command: &str, _stdin: &str) -> Result<CommandOutput, SshError> {
        self.dispatch(command)
    }

    async fn close(&mut self) {}
}
