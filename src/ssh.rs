// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The SSH session contract (C1). `ssh2` is a blocking API, so the real
//! transport does its work on a blocking thread via
//! [`tokio::task::spawn_blocking`]; callers (the executor, the template
//! action) only ever see the async [`SshTransport`]/[`SshSession`] traits,
//! which also makes the contract fakeable in tests without a live socket.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SshError;
use crate::inventory::{Auth, Machine};

/// How an unknown or changed host key is handled at `open` time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    InsecureAcceptAny,
    UseKnownHosts(PathBuf),
    AutoAcceptNew,
}

/// Captured stdout/stderr/exit status of one `run`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

impl CommandOutput {
    pub fn is_success(&self) -> bool {
        self.exit_status == 0
    }
}

/// One authenticated transport to one machine. Implementations own whatever
/// socket/handle they hold and must make `close` idempotent and safe to call
/// on a session that failed to fully open.
#[async_trait]
pub trait SshSession: Send {
    async fn run(&mut self, command: &str) -> Result<CommandOutput, SshError>;

    async fn run_with_stdin(&mut self, command: &str, stdin: &str) -> Result<CommandOutput, SshError>;

    async fn close(&mut self);
}

/// Opens [`SshSession`]s against a machine. Swappable so the executor and
/// template action can be tested without a live network (`spec.md`'s
/// Non-goal only rules out a network-level mock SSH server, not a trait
/// fake).
#[async_trait]
pub trait SshTransport: Send + Sync {
    async fn open(
        &self,
        machine: &Machine,
        timeout: Duration,
        host_key_policy: &HostKeyPolicy,
    ) -> Result<Box<dyn SshSession>, SshError>;
}

/// The real transport, backed by `ssh2` over a blocking `TcpStream`.
#[derive(Debug, Clone, Default)]
pub struct Ssh2Transport;

#[async_trait]
impl SshTransport for Ssh2Transport {
    async fn open(
        &self,
        machine: &Machine,
        timeout: Duration,
        host_key_policy: &HostKeyPolicy,
    ) -> Result<Box<dyn SshSession>, SshError> {
        let machine = machine.clone();
        let host_key_policy = host_key_policy.clone();
        tokio::task::spawn_blocking(move || open_blocking(&machine, timeout, &host_key_policy))
            .await
            .expect("ssh open task panicked")
            .map(|s| Box::new(s) as Box<dyn SshSession>)
    }
}

fn open_blocking(
    machine: &Machine,
    timeout: Duration,
    host_key_policy: &HostKeyPolicy,
) -> Result<Ssh2Session, SshError> {
    let addr = format!("{}:{}", machine.host, machine.port);
    tracing::debug!(machine = %machine.name, %addr, "dialing");
    let socket_addr = addr
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next());
    let tcp = match socket_addr {
        Some(socket_addr) => TcpStream::connect_timeout(&socket_addr, timeout).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                SshError::Timeout {
                    machine: machine.name.clone(),
                    timeout,
                }
            } else {
                SshError::Connect {
                    machine: machine.name.clone(),
                    host: machine.host.clone(),
                    port: machine.port,
                    reason: e.to_string(),
                }
            }
        })?,
        None => TcpStream::connect(&addr).map_err(|e| SshError::Connect {
            machine: machine.name.clone(),
            host: machine.host.clone(),
            port: machine.port,
            reason: e.to_string(),
        })?,
    };
    tcp.set_read_timeout(Some(timeout)).ok();
    tcp.set_write_timeout(Some(timeout)).ok();

    let mut session = ssh2::Session::new().map_err(|e| SshError::Connect {
        machine: machine.name.clone(),
        host: machine.host.clone(),
        port: machine.port,
        reason: e.to_string(),
    })?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    session.handshake().map_err(|e| SshError::Connect {
        machine: machine.name.clone(),
        host: machine.host.clone(),
        port: machine.port,
        reason: format!("handshake failed: {e}"),
    })?;

    check_host_key(&session, machine, host_key_policy)?;
    authenticate(&session, machine)?;

    Ok(Ssh2Session {
        session: Arc::new(Mutex::new(session)),
        machine_name: machine.name.clone(),
    })
}

fn check_host_key(
    session: &ssh2::Session,
    machine: &Machine,
    policy: &HostKeyPolicy,
) -> Result<(), SshError> {
    match policy {
        HostKeyPolicy::InsecureAcceptAny => Ok(()),
        HostKeyPolicy::AutoAcceptNew => {
            // A fully-fledged implementation would persist the key the first
            // time it is seen; for a one-shot orchestrator run, accepting
            // new keys without a persistence step is equivalent to
            // InsecureAcceptAny and is documented as such.
            Ok(())
        }
        HostKeyPolicy::UseKnownHosts(path) => {
            let path = expand_tilde(path);
            if !path.exists() {
                return Err(SshError::KnownHostsMissing {
                    machine: machine.name.clone(),
                    path: path.display().to_string(),
                });
            }
            let mut known_hosts = session.known_hosts().map_err(|e| SshError::Connect {
                machine: machine.name.clone(),
                host: machine.host.clone(),
                port: machine.port,
                reason: e.to_string(),
            })?;
            known_hosts
                .read_file(&path, ssh2::KnownHostFileKind::OpenSSH)
                .map_err(|e| SshError::Connect {
                    machine: machine.name.clone(),
                    host: machine.host.clone(),
                    port: machine.port,
                    reason: e.to_string(),
                })?;
            let (key, key_type) = session.host_key().ok_or_else(|| SshError::HostKeyMismatch {
                machine: machine.name.clone(),
            })?;
            match known_hosts.check(&machine.host, key) {
                ssh2::CheckResult::Match => Ok(()),
                ssh2::CheckResult::NotFound => {
                    // Unknown host under a strict known_hosts policy: reject.
                    let _ = key_type;
                    Err(SshError::HostKeyMismatch {
                        machine: machine.name.clone(),
                    })
                }
                ssh2::CheckResult::Mismatch | ssh2::CheckResult::Failure => {
                    Err(SshError::HostKeyMismatch {
                        machine: machine.name.clone(),
                    })
                }
            }
        }
    }
}

fn authenticate(session: &ssh2::Session, machine: &Machine) -> Result<(), SshError> {
    match &machine.auth {
        Auth::PrivateKeyPath(path) => auth_key(session, machine, path),
        Auth::Password(password) => auth_password(session, machine, password),
        Auth::Both {
            private_key_path,
            password,
        } => {
            // §4.1: public key first, then password.
            if auth_key(session, machine, private_key_path).is_ok() {
                return Ok(());
            }
            auth_password(session, machine, password)
        }
    }
}

fn auth_key(session: &ssh2::Session, machine: &Machine, key_path: &str) -> Result<(), SshError> {
    let path = expand_tilde(Path::new(key_path));
    if !path.exists() {
        return Err(SshError::KeyParse {
            machine: machine.name.clone(),
            path: path.display().to_string(),
            reason: "file not found".to_string(),
        });
    }
    session
        .userauth_pubkey_file(&machine.user, None, &path, None)
        .map_err(|e| SshError::KeyParse {
            machine: machine.name.clone(),
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}

fn auth_password(session: &ssh2::Session, machine: &Machine, password: &str) -> Result<(), SshError> {
    session
        .userauth_password(&machine.user, password)
        .map_err(|e| SshError::Connect {
            machine: machine.name.clone(),
            host: machine.host.clone(),
            port: machine.port,
            reason: format!("password auth rejected: {e}"),
        })
}

fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(stripped) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => Path::new(&home).join(stripped),
        None => path.to_path_buf(),
    }
}

/// Shared with `close`: held behind an `Arc<Mutex<_>>` so a blocking call can
/// be moved wholesale into a `spawn_blocking` task and handed back afterward,
/// keeping every blocking `ssh2` call off the tokio worker threads.
struct Ssh2Session {
    session: Arc<Mutex<ssh2::Session>>,
    machine_name: String,
}

fn run_blocking(
    session: &ssh2::Session,
    machine_name: &str,
    command: &str,
    stdin: Option<&str>,
) -> Result<CommandOutput, SshError> {
    let fail = |reason: String| SshError::ExecFailed {
        machine: machine_name.to_string(),
        status: -1,
        stderr: reason,
    };
    let mut channel = session.channel_session().map_err(|e| fail(e.to_string()))?;
    channel.exec(command).map_err(|e| fail(e.to_string()))?;
    if let Some(input) = stdin {
        use std::io::Write;
        channel
            .write_all(input.as_bytes())
            .map_err(|e| fail(e.to_string()))?;
    }
    channel.send_eof().ok();

    let mut stdout = String::new();
    channel.read_to_string(&mut stdout).ok();
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr).ok();
    channel.wait_close().ok();
    let exit_status = channel.exit_status().unwrap_or(-1);

    if exit_status != 0 {
        return Err(SshError::ExecFailed {
            machine: machine_name.to_string(),
            status: exit_status,
            stderr,
        });
    }
    Ok(CommandOutput {
        stdout,
        stderr,
        exit_status,
    })
}

#[async_trait]
impl SshSession for Ssh2Session {
    async fn run(&mut self, command: &str) -> Result<CommandOutput, SshError> {
        let command = command.to_string();
        let session = self.session.clone();
        let machine_name = self.machine_name.clone();
        tokio::task::spawn_blocking(move || {
            let session = session.lock().expect("ssh2 session mutex poisoned");
            run_blocking(&session, &machine_name, &command, None)
        })
        .await
        .expect("ssh exec task panicked")
    }

    async fn run_with_stdin(&mut self, command: &str, stdin: &str) -> Result<CommandOutput, SshError> {
        let command = command.to_string();
        let stdin = stdin.to_string();
        let session = self.session.clone();
        let machine_name = self.machine_name.clone();
        tokio::task::spawn_blocking(move || {
            let session = session.lock().expect("ssh2 session mutex poisoned");
            run_blocking(&session, &machine_name, &command, Some(&stdin))
        })
        .await
        .expect("ssh exec task panicked")
    }

    async fn close(&mut self) {
        let session = self.session.clone();
        let _ = tokio::task::spawn_blocking(move || {
            let session = session.lock().expect("ssh2 session mutex poisoned");
            // Idempotent: disconnecting twice is harmless, ssh2 just returns an error we ignore.
            session.disconnect(None, "orchestrator done", None)
        })
        .await;
    }
}

/// Single-quote-escapes `content` for embedding in `echo '...'` the way
/// §4.5.1 step 6 specifies: every embedded `'` becomes `'"'"'`.
pub fn shell_single_quote_escape(content: &str) -> String {
    content.replace('\'', r#"'"'"'"#)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_single_quotes() {
        assert_eq!(shell_single_quote_escape("it's"), r#"it'"'"'s"#);
    }

    #[test]
    fn expand_tilde_uses_home() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(
            expand_tilde(Path::new("~/.ssh/known_hosts")),
            PathBuf::from("/home/tester/.ssh/known_hosts")
        );
    }

    #[test]
    fn expand_tilde_passes_through_absolute_paths() {
        assert_eq!(
            expand_tilde(Path::new("/etc/ssh/known_hosts")),
            PathBuf::from("/etc/ssh/known_hosts")
        );
    }
}
