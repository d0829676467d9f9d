// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Template Action (C5): four short state machines over the SSH session
//! contract — deploy, evaluate, validate, cleanup (`spec.md` §4.5).

use std::time::Instant;

use async_trait::async_trait;

use crate::action::{Action, ActionKind, Payload, TemplateSpec};
use crate::error::{SshError, TemplateError};
use crate::executor::{Outcome, Status};
use crate::inventory::Machine;
use crate::ssh::{shell_single_quote_escape, HostKeyPolicy, SshSession, SshTransport};

/// The fixed name set a template may reference (Glossary: Template Functions).
const APPROVED_FUNCTIONS: &[&str] = &[
    "machineID",
    "osVersion",
    "hostname",
    "ipAddress",
    "diskSpace",
    "memoryInfo",
    "fileExists",
    "fileContent",
    "fileSize",
    "fileOwner",
];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Call { name: String, arg: Option<String> },
}

fn count_braces(source: &str) -> (usize, usize) {
    (source.matches("{{").count(), source.matches("}}").count())
}

/// Parses `source` into literal/call tokens, failing with `template-syntax`
/// on an unbalanced `{{`/`}}` pair or a reference to a function outside
/// [`APPROVED_FUNCTIONS`] (§4.5.1 step 2, §4.5.3 step 3).
fn parse_template(source: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut rest = source;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            tokens.push(Token::Literal(rest[..open].to_string()));
        }
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            return Err(TemplateError::Syntax {
                reason: "unterminated {{ ... }}".to_string(),
            });
        };
        let inner = after_open[..close].trim();
        let (name, arg) = match inner.split_once('(') {
            Some((name, rest)) => {
                let arg = rest.strip_suffix(')').ok_or_else(|| TemplateError::Syntax {
                    reason: format!("unterminated function call: {inner}"),
                })?;
                (name.trim(), Some(arg.trim().to_string()))
            }
            None => (inner, None),
        };
        if !APPROVED_FUNCTIONS.contains(&name) {
            return Err(TemplateError::Syntax {
                reason: format!("unknown template function: {name}"),
            });
        }
        tokens.push(Token::Call {
            name: name.to_string(),
            arg,
        });
        rest = &after_open[close + 2..];
    }
    if !rest.is_empty() {
        tokens.push(Token::Literal(rest.to_string()));
    }
    Ok(tokens)
}

#[async_trait]
trait TemplateFunctions {
    async fn call(&mut self, name: &str, arg: Option<&str>) -> Result<String, TemplateError>;
}

/// Used by deploy/validate: never touches the network, just confirms every
/// referenced function is in the approved set.
struct StubFunctions;

#[async_trait]
impl TemplateFunctions for StubFunctions {
    async fn call(&mut self, name: &str, _arg: Option<&str>) -> Result<String, TemplateError> {
        Ok(format!("<{name}>"))
    }
}

/// Used by evaluate: each function runs a small shell probe over the
/// existing session and returns trimmed stdout (§4.5.2 step 3).
struct LiveFunctions<'a> {
    session: &'a mut dyn SshSession,
}

#[async_trait]
impl<'a> TemplateFunctions for LiveFunctions<'a> {
    async fn call(&mut self, name: &str, arg: Option<&str>) -> Result<String, TemplateError> {
        let command = match name {
            "machineID" => "cat /etc/machine-id".to_string(),
            "osVersion" => "uname -r".to_string(),
            "hostname" => "hostname".to_string(),
            "ipAddress" => "hostname -I | awk '{print $1}'".to_string(),
            "diskSpace" => "df -h .".to_string(),
            "memoryInfo" => "free -h".to_string(),
            "fileExists" => {
                let path = arg.unwrap_or_default();
                let output = self.session.run(&format!("test -f {path}")).await;
                return Ok(output.is_ok().to_string());
            }
            "fileContent" => format!("cat {}", arg.unwrap_or_default()),
            "fileSize" => format!("stat -c %s {}", arg.unwrap_or_default()),
            "fileOwner" => format!("stat -c %U {}", arg.unwrap_or_default()),
            other => {
                return Err(TemplateError::Syntax {
                    reason: format!("unknown template function: {other}"),
                })
            }
        };
        let output = self.session.run(&command).await?;
        Ok(output.stdout.trim().to_string())
    }
}

async fn render(tokens: &[Token], functions: &mut dyn TemplateFunctions) -> Result<String, TemplateError> {
    let mut out = String::new();
    for token in tokens {
        match token {
            Token::Literal(s) => out.push_str(s),
            Token::Call { name, arg } => {
                out.push_str(&functions.call(name, arg.as_deref()).await?);
            }
        }
    }
    Ok(out)
}

fn spec_of(action: &Action) -> &TemplateSpec {
    match &action.payload {
        Payload::Template(spec) => spec,
        // Executor::validate rejects every other payload shape for a
        // template-* kind before `run` is ever called.
        _ => unreachable!("non-template payload reached template::run"),
    }
}

fn ok(machine: &str, stdout: String, unchanged: bool, start: Instant) -> Outcome {
    Outcome {
        machine_name: machine.to_string(),
        status: Status::Ok,
        stdout,
        stderr: String::new(),
        error_message: None,
        duration: start.elapsed(),
        unchanged,
    }
}

fn failure(machine: &str, status: Status, message: String, start: Instant) -> Outcome {
    Outcome {
        machine_name: machine.to_string(),
        status,
        stdout: String::new(),
        stderr: String::new(),
        error_message: Some(message),
        duration: start.elapsed(),
        unchanged: false,
    }
}

fn status_for(err: &TemplateError) -> Status {
    match err {
        TemplateError::MissingSource { .. }
        | TemplateError::Syntax { .. }
        | TemplateError::Unbalanced { .. } => Status::ValidationFailed,
        TemplateError::BackupFailed { .. } | TemplateError::ValidationFailed { .. } => {
            Status::ValidationFailed
        }
        TemplateError::Ssh(_) => Status::ExecFailed,
    }
}

/// Entry point used by the executor: opens a session against `machine` and
/// dispatches to the operation named by `action.kind`.
pub async fn run(
    transport: &dyn SshTransport,
    host_key_policy: &HostKeyPolicy,
    action: &Action,
    machine: &Machine,
    start: Instant,
) -> Outcome {
    let mut session = match transport.open(machine, action.timeout, host_key_policy).await {
        Ok(session) => session,
        Err(err) => {
            let status = match &err {
                SshError::NoAuth { .. } | SshError::KeyParse { .. } => Status::AuthFailed,
                SshError::Timeout { .. } => Status::Timeout,
                _ => Status::ConnectFailed,
            };
            return failure(&machine.name, status, err.to_string(), start);
        }
    };

    let spec = spec_of(action);
    let result = match action.kind {
        ActionKind::TemplateDeploy => deploy(session.as_mut(), spec, start, &machine.name).await,
        ActionKind::TemplateEvaluate => evaluate(session.as_mut(), spec, start, &machine.name).await,
        ActionKind::TemplateValidate => validate(session.as_mut(), spec, start, &machine.name).await,
        ActionKind::TemplateCleanup => cleanup(session.as_mut(), spec, start, &machine.name).await,
        _ => unreachable!("non-template action kind reached template::run"),
    };

    session.close().await;
    result
}

fn dirname(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir.to_string(),
        _ => ".".to_string(),
    }
}

fn echo_write_command(destination: &str, content: &str) -> String {
    format!("echo '{}' > {}", shell_single_quote_escape(content), destination)
}

/// Deploy: read-local -> validate-syntax -> ensure-dir -> probe-remote ->
/// maybe-backup -> write -> verify -> permissions -> ownership -> done.
async fn deploy(session: &mut dyn SshSession, spec: &TemplateSpec, start: Instant, machine: &str) -> Outcome {
    let content = match std::fs::read_to_string(&spec.source) {
        Ok(c) => c,
        Err(_) => {
            return failure(
                machine,
                Status::ValidationFailed,
                TemplateError::MissingSource {
                    path: spec.source.clone(),
                }
                .to_string(),
                start,
            )
        }
    };

    if let Err(err) = parse_template(&content) {
        return failure(machine, status_for(&err), err.to_string(), start);
    }

    if let Err(err) = session.run(&format!("mkdir -p {}", dirname(&spec.destination))).await {
        return failure(machine, Status::ExecFailed, err.to_string(), start);
    }

    let existing = session.run(&format!("cat {}", spec.destination)).await.ok();
    if let Some(existing_output) = &existing {
        if existing_output.stdout == content {
            return ok(machine, "unchanged".to_string(), true, start);
        }
        if spec.backup {
            let backup_dest = format!("{}.backup", spec.destination);
            if let Err(e) = session
                .run(&format!("cp {} {}", spec.destination, backup_dest))
                .await
            {
                return failure(
                    machine,
                    Status::ValidationFailed,
                    TemplateError::BackupFailed {
                        path: spec.destination.clone(),
                        reason: e.to_string(),
                    }
                    .to_string(),
                    start,
                );
            }
        }
    }

    if let Err(err) = session.run(&echo_write_command(&spec.destination, &content)).await {
        return failure(machine, Status::ExecFailed, err.to_string(), start);
    }

    if let Err(outcome) = verify_and_finish(session, spec, machine, start).await {
        return outcome;
    }

    ok(machine, String::new(), false, start)
}

/// Deploy-only tail: existence check, then permissions, then ownership
/// (§4.5.1 steps 7–9).
async fn verify_and_finish(
    session: &mut dyn SshSession,
    spec: &TemplateSpec,
    machine: &str,
    start: Instant,
) -> Result<(), Outcome> {
    verify_readable(session, spec, machine, start).await?;

    if let Some(permissions) = &spec.permissions {
        if let Err(e) = session
            .run(&format!("chmod {} {}", permissions, spec.destination))
            .await
        {
            return Err(failure(machine, Status::ExecFailed, e.to_string(), start));
        }
    }

    match (&spec.owner, &spec.group) {
        (Some(owner), Some(group)) => {
            if let Err(e) = session
                .run(&format!("chown {}:{} {}", owner, group, spec.destination))
                .await
            {
                return Err(failure(machine, Status::ExecFailed, e.to_string(), start));
            }
        }
        (Some(owner), None) => {
            if let Err(e) = session.run(&format!("chown {} {}", owner, spec.destination)).await {
                return Err(failure(machine, Status::ExecFailed, e.to_string(), start));
            }
        }
        (None, Some(group)) => {
            if let Err(e) = session.run(&format!("chgrp {} {}", group, spec.destination)).await {
                return Err(failure(machine, Status::ExecFailed, e.to_string(), start));
            }
        }
        (None, None) => {}
    }

    Ok(())
}

/// Shared by deploy and evaluate: confirms the written destination is
/// readable. Evaluate never goes past this (§4.5.2 has no permissions or
/// ownership step); only deploy continues on into `verify_and_finish`.
async fn verify_readable(
    session: &mut dyn SshSession,
    spec: &TemplateSpec,
    machine: &str,
    start: Instant,
) -> Result<(), Outcome> {
    let check = session
        .run(&format!("test -r {}", spec.destination))
        .await;
    if check.is_err() {
        return Err(failure(
            machine,
            Status::ValidationFailed,
            TemplateError::ValidationFailed {
                path: spec.destination.clone(),
            }
            .to_string(),
            start,
        ));
    }
    Ok(())
}

/// Evaluate: optional backup -> read remote source -> render with live
/// functions -> write -> optional validate (§4.5.2).
async fn evaluate(session: &mut dyn SshSession, spec: &TemplateSpec, start: Instant, machine: &str) -> Outcome {
    if spec.backup {
        let existing = session.run(&format!("test -f {}", spec.destination)).await;
        if existing.is_ok() {
            let backup_dest = format!("{}.backup", spec.destination);
            if let Err(e) = session
                .run(&format!("cp {} {}", spec.destination, backup_dest))
                .await
            {
                return failure(
                    machine,
                    Status::ValidationFailed,
                    TemplateError::BackupFailed {
                        path: spec.destination.clone(),
                        reason: e.to_string(),
                    }
                    .to_string(),
                    start,
                );
            }
        }
    }

    let source = match session.run(&format!("cat {}", spec.source)).await {
        Ok(output) => output.stdout,
        Err(err) => return failure(machine, Status::ExecFailed, err.to_string(), start),
    };

    let tokens = match parse_template(&source) {
        Ok(tokens) => tokens,
        Err(err) => return failure(machine, status_for(&err), err.to_string(), start),
    };

    let mut functions = LiveFunctions { session };
    let rendered = match render(&tokens, &mut functions).await {
        Ok(r) => r,
        Err(err) => return failure(machine, status_for(&err), err.to_string(), start),
    };

    if let Err(err) = session.run(&echo_write_command(&spec.destination, &rendered)).await {
        return failure(machine, Status::ExecFailed, err.to_string(), start);
    }

    if spec.validate {
        if let Err(outcome) = verify_readable(session, spec, machine, start).await {
            return outcome;
        }
    }

    ok(machine, rendered, false, start)
}

/// Validate: read remote source -> balanced-braces check -> stub parse (§4.5.3).
async fn validate(session: &mut dyn SshSession, spec: &TemplateSpec, start: Instant, machine: &str) -> Outcome {
    let source = match session.run(&format!("cat {}", spec.source)).await {
        Ok(output) => output.stdout,
        Err(err) => return failure(machine, Status::ExecFailed, err.to_string(), start),
    };

    let (open, close) = count_braces(&source);
    if open != close {
        let err = TemplateError::Unbalanced { open, close };
        return failure(machine, status_for(&err), err.to_string(), start);
    }

    let tokens = match parse_template(&source) {
        Ok(tokens) => tokens,
        Err(err) => return failure(machine, status_for(&err), err.to_string(), start),
    };

    let mut functions = StubFunctions;
    if let Err(err) = render(&tokens, &mut functions).await {
        return failure(machine, status_for(&err), err.to_string(), start);
    }

    ok(machine, "valid".to_string(), false, start)
}

/// Cleanup: `rm -f <source>` remotely (§4.5.4).
async fn cleanup(session: &mut dyn SshSession, spec: &TemplateSpec, start: Instant, machine: &str) -> Outcome {
    match session.run(&format!("rm -f {}", spec.source)).await {
        Ok(_) => ok(machine, String::new(), false, start),
        Err(err) => failure(machine, Status::ExecFailed, err.to_string(), start),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::TargetSpec;
    use crate::inventory::Auth;
    use crate::testing::FakeTransport;
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

    fn deploy_action(spec: TemplateSpec) -> Action {
        Action {
            name: "deploy".to_string(),
            kind: ActionKind::TemplateDeploy,
            payload: Payload::Template(spec),
            target: TargetSpec::All,
            parallel: false,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn parses_literal_and_call_tokens() {
        let tokens = parse_template("hello {{hostname}}!").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Literal("hello ".to_string()),
                Token::Call {
                    name: "hostname".to_string(),
                    arg: None
                },
                Token::Literal("!".to_string()),
            ]
        );
    }

    #[test]
    fn parses_call_with_argument() {
        let tokens = parse_template("{{fileExists(/etc/passwd)}}").unwrap();
        assert_eq!(
            tokens,
            vec![Token::Call {
                name: "fileExists".to_string(),
                arg: Some("/etc/passwd".to_string())
            }]
        );
    }

    #[test]
    fn unbalanced_braces_detected_by_counting() {
        let (open, close) = count_braces("{{hostname} }");
        assert_ne!(open, close);
    }

    #[test]
    fn balanced_braces_with_single_flip_fails() {
        let valid = "{{hostname}} on {{osVersion}}";
        assert!(parse_template(valid).is_ok());
        let flipped = "{hostname}} on {{osVersion}}";
        let (open, close) = count_braces(flipped);
        assert_ne!(open, close);
    }

    #[test]
    fn unknown_function_is_a_syntax_error() {
        let err = parse_template("{{notAFunction}}").unwrap_err();
        assert!(matches!(err, TemplateError::Syntax { .. }));
    }

    #[tokio::test]
    async fn s4_deploy_writes_then_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("motd.txt");
        std::fs::write(&source_path, "hello fleet\n").unwrap();

        let transport = FakeTransport::new();
        let spec = TemplateSpec {
            source: source_path.to_str().unwrap().to_string(),
            destination: "/etc/motd".to_string(),
            validate: true,
            backup: false,
            permissions: None,
            owner: None,
            group: None,
        };
        let action = deploy_action(spec);
        let m = machine("web1");

        let first = run(&transport, &HostKeyPolicy::InsecureAcceptAny, &action, &m, Instant::now()).await;
        assert_eq!(first.status, Status::Ok);
        assert!(!first.unchanged);

        let second = run(&transport, &HostKeyPolicy::InsecureAcceptAny, &action, &m, Instant::now()).await;
        assert_eq!(second.status, Status::Ok);
        assert!(second.unchanged);
    }

    #[tokio::test]
    async fn deploy_backs_up_existing_destination_before_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("motd.txt");
        std::fs::write(&source_path, "new content\n").unwrap();

        let transport = FakeTransport::new().seed_file("/etc/motd", "old content\n");
        let spec = TemplateSpec {
            source: source_path.to_str().unwrap().to_string(),
            destination: "/etc/motd".to_string(),
            validate: true,
            backup: true,
            permissions: None,
            owner: None,
            group: None,
        };
        let action = deploy_action(spec);
        let m = machine("web1");
        let outcome = run(&transport, &HostKeyPolicy::InsecureAcceptAny, &action, &m, Instant::now()).await;
        assert_eq!(outcome.status, Status::Ok);

        let state = transport.state.lock().unwrap();
        assert_eq!(state.files.get("/etc/motd.backup").unwrap(), "old content\n");
        assert_eq!(state.files.get("/etc/motd").unwrap(), "new content\n");
    }

    #[tokio::test]
    async fn cleanup_removes_remote_source() {
        let transport = FakeTransport::new().seed_file("/tmp/rendered.conf", "x");
        let action = Action {
            name: "cleanup".to_string(),
            kind: ActionKind::TemplateCleanup,
            payload: Payload::Template(TemplateSpec {
                source: "/tmp/rendered.conf".to_string(),
                destination: String::new(),
                validate: false,
                backup: false,
                permissions: None,
                owner: None,
                group: None,
            }),
            target: TargetSpec::All,
            parallel: false,
            timeout: Duration::from_secs(5),
        };
        let m = machine("web1");
        let outcome = run(&transport, &HostKeyPolicy::InsecureAcceptAny, &action, &m, Instant::now()).await;
        assert_eq!(outcome.status, Status::Ok);
        assert!(!transport.state.lock().unwrap().files.contains_key("/tmp/rendered.conf"));
    }
}
