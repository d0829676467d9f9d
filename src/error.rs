// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use thiserror::Error;

/// Errors raised while an SSH session is opened, used, or closed.
///
/// Every variant is fatal for the target it was raised against; peers of the
/// same action are unaffected. See `spec.md` §7 for the origin/recovery table.
#[derive(Debug, Error, Clone)]
pub enum SshError {
    #[error("no authentication method configured for {machine}")]
    NoAuth { machine: String },

    #[error("failed to parse private key for {machine} at {path}: {reason}")]
    KeyParse {
        machine: String,
        path: String,
        reason: String,
    },

    #[error("failed to connect to {machine} ({host}:{port}): {reason}")]
    Connect {
        machine: String,
        host: String,
        port: u16,
        reason: String,
    },

    #[error("command exited non-zero on {machine} (status {status}): {stderr}")]
    ExecFailed {
        machine: String,
        status: i32,
        stderr: String,
    },

    #[error("known_hosts file missing for {machine}: {path}")]
    KnownHostsMissing { machine: String, path: String },

    #[error("host key mismatch for {machine}")]
    HostKeyMismatch { machine: String },

    #[error("session handshake with {machine} exceeded {timeout:?}")]
    Timeout { machine: String, timeout: Duration },
}

/// Errors raised while resolving an action's target spec to a machine list.
#[derive(Debug, Error, Clone)]
pub enum SelectionError {
    #[error("action {action} targets unknown machine {machine}")]
    UnknownMachine { action: String, machine: String },
}

/// Pre-execution validation errors. These abort the whole action before any
/// session is opened.
#[derive(Debug, Error, Clone)]
pub enum ValidationError {
    #[error("action {action}: command and script are mutually exclusive")]
    ConflictingPayload { action: String },

    #[error("action {action}: missing payload for kind {kind}")]
    MissingPayload { action: String, kind: String },

    #[error("action {action}: local source {path} does not exist or is not readable")]
    MissingSource { action: String, path: String },

    #[error("action {action}: template action requires a template spec")]
    MissingTemplateSpec { action: String },

    #[error("action {action}: template source or destination is empty")]
    EmptyTemplatePaths { action: String },
}

/// Errors raised by the four template operations (deploy/evaluate/validate/cleanup).
#[derive(Debug, Error, Clone)]
pub enum TemplateError {
    #[error("local template source {path} is missing")]
    MissingSource { path: String },

    #[error("template is not syntactically valid: {reason}")]
    Syntax { reason: String },

    #[error("template braces are unbalanced ({open} open, {close} close)")]
    Unbalanced { open: usize, close: usize },

    #[error("remote backup of {path} failed: {reason}")]
    BackupFailed { path: String, reason: String },

    #[error("post-operation validation of {path} failed")]
    ValidationFailed { path: String },

    #[error(transparent)]
    Ssh(#[from] SshError),
}

/// Errors raised while loading an `Inventory`/`ActionCatalog` from the
/// YAML config adapter (`spec.md` §1 calls this adapter out of core scope;
/// it still needs a typed error so the CLI can render it distinctly from
/// an in-run `Outcome` failure).
#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    #[error("duplicate machine name: {0}")]
    DuplicateMachineName(String),

    #[error("duplicate action name: {0}")]
    DuplicateActionName(String),

    #[error("machine {machine}: port {port} is out of range 1..=65535")]
    BadPort { machine: String, port: i64 },

    #[error("machine {machine}: neither password nor private_key_path configured")]
    NoAuthMethod { machine: String },

    #[error("machine {0}: tags must have non-empty keys and values")]
    BadTag(String),

    #[error("action {action}: target references unknown tag predicate {predicate}")]
    BadTarget { action: String, predicate: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },
}

/// Top-level error type that every fallible core operation ultimately
/// converts into. The CLI renders this with `color-eyre`; library code never
/// depends on it.
#[derive(Debug, Error, Clone)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}
