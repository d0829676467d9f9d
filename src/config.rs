// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Config Adapter (A1): deserializes a YAML document into the core's
//! `Inventory`/`ActionCatalog` values, validating the invariants from
//! `spec.md` §3 at load time so the core never has to. Out of the core's
//! scope per `spec.md` §1; kept in its own module so that boundary stays
//! visible.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::action::{Action, ActionCatalog, ActionKind, Payload, TagPredicate, TargetSpec, TemplateSpec};
use crate::error::ConfigError;
use crate::inventory::{Auth, Inventory, Machine};

#[derive(Debug, Deserialize)]
struct RawDocument {
    #[serde(default)]
    machines: Vec<RawMachine>,
    #[serde(default)]
    actions: Vec<RawAction>,
}

#[derive(Debug, Deserialize)]
struct RawMachine {
    name: String,
    host: String,
    #[serde(default = "default_port")]
    port: i64,
    user: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    private_key_path: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

fn default_port() -> i64 {
    22
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum RawKind {
    Command,
    Script,
    TemplateDeploy,
    TemplateEvaluate,
    TemplateValidate,
    TemplateCleanup,
}

#[derive(Debug, Deserialize, Default)]
struct RawTarget {
    #[serde(default)]
    names: Option<Vec<String>>,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default)]
struct RawTemplate {
    source: String,
    destination: String,
    #[serde(default)]
    validate: bool,
    #[serde(default)]
    backup: bool,
    #[serde(default)]
    permissions: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    group: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAction {
    name: String,
    kind: RawKind,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    template: Option<RawTemplate>,
    #[serde(default)]
    target: RawTarget,
    #[serde(default)]
    parallel: bool,
    #[serde(default = "default_timeout")]
    timeout_seconds: u64,
}

fn default_timeout() -> u64 {
    30
}

/// Loads a YAML document from `path` into a validated `Inventory` and
/// `ActionCatalog`.
pub fn load_from_path(path: &Path) -> Result<(Inventory, ActionCatalog), ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    load_from_str(&text)
}

pub fn load_from_str(text: &str) -> Result<(Inventory, ActionCatalog), ConfigError> {
    let doc: RawDocument = serde_yaml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let mut seen_machines = HashSet::new();
    let mut machines = Vec::with_capacity(doc.machines.len());
    for raw in doc.machines {
        if !seen_machines.insert(raw.name.clone()) {
            return Err(ConfigError::DuplicateMachineName(raw.name));
        }
        machines.push(to_machine(raw)?);
    }
    let inventory = Inventory::new(machines).map_err(ConfigError::Parse)?;

    let mut seen_actions = HashSet::new();
    let mut actions = Vec::with_capacity(doc.actions.len());
    for raw in doc.actions {
        if !seen_actions.insert(raw.name.clone()) {
            return Err(ConfigError::DuplicateActionName(raw.name));
        }
        actions.push(to_action(raw)?);
    }
    let catalog = ActionCatalog::new(actions).map_err(ConfigError::Parse)?;

    Ok((inventory, catalog))
}

fn to_machine(raw: RawMachine) -> Result<Machine, ConfigError> {
    if !(1..=65535).contains(&raw.port) {
        return Err(ConfigError::BadPort {
            machine: raw.name,
            port: raw.port,
        });
    }
    let auth = match (raw.private_key_path, raw.password) {
        (Some(key), Some(password)) => Auth::Both {
            private_key_path: key,
            password,
        },
        (Some(key), None) => Auth::PrivateKeyPath(key),
        (None, Some(password)) => Auth::Password(password),
        (None, None) => {
            return Err(ConfigError::NoAuthMethod { machine: raw.name });
        }
    };
    for (k, v) in &raw.tags {
        if k.is_empty() || v.is_empty() {
            return Err(ConfigError::BadTag(raw.name.clone()));
        }
    }
    Ok(Machine {
        name: raw.name,
        host: raw.host,
        port: raw.port as u16,
        user: raw.user,
        auth,
        tags: raw.tags,
    })
}

fn to_action(raw: RawAction) -> Result<Action, ConfigError> {
    let kind = match raw.kind {
        RawKind::Command => ActionKind::Command,
        RawKind::Script => ActionKind::Script,
        RawKind::TemplateDeploy => ActionKind::TemplateDeploy,
        RawKind::TemplateEvaluate => ActionKind::TemplateEvaluate,
        RawKind::TemplateValidate => ActionKind::TemplateValidate,
        RawKind::TemplateCleanup => ActionKind::TemplateCleanup,
    };

    let payload = match (&kind, raw.command, raw.script, raw.template) {
        (ActionKind::Command, Some(c), None, None) => Payload::Command(c),
        (ActionKind::Script, None, Some(s), None) => Payload::Script(s),
        (_, Some(_), Some(_), _) => Payload::Conflicting,
        (k, _, _, Some(t)) if k.is_template() => Payload::Template(TemplateSpec {
            source: t.source,
            destination: t.destination,
            validate: t.validate,
            backup: t.backup,
            permissions: t.permissions,
            owner: t.owner,
            group: t.group,
        }),
        _ => Payload::None,
    };

    let target = match (raw.target.names, raw.target.tags) {
        (Some(names), None) if !names.is_empty() => TargetSpec::Names(names),
        (None, Some(tags)) if !tags.is_empty() => {
            TargetSpec::Tags(tags.iter().map(|t| TagPredicate::parse(t)).collect())
        }
        (Some(names), Some(tags)) if names.is_empty() && tags.is_empty() => TargetSpec::All,
        (None, None) => TargetSpec::All,
        _ => {
            return Err(ConfigError::BadTarget {
                action: raw.name,
                predicate: "target must set exactly one of names/tags, or neither".to_string(),
            })
        }
    };

    Ok(Action {
        name: raw.name,
        kind,
        payload,
        target,
        parallel: raw.parallel,
        timeout: Duration::from_secs(raw.timeout_seconds),
    })
}
