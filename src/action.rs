// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// A key-only or `key=value` filter matched against a machine's tag map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TagPredicate {
    Key(String),
    KeyValue(String, String),
}

impl TagPredicate {
    /// Parses the wire form used by the config adapter and by `spec.md`'s
    /// end-to-end scenarios: a bare key, or `key=value`.
    pub fn parse(s: &str) -> Self {
        match s.split_once('=') {
            Some((k, v)) => TagPredicate::KeyValue(k.to_string(), v.to_string()),
            None => TagPredicate::Key(s.to_string()),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            TagPredicate::Key(k) => k,
            TagPredicate::KeyValue(k, _) => k,
        }
    }
}

impl std::fmt::Display for TagPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TagPredicate::Key(k) => write!(f, "{k}"),
            TagPredicate::KeyValue(k, v) => write!(f, "{k}={v}"),
        }
    }
}

/// How an action's targets are resolved (§4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSpec {
    Names(Vec<String>),
    Tags(Vec<TagPredicate>),
    All,
}

/// The remote-side effect an action performs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    Command,
    Script,
    TemplateDeploy,
    TemplateEvaluate,
    TemplateValidate,
    TemplateCleanup,
}

impl ActionKind {
    pub fn is_template(&self) -> bool {
        matches!(
            self,
            ActionKind::TemplateDeploy
                | ActionKind::TemplateEvaluate
                | ActionKind::TemplateValidate
                | ActionKind::TemplateCleanup
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Command => "command",
            ActionKind::Script => "script",
            ActionKind::TemplateDeploy => "template-deploy",
            ActionKind::TemplateEvaluate => "template-evaluate",
            ActionKind::TemplateValidate => "template-validate",
            ActionKind::TemplateCleanup => "template-cleanup",
        }
    }
}

/// Deploy/evaluate/validate/cleanup parameters (§3, §4.5).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TemplateSpec {
    pub source: String,
    pub destination: String,
    pub validate: bool,
    pub backup: bool,
    pub permissions: Option<String>,
    pub owner: Option<String>,
    pub group: Option<String>,
}

/// The payload a command/script/template action carries. Kept as a single
/// enum (rather than three optional fields on `Action`) so "exactly one
/// applies per kind" is expressed in the type rather than re-checked ad hoc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Command(String),
    Script(String),
    Template(TemplateSpec),
    /// Both `command` and `script` were set in the source data; kept so
    /// the executor's pre-execution validation (§4.4) can produce the
    /// `ConflictingPayload` error rather than silently picking one.
    Conflicting,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub name: String,
    pub kind: ActionKind,
    pub payload: Payload,
    pub target: TargetSpec,
    pub parallel: bool,
    pub timeout: Duration,
}

/// An ordered, name-unique collection of [`Action`]s, iterated by the
/// Orchestrator in declaration order (§4.6).
#[derive(Debug, Clone, Default)]
pub struct ActionCatalog {
    actions: Vec<Action>,
}

impl ActionCatalog {
    pub fn new(actions: Vec<Action>) -> Result<Self, String> {
        let mut seen = std::collections::HashSet::new();
        for a in &actions {
            if !seen.insert(a.name.clone()) {
                return Err(format!("duplicate action name: {}", a.name));
            }
        }
        Ok(Self { actions })
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_predicate_parses_bare_key() {
        assert_eq!(TagPredicate::parse("role"), TagPredicate::Key("role".into()));
    }

    #[test]
    fn tag_predicate_parses_key_value() {
        assert_eq!(
            TagPredicate::parse("role=web"),
            TagPredicate::KeyValue("role".into(), "web".into())
        );
    }

    #[test]
    fn catalog_rejects_duplicate_names() {
        let a = Action {
            name: "ping".into(),
            kind: ActionKind::Command,
            payload: Payload::Command("echo hi".into()),
            target: TargetSpec::All,
            parallel: false,
            timeout: Duration::from_secs(30),
        };
        let err = ActionCatalog::new(vec![a.clone(), a]).unwrap_err();
        assert!(err.contains("duplicate action name"));
    }
}
