// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Resolves an action's target spec to a deduplicated machine list (C3,
//! `spec.md` §4.3).

use crate::action::{Action, TagPredicate, TargetSpec};
use crate::error::SelectionError;
use crate::index::CompositeIndex;
use crate::inventory::{Inventory, Machine};

/// A resolved target: a stable reference into the inventory plus a borrowed
/// view of the machine itself, so callers never need to re-look-up by name.
#[derive(Debug, Clone, Copy)]
pub struct MachineRef<'a> {
    pub index: usize,
    pub machine: &'a Machine,
}

pub fn select<'a>(
    action: &Action,
    inventory: &'a Inventory,
    index: &CompositeIndex,
) -> Result<Vec<MachineRef<'a>>, SelectionError> {
    match &action.target {
        TargetSpec::Names(names) => select_by_names(action, names, inventory),
        TargetSpec::Tags(predicates) => Ok(select_by_tags(predicates, inventory, index)),
        TargetSpec::All => Ok(inventory
            .machines()
            .iter()
            .enumerate()
            .map(|(index, machine)| MachineRef { index, machine })
            .collect()),
    }
}

fn select_by_names<'a>(
    action: &Action,
    names: &[String],
    inventory: &'a Inventory,
) -> Result<Vec<MachineRef<'a>>, SelectionError> {
    let mut out = Vec::with_capacity(names.len());
    let mut seen = std::collections::HashSet::new();
    for name in names {
        let index = inventory.index_of(name).ok_or_else(|| SelectionError::UnknownMachine {
            action: action.name.clone(),
            machine: name.clone(),
        })?;
        if seen.insert(index) {
            out.push(MachineRef {
                index,
                machine: &inventory.machines()[index],
            });
        }
    }
    Ok(out)
}

fn select_by_tags<'a>(
    predicates: &[TagPredicate],
    inventory: &'a Inventory,
    index: &CompositeIndex,
) -> Vec<MachineRef<'a>> {
    if predicates.is_empty() {
        return Vec::new();
    }

    // Sort by descending popularity of the predicate's key for early culling
    // (§4.3 step 1). Popularity is read from the index, not recomputed.
    let mut ordered: Vec<&TagPredicate> = predicates.iter().collect();
    ordered.sort_by_key(|p| std::cmp::Reverse(index.tag_popularity.get(p.key()).copied().unwrap_or(0)));

    let mut candidates: Option<std::collections::HashSet<usize>> = None;
    for predicate in ordered {
        let matches: std::collections::HashSet<usize> = match predicate {
            TagPredicate::KeyValue(k, v) => index
                .by_tag_kv
                .get(&format!("{k}={v}"))
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .collect(),
            TagPredicate::Key(k) => index.machines_with_key(k, inventory).into_iter().collect(),
        };

        candidates = Some(match candidates {
            None => matches,
            Some(existing) => existing.intersection(&matches).copied().collect(),
        });

        if candidates.as_ref().is_some_and(|c| c.is_empty()) {
            break;
        }
    }

    let mut refs: Vec<MachineRef<'a>> = candidates
        .unwrap_or_default()
        .into_iter()
        .map(|idx| MachineRef {
            index: idx,
            machine: &inventory.machines()[idx],
        })
        .collect();
    // Order is implementation-defined but must be stable within a run;
    // sorting by index achieves that deterministically.
    refs.sort_by_key(|r| r.index);
    refs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionKind, Payload};
    use crate::index::{build_content_hash, TargetIndex};
    use crate::inventory::{Auth, Machine};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn inventory_of(n: usize, role_web_until: usize) -> Inventory {
        let machines = (0..n)
            .map(|i| {
                let mut tags = BTreeMap::new();
                tags.insert("env".to_string(), "prod".to_string());
                if i < role_web_until {
                    tags.insert("role".to_string(), "web".to_string());
                }
                Machine {
                    name: format!("m{i}"),
                    host: format!("10.0.0.{i}"),
                    port: 22,
                    user: "u".to_string(),
                    auth: Auth::Password("p".to_string()),
                    tags,
                }
            })
            .collect();
        Inventory::new(machines).unwrap()
    }

    fn action_with_target(target: TargetSpec) -> Action {
        Action {
            name: "a".to_string(),
            kind: ActionKind::Command,
            payload: Payload::Command("echo hi".to_string()),
            target,
            parallel: false,
            timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn unknown_name_is_an_error() {
        let inv = inventory_of(2, 1);
        let idx = TargetIndex::new();
        let catalog = crate::action::ActionCatalog::new(vec![]).unwrap();
        let hash = build_content_hash(&inv, &catalog);
        let action = action_with_target(TargetSpec::Names(vec!["ghost".to_string()]));
        idx.get_or_build(&inv, hash, |index| {
            let err = select(&action, &inv, index).unwrap_err();
            assert!(matches!(err, SelectionError::UnknownMachine { .. }));
        });
    }

    #[test]
    fn all_returns_declaration_order() {
        let inv = inventory_of(3, 0);
        let idx = TargetIndex::new();
        let catalog = crate::action::ActionCatalog::new(vec![]).unwrap();
        let hash = build_content_hash(&inv, &catalog);
        let action = action_with_target(TargetSpec::All);
        idx.get_or_build(&inv, hash, |index| {
            let result = select(&action, &inv, index).unwrap();
            let names: Vec<_> = result.iter().map(|r| r.machine.name.as_str()).collect();
            assert_eq!(names, vec!["m0", "m1", "m2"]);
        });
    }

    #[test]
    fn intersection_of_two_tag_predicates() {
        // 100 machines, 60 env=prod (all of them), 40 role=web (first 40), 10 overlap
        // is not directly expressible with this helper; build explicitly per S6.
        let mut machines = Vec::new();
        for i in 0..100 {
            let mut tags = BTreeMap::new();
            if i < 60 {
                tags.insert("env".to_string(), "prod".to_string());
            }
            if (50..90).contains(&i) {
                tags.insert("role".to_string(), "web".to_string());
            }
            machines.push(Machine {
                name: format!("m{i}"),
                host: format!("10.0.0.{i}"),
                port: 22,
                user: "u".to_string(),
                auth: Auth::Password("p".to_string()),
                tags,
            });
        }
        let inv = Inventory::new(machines).unwrap();
        let idx = TargetIndex::new();
        let catalog = crate::action::ActionCatalog::new(vec![]).unwrap();
        let hash = build_content_hash(&inv, &catalog);
        let action = action_with_target(TargetSpec::Tags(vec![
            TagPredicate::parse("env=prod"),
            TagPredicate::parse("role=web"),
        ]));
        idx.get_or_build(&inv, hash, |index| {
            let result = select(&action, &inv, index).unwrap();
            assert_eq!(result.len(), 10);
        });
    }

    #[test]
    fn bare_key_predicate_matches_any_nonempty_value() {
        let inv = inventory_of(3, 2);
        let idx = TargetIndex::new();
        let catalog = crate::action::ActionCatalog::new(vec![]).unwrap();
        let hash = build_content_hash(&inv, &catalog);
        let action = action_with_target(TargetSpec::Tags(vec![TagPredicate::parse("role")]));
        idx.get_or_build(&inv, hash, |index| {
            let result = select(&action, &inv, index).unwrap();
            assert_eq!(result.len(), 2);
        });
    }
}
