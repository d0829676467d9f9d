// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};

/// One of the two authentication methods a [`Machine`] may offer. At least
/// one must be present; both may be, in which case key auth is attempted
/// first (see [`crate::ssh`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    Password(String),
    PrivateKeyPath(String),
    Both {
        private_key_path: String,
        password: String,
    },
}

impl Auth {
    pub fn private_key_path(&self) -> Option<&str> {
        match self {
            Auth::PrivateKeyPath(p) | Auth::Both { private_key_path: p, .. } => Some(p),
            Auth::Password(_) => None,
        }
    }

    pub fn password(&self) -> Option<&str> {
        match self {
            Auth::Password(p) | Auth::Both { password: p, .. } => Some(p),
            Auth::PrivateKeyPath(_) => None,
        }
    }
}

/// A single target machine. Immutable once constructed; `Inventory::new`
/// is the only place invariants (§3 of the spec) are checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: Auth,
    pub tags: BTreeMap<String, String>,
}

impl Machine {
    /// True iff this machine has `key` set to a non-empty value.
    pub fn has_tag_key(&self, key: &str) -> bool {
        self.tags.get(key).is_some_and(|v| !v.is_empty())
    }

    /// True iff this machine has `key=value` with a non-empty value.
    pub fn has_tag_kv(&self, key: &str, value: &str) -> bool {
        self.tags.get(key).is_some_and(|v| v == value && !v.is_empty())
    }
}

/// An ordered, name-unique collection of [`Machine`]s. Declaration order is
/// preserved because the "all machines" selection (§4.3) must return it.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    machines: Vec<Machine>,
    by_name: HashMap<String, usize>,
}

impl Inventory {
    /// Builds an inventory, checking the name-uniqueness invariant and
    /// building the name -> index map `by_name`/`index_of` rely on for O(1)
    /// lookup (§4.3). Port range and auth-method invariants are expected to
    /// already hold (the config adapter checks them at load time per
    /// `SPEC_FULL.md` §7).
    pub fn new(machines: Vec<Machine>) -> Result<Self, String> {
        let mut by_name = HashMap::with_capacity(machines.len());
        for (index, m) in machines.iter().enumerate() {
            if by_name.insert(m.name.clone(), index).is_some() {
                return Err(format!("duplicate machine name: {}", m.name));
            }
        }
        Ok(Self { machines, by_name })
    }

    pub fn machines(&self) -> &[Machine] {
        &self.machines
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn by_name(&self, name: &str) -> Option<&Machine> {
        self.by_name.get(name).map(|&index| &self.machines[index])
    }

    /// O(1) name -> declaration-order index lookup, used by the selector so
    /// it never re-scans the inventory after resolving a machine by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(name: &str) -> Machine {
        Machine {
            name: name.to_string(),
            host: "10.0.0.1".to_string(),
            port: 22,
            user: "u".to_string(),
            auth: Auth::Password("p".to_string()),
            tags: BTreeMap::new(),
        }
    }

    #[test]
    fn rejects_duplicate_names() {
        let err = Inventory::new(vec![machine("a"), machine("a")]).unwrap_err();
        assert!(err.contains("duplicate machine name"));
    }

    #[test]
    fn preserves_declaration_order() {
        let inv = Inventory::new(vec![machine("b"), machine("a")]).unwrap();
        let names: Vec<_> = inv.machines().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn bare_tag_requires_non_empty_value() {
        let mut m = machine("a");
        m.tags.insert("role".to_string(), String::new());
        assert!(!m.has_tag_key("role"));
    }
}
