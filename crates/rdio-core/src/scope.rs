//! Credential scopes over systems and talkgroups
//!
//! Access codes, upload keys and downstream relays all carry the same scope
//! shape. On the wire it is either the string `"*"` or a list of
//! `{"id": <systemRef>, "talkgroups": "*" | [<talkgroupRef>, ...]}` entries.
//! Anything else decodes to an empty list, which grants nothing.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};
use std::collections::BTreeSet;

const WILDCARD: &str = "*";

/// Talkgroups covered within one system
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TalkgroupScope {
    /// Every talkgroup in the system
    Wildcard,
    /// Only the listed talkgroup references
    List(BTreeSet<u32>),
}

/// One system entry of a [`Scope::List`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemScope {
    /// System reference
    pub system_ref: u32,
    /// Talkgroups covered within the system
    pub talkgroups: TalkgroupScope,
}

/// Systems and talkgroups a credential covers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Every system and talkgroup
    Wildcard,
    /// Only the listed systems
    List(Vec<SystemScope>),
}

impl Scope {
    /// A scope that covers nothing
    #[must_use]
    pub const fn deny() -> Self {
        Self::List(Vec::new())
    }

    /// Whether this scope covers `talkgroup_ref` within `system_ref`
    #[must_use]
    pub fn has_access(&self, system_ref: u32, talkgroup_ref: u32) -> bool {
        match self {
            Self::Wildcard => true,
            Self::List(systems) => systems.iter().any(|entry| {
                entry.system_ref == system_ref
                    && match &entry.talkgroups {
                        TalkgroupScope::Wildcard => true,
                        TalkgroupScope::List(refs) => refs.contains(&talkgroup_ref),
                    }
            }),
        }
    }

    /// Whether this scope covers at least part of `system_ref`
    #[must_use]
    pub fn covers_system(&self, system_ref: u32) -> bool {
        match self {
            Self::Wildcard => true,
            Self::List(systems) => systems.iter().any(|entry| entry.system_ref == system_ref),
        }
    }

    /// Decode from the JSON wire form
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(s) if s == WILDCARD => Self::Wildcard,
            Value::Array(entries) => Self::List(entries.iter().filter_map(system_scope).collect()),
            _ => Self::deny(),
        }
    }

    /// Encode to the JSON wire form
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Wildcard => json!(WILDCARD),
            Self::List(systems) => Value::Array(
                systems
                    .iter()
                    .map(|entry| {
                        let talkgroups = match &entry.talkgroups {
                            TalkgroupScope::Wildcard => json!(WILDCARD),
                            TalkgroupScope::List(refs) => json!(refs),
                        };
                        json!({ "id": entry.system_ref, "talkgroups": talkgroups })
                    })
                    .collect(),
            ),
        }
    }
}

fn system_scope(entry: &Value) -> Option<SystemScope> {
    let system_ref = u32::try_from(entry.get("id")?.as_u64()?).ok()?;
    let talkgroups = match entry.get("talkgroups")? {
        Value::String(s) if s == WILDCARD => TalkgroupScope::Wildcard,
        Value::Array(refs) => TalkgroupScope::List(
            refs.iter()
                .filter_map(Value::as_u64)
                .filter_map(|r| u32::try_from(r).ok())
                .collect(),
        ),
        _ => return None,
    };
    Some(SystemScope {
        system_ref,
        talkgroups,
    })
}

impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::from_value(&value))
    }
}
