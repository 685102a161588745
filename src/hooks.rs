//! Hook patterns and block matching
//!
//! A hook names one remote event. `Contract.Event` matches any occurrence;
//! `Contract.Event:field` additionally reads `field` from the event's
//! arguments to identify which object the event concerns.
//!
//! The same scan serves two purposes. For a concrete watch it answers "does
//! this block touch my key"; for a wildcard watch it reports every key that
//! appears, which is how newly created objects are discovered.

use crate::error::SyncError;
use crate::logs::EventLogEntry;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Primary key of a cached object.
pub type ObjectId = u64;

/// What a watch is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WatchTarget {
    /// Any instance; matches report the key they carry.
    Any,
    /// One specific instance.
    Key(ObjectId),
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchTarget::Any => write!(f, "*"),
            WatchTarget::Key(key) => write!(f, "{}", key),
        }
    }
}

/// Parsed `Contract.Event[:field]` hook.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HookPattern {
    pub contract: String,
    pub event: String,
    pub index_field: Option<String>,
}

impl HookPattern {
    pub fn new(contract: &str, event: &str, index_field: Option<&str>) -> Self {
        Self {
            contract: contract.to_string(),
            event: event.to_string(),
            index_field: index_field.map(str::to_string),
        }
    }

    /// Fully-qualified event name, `Contract.Event`.
    pub fn fqn(&self) -> String {
        format!("{}.{}", self.contract, self.event)
    }

    fn matches_event(&self, event: &EventLogEntry) -> bool {
        event.contract_name == self.contract && event.event_name == self.event
    }
}

impl FromStr for HookPattern {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || SyncError::MalformedHook(s.to_string());

        let (fqn, index_field) = match s.split_once(':') {
            Some((fqn, field)) => {
                if field.is_empty() || field.contains(':') {
                    return Err(malformed());
                }
                (fqn, Some(field))
            }
            None => (s, None),
        };

        let (contract, event) = fqn.split_once('.').ok_or_else(malformed)?;
        if contract.is_empty() || event.is_empty() || event.contains('.') {
            return Err(malformed());
        }

        Ok(Self::new(contract, event, index_field))
    }
}

impl fmt::Display for HookPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.index_field {
            Some(field) => write!(f, "{}.{}:{}", self.contract, self.event, field),
            None => write!(f, "{}.{}", self.contract, self.event),
        }
    }
}

/// Coerce an event argument to an object key.
///
/// Accepts JSON numbers, decimal or `0x` hex strings, and booleans.
/// Anything else (negative, fractional, oversized) yields `None`.
pub fn as_object_id(value: &Value) -> Option<ObjectId> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
        }),
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            }
        }
        Value::Bool(b) => Some(u64::from(*b)),
        _ => None,
    }
}

/// Check one hook against a block's events.
///
/// - Without an index field: `true` iff some event has the hook's name.
/// - With an index field and a concrete target: `true` iff some matching
///   event carries the target key.
/// - With an index field and [`WatchTarget::Any`]: `on_discover` is called
///   once per matching event with the key it carries (`None` if the field is
///   absent or not numeric) and the result is always `false`.
pub fn match_hook<F>(
    pattern: &HookPattern,
    events: &[EventLogEntry],
    target: WatchTarget,
    mut on_discover: F,
) -> bool
where
    F: FnMut(Option<ObjectId>),
{
    let Some(field) = &pattern.index_field else {
        return events.iter().any(|event| pattern.matches_event(event));
    };

    for event in events.iter().filter(|event| pattern.matches_event(event)) {
        let id = event.args.get(field).and_then(as_object_id);
        match target {
            WatchTarget::Any => on_discover(id),
            WatchTarget::Key(key) => {
                if id == Some(key) {
                    return true;
                }
            }
        }
    }
    false
}

/// Check hooks in declaration order, stopping at the first match.
pub fn match_hooks<F>(
    patterns: &[HookPattern],
    events: &[EventLogEntry],
    target: WatchTarget,
    mut on_discover: F,
) -> bool
where
    F: FnMut(Option<ObjectId>),
{
    patterns
        .iter()
        .any(|pattern| match_hook(pattern, events, target, &mut on_discover))
}
