use ahash::AHashMap as HashMap;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

pub const CONNECTED: &str = "Connected";
pub const TUNNEL_HEALTH: &str = "TunnelHealth";
pub const READY: &str = "Ready";

pub const REASON_HEALTHY: &str = "Healthy";
pub const REASON_UNHEALTHY: &str = "Unhealthy";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConditionStatus {
    True,
    False,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Condition {
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Named status conditions for every entity the controller reports on.
///
/// A condition's transition time only moves when its status flips, so that
/// repeatedly setting the same condition never produces a new status patch.
#[derive(Debug, Default)]
pub struct Conditions {
    by_name: RwLock<HashMap<String, Vec<Condition>>>,
}

// === impl ConditionStatus ===

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
        }
    }
}

impl From<bool> for ConditionStatus {
    fn from(ok: bool) -> Self {
        if ok {
            Self::True
        } else {
            Self::False
        }
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl Condition ===

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: impl Into<ConditionStatus>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status: status.into(),
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.last_transition_time = time;
        self
    }

    /// A condition holds when its status is true and its reason does not
    /// report a failure.
    pub fn holds(&self) -> bool {
        self.status == ConditionStatus::True && self.reason != REASON_UNHEALTHY
    }
}

// === impl Conditions ===

impl Conditions {
    /// Upserts `cond` by type, returning true if anything changed.
    pub fn set(&self, name: &str, mut cond: Condition) -> bool {
        let mut by_name = self.by_name.write();
        let conds = by_name.entry(name.to_string()).or_default();
        match conds.iter_mut().find(|c| c.type_ == cond.type_) {
            Some(existing) => {
                if existing.status == cond.status {
                    cond.last_transition_time = existing.last_transition_time;
                }
                if *existing == cond {
                    return false;
                }
                *existing = cond;
            }
            None => conds.push(cond),
        }
        true
    }

    pub fn get(&self, name: &str) -> Vec<Condition> {
        self.by_name.read().get(name).cloned().unwrap_or_default()
    }

    pub fn find(&self, name: &str, type_: &str) -> Option<Condition> {
        self.by_name
            .read()
            .get(name)?
            .iter()
            .find(|c| c.type_ == type_)
            .cloned()
    }

    pub fn is_true(&self, name: &str, type_: &str) -> bool {
        self.find(name, type_)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    /// Checks that every `required` condition holds.
    ///
    /// On failure, returns the first failing condition's reason, or its type
    /// if it is unset or has no reason.
    pub fn ready(&self, name: &str, required: &[&str]) -> (bool, String) {
        let by_name = self.by_name.read();
        let conds = by_name.get(name).map(Vec::as_slice).unwrap_or_default();
        for type_ in required {
            match conds.iter().find(|c| c.type_ == *type_) {
                Some(c) if c.holds() => {}
                Some(c) if !c.reason.is_empty() => return (false, c.reason.clone()),
                _ => return (false, type_.to_string()),
            }
        }
        (true, String::new())
    }

    pub fn delete(&self, name: &str) {
        self.by_name.write().remove(name);
    }

    pub fn names(&self) -> Vec<String> {
        self.by_name.read().keys().cloned().collect()
    }
}
