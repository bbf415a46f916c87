//! Automation rules derived from backend command payloads.
//!
//! Condition strings arrive as companion fields of an action frame, e.g.
//! `"temp>10<20"` or `"soil=40"`. The grammar is tiny: an optional `=` for
//! exact match (checked first), otherwise `>` and/or `<` with numeric
//! bounds. A bound that is present but not numeric parses as `0.0` — the
//! deployed firmware behaved this way and downstream tooling depends on it,
//! so the parser preserves it rather than rejecting the rule.

use serde::{Deserialize, Serialize};

/// Condition kind for a rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RuleKind {
    ExactMatch {
        value: f64,
    },
    RangeCondition {
        lower: Option<f64>,
        upper: Option<f64>,
    },
}

/// A persisted condition over a named sensor value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AutomationRule {
    pub id: String,
    pub sensor_key: String,
    #[serde(flatten)]
    pub kind: RuleKind,
}

impl AutomationRule {
    /// Whether a sensor reading satisfies this rule. Absent range bounds are
    /// unconstrained on that side.
    pub fn matches(&self, value: f64) -> bool {
        match self.kind {
            RuleKind::ExactMatch { value: expected } => value == expected,
            RuleKind::RangeCondition { lower, upper } => {
                lower.map(|l| value > l).unwrap_or(true)
                    && upper.map(|u| value < u).unwrap_or(true)
            }
        }
    }
}

/// Parses a condition string into a rule with the given id.
///
/// Returns `None` only for strings containing no operator at all.
pub fn parse_condition(id: &str, condition: &str) -> Option<AutomationRule> {
    let condition = condition.trim();

    // Equality has priority over range operators.
    if let Some((key, raw)) = condition.split_once('=') {
        return Some(AutomationRule {
            id: id.to_string(),
            sensor_key: key.trim().to_string(),
            kind: RuleKind::ExactMatch {
                value: parse_bound(raw),
            },
        });
    }

    let gt = condition.find('>');
    let lt = condition.find('<');

    let key_end = match (gt, lt) {
        (Some(g), Some(l)) => g.min(l),
        (Some(g), None) => g,
        (None, Some(l)) => l,
        (None, None) => return None,
    };
    let sensor_key = condition[..key_end].trim().to_string();

    let lower = gt.map(|g| {
        let end = match lt {
            Some(l) if l > g => l,
            _ => condition.len(),
        };
        parse_bound(&condition[g + 1..end])
    });
    let upper = lt.map(|l| {
        let end = match gt {
            Some(g) if g > l => g,
            _ => condition.len(),
        };
        parse_bound(&condition[l + 1..end])
    });

    Some(AutomationRule {
        id: id.to_string(),
        sensor_key,
        kind: RuleKind::RangeCondition { lower, upper },
    })
}

// Non-numeric content defaults to 0.0; see module docs.
fn parse_bound(raw: &str) -> f64 {
    raw.trim().parse().unwrap_or(0.0)
}

/// One entry of the backend's automation name/id index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub name: String,
    pub id: String,
}

/// Parses the `/automations` response format: `name:id,name:id,...`.
/// Malformed segments are skipped.
pub fn parse_name_id_index(raw: &str) -> Vec<IndexEntry> {
    raw.split(',')
        .filter_map(|segment| {
            let (name, id) = segment.split_once(':')?;
            let name = name.trim();
            let id = id.trim();
            if name.is_empty() || id.is_empty() {
                return None;
            }
            Some(IndexEntry {
                name: name.to_string(),
                id: id.to_string(),
            })
        })
        .collect()
}

/// One reference entity from the `/masterList` endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterEntry {
    pub key: String,
    pub name: String,
    pub id: String,
}
