use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Three-way verdict assigned once per detection event.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Violation,
    NonViolation,
    Normal,
}

impl ComplianceStatus {
    pub const ALL: [ComplianceStatus; 3] = [
        ComplianceStatus::Violation,
        ComplianceStatus::NonViolation,
        ComplianceStatus::Normal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceStatus::Violation => "violation",
            ComplianceStatus::NonViolation => "non_violation",
            ComplianceStatus::Normal => "normal",
        }
    }
}

impl fmt::Display for ComplianceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComplianceStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "violation" => Ok(ComplianceStatus::Violation),
            "non_violation" => Ok(ComplianceStatus::NonViolation),
            "normal" => Ok(ComplianceStatus::Normal),
            other => Err(anyhow!("unknown overall status '{}'", other)),
        }
    }
}

/// Label sets driving the classifier.
///
/// Violation labels always win over safe labels; anything outside both sets
/// is ignored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRules {
    pub violation: BTreeSet<String>,
    pub safe: BTreeSet<String>,
}

impl Default for LabelRules {
    fn default() -> Self {
        Self {
            violation: ["no_glove", "no_goggles"]
                .into_iter()
                .map(String::from)
                .collect(),
            safe: ["glove", "goggles"].into_iter().map(String::from).collect(),
        }
    }
}

impl LabelRules {
    pub fn new<V, S>(violation: V, safe: S) -> Result<Self>
    where
        V: IntoIterator,
        V::Item: AsRef<str>,
        S: IntoIterator,
        S::Item: AsRef<str>,
    {
        let rules = Self {
            violation: normalize(violation),
            safe: normalize(safe),
        };
        rules.validate()?;
        Ok(rules)
    }

    pub fn validate(&self) -> Result<()> {
        if self.violation.is_empty() {
            return Err(anyhow!("violation label set must not be empty"));
        }
        if self.safe.is_empty() {
            return Err(anyhow!("safe label set must not be empty"));
        }
        if let Some(label) = self.violation.intersection(&self.safe).next() {
            return Err(anyhow!(
                "label '{}' cannot be both a violation and a safe label",
                label
            ));
        }
        Ok(())
    }

    pub fn is_violation(&self, label: &str) -> bool {
        self.violation.contains(label.trim())
    }

    pub fn is_safe(&self, label: &str) -> bool {
        self.safe.contains(label.trim())
    }
}

fn normalize<I>(labels: I) -> BTreeSet<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    labels
        .into_iter()
        .map(|label| label.as_ref().trim().to_string())
        .filter(|label| !label.is_empty())
        .collect()
}

/// Classify a frame from its detected labels. First matching rule wins.
pub fn classify<I>(rules: &LabelRules, labels: I) -> ComplianceStatus
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut saw_safe = false;
    for label in labels {
        let label = label.as_ref();
        if rules.is_violation(label) {
            return ComplianceStatus::Violation;
        }
        saw_safe |= rules.is_safe(label);
    }
    if saw_safe {
        ComplianceStatus::NonViolation
    } else {
        ComplianceStatus::Normal
    }
}
