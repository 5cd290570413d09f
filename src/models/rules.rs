use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Descriptive metadata for a single scan rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMetadata {
    pub rule_id: String,
    pub severity: String,
    #[serde(default)]
    pub category: Option<String>,
    /// Standard name -> control identifiers
    #[serde(default)]
    pub standards: BTreeMap<String, Vec<String>>,
    /// MITRE tactic -> technique identifiers
    #[serde(default)]
    pub mitre: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub remediation: Option<String>,
}

/// Version metadata of a compiled ruleset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulesetMetadata {
    pub ruleset_id: String,
    pub name: String,
    pub version: String,
    pub cloud: String,
    #[serde(default)]
    pub rules: Vec<String>,
    #[serde(default)]
    pub license_keys: Vec<String>,
}

/// Reference to a downloadable compiled ruleset artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub ruleset_id: String,
    pub version: String,
    /// Hex SHA-256 of the artifact, when the authority publishes it
    #[serde(default)]
    pub sha256: Option<String>,
}

impl ArtifactRef {
    /// Object-store key under which the artifact is kept.
    pub fn object_key(&self) -> String {
        format!("rulesets/{}/{}.zip", self.ruleset_id, self.version)
    }
}
