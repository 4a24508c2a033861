//! Persisted data model for the knowledge base and goal set.
//!
//! These types define the on-disk JSON contract. Field order is the
//! serialization order, so changing it changes every state file written
//! afterwards.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version stamped into freshly created knowledge bases.
pub const KNOWLEDGE_VERSION: &str = "1.0";

/// Something the agent noticed during a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
}

/// How strongly the agent believes a lesson.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
    #[default]
    #[serde(rename = "")]
    Unspecified,
}

impl Confidence {
    /// Parse a wire value; anything unrecognized maps to `Unspecified`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => Self::High,
            "medium" => Self::Medium,
            "low" => Self::Low,
            _ => Self::Unspecified,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Unspecified => "",
        }
    }

    pub fn is_unspecified(&self) -> bool {
        *self == Self::Unspecified
    }
}

/// A codified pattern or rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    #[serde(default, skip_serializing_if = "Confidence::is_unspecified")]
    pub confidence: Confidence,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HypothesisStatus {
    #[default]
    Testing,
    Validated,
    Rejected,
}

/// A theory the agent is testing across cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    pub status: HypothesisStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effectiveness {
    Works,
    Partial,
    Failed,
    #[default]
    #[serde(rename = "")]
    Unknown,
}

impl Effectiveness {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Works => "works",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::Unknown => "",
        }
    }

    pub fn is_unknown(&self) -> bool {
        *self == Self::Unknown
    }
}

/// An approach the agent uses to accomplish goals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strategy {
    pub name: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    #[serde(default, skip_serializing_if = "Effectiveness::is_unknown")]
    pub effectiveness: Effectiveness,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeMeta {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Count of completed cycles since creation. Never decreases.
    pub total_cycles: u64,
}

/// The agent's self-managed memory (`context.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeBase {
    #[serde(default)]
    pub observations: Vec<Observation>,
    #[serde(default)]
    pub lessons: Vec<Lesson>,
    #[serde(default)]
    pub hypotheses: Vec<Hypothesis>,
    #[serde(default)]
    pub strategies: Vec<Strategy>,
    pub metadata: KnowledgeMeta,
}

impl KnowledgeBase {
    /// Empty knowledge base created at `now`.
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            observations: Vec::new(),
            lessons: Vec::new(),
            hypotheses: Vec::new(),
            strategies: Vec::new(),
            metadata: KnowledgeMeta {
                version: KNOWLEDGE_VERSION.to_string(),
                created_at: now,
                updated_at: now,
                total_cycles: 0,
            },
        }
    }

    /// Number the next cycle will run under.
    pub fn next_cycle(&self) -> u64 {
        self.metadata.total_cycles + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalStatus {
    Active,
    Completed,
    Paused,
}

/// A specific objective. Goals are created and edited outside the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub id: u64,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub status: GoalStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub progress: Vec<String>,
}

impl Goal {
    pub fn is_active(&self) -> bool {
        self.status == GoalStatus::Active
    }

    pub fn latest_progress(&self) -> Option<&str> {
        self.progress.last().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalsMeta {
    pub next_id: u64,
    pub updated_at: DateTime<Utc>,
}

/// The goal set (`active-goals.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalSet {
    #[serde(default)]
    pub goals: Vec<Goal>,
    pub metadata: GoalsMeta,
}

impl GoalSet {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            goals: Vec::new(),
            metadata: GoalsMeta {
                next_id: 1,
                updated_at: now,
            },
        }
    }

    pub fn active(&self) -> impl Iterator<Item = &Goal> {
        self.goals.iter().filter(|goal| goal.is_active())
    }

    /// Check id invariants: ids are unique and `next_id` is above all of them.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        for goal in &self.goals {
            if !seen.insert(goal.id) {
                errors.push(format!("duplicate goal id {}", goal.id));
            }
            if goal.id >= self.metadata.next_id {
                errors.push(format!(
                    "goal id {} is not below next_id {}",
                    goal.id, self.metadata.next_id
                ));
            }
        }
        errors
    }
}
