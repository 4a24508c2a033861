//! Memory mutation commands: validation and application.
//!
//! The agent rewrites its own knowledge base by emitting a block of commands.
//! Each command is checked on its own; a bad command is skipped and reported
//! without affecting its neighbours.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use jsonschema::Validator;
use serde_json::{Map, Value};

use crate::core::types::{
    Confidence, Hypothesis, HypothesisStatus, KnowledgeBase, Lesson, Observation, Strategy,
};

const COMMAND_SCHEMA: &str = include_str!("../../schemas/memory_command.schema.json");

static COMMAND_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(COMMAND_SCHEMA).expect("memory command schema should be valid json");
    jsonschema::validator_for(&schema).expect("memory command schema should compile")
});

/// A validated knowledge-base mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    AddObservation {
        content: String,
    },
    AddLesson {
        content: String,
        confidence: Confidence,
    },
    AddHypothesis {
        content: String,
    },
    AddStrategy {
        name: String,
        description: String,
    },
    PruneOld,
}

impl Mutation {
    /// Wire name of the command kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddObservation { .. } => "add_observation",
            Self::AddLesson { .. } => "add_lesson",
            Self::AddHypothesis { .. } => "add_hypothesis",
            Self::AddStrategy { .. } => "add_strategy",
            Self::PruneOld => "prune_old",
        }
    }
}

/// A command that passed validation, with the agent's stated reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidCommand {
    pub mutation: Mutation,
    pub reason: String,
}

/// A command that was dropped, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedCommand {
    /// Position in the block (0-indexed).
    pub index: usize,
    /// The `command` field, if one could be read.
    pub kind: Option<String>,
    pub error: String,
}

/// Outcome of validating one command block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidatedBlock {
    pub valid: Vec<ValidCommand>,
    pub skipped: Vec<SkippedCommand>,
}

impl ValidatedBlock {
    pub fn has_valid(&self) -> bool {
        !self.valid.is_empty()
    }
}

/// Validate every element of an extracted block.
pub fn validate_block(items: &[Value]) -> ValidatedBlock {
    let mut block = ValidatedBlock::default();
    for (index, item) in items.iter().enumerate() {
        match validate_command(item) {
            Ok(command) => block.valid.push(command),
            Err(error) => block.skipped.push(SkippedCommand {
                index,
                kind: item
                    .get("command")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                error,
            }),
        }
    }
    block
}

/// Validate one raw command object against the command schema and convert it.
pub fn validate_command(item: &Value) -> Result<ValidCommand, String> {
    let messages: Vec<String> = COMMAND_VALIDATOR
        .iter_errors(item)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(messages.join("; "));
    }

    let object = item
        .as_object()
        .ok_or_else(|| "command must be an object".to_string())?;
    let kind = object
        .get("command")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing command".to_string())?;
    let reason = object
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let empty = Map::new();
    let data = object
        .get("data")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let mutation = match kind {
        "add_observation" => Mutation::AddObservation {
            content: required_text(data, "content")?,
        },
        "add_lesson" => Mutation::AddLesson {
            content: required_text(data, "content")?,
            confidence: data
                .get("confidence")
                .and_then(Value::as_str)
                .map(Confidence::parse)
                .unwrap_or_default(),
        },
        "add_hypothesis" => Mutation::AddHypothesis {
            content: required_text(data, "content")?,
        },
        "add_strategy" => Mutation::AddStrategy {
            name: required_text(data, "name")?,
            description: required_text(data, "description")?,
        },
        "prune_old" => Mutation::PruneOld,
        other => return Err(format!("unknown memory command '{other}'")),
    };

    Ok(ValidCommand { mutation, reason })
}

fn required_text(data: &Map<String, Value>, field: &str) -> Result<String, String> {
    match data.get(field) {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(_) => Err(format!("'{field}' must be a string")),
        None => Err(format!("missing required field '{field}'")),
    }
}

/// Per-cycle inputs for applying mutations.
#[derive(Debug, Clone, Copy)]
pub struct ApplyContext {
    pub cycle: u64,
    pub now: DateTime<Utc>,
    /// Observation cap honoured by `prune_old`. `None` makes it a no-op.
    pub keep_recent_observations: Option<usize>,
}

/// Apply one mutation to the in-memory knowledge base.
pub fn apply_mutation(kb: &mut KnowledgeBase, mutation: &Mutation, ctx: &ApplyContext) {
    match mutation {
        Mutation::AddObservation { content } => kb.observations.push(Observation {
            content: content.clone(),
            timestamp: ctx.now,
            cycle: ctx.cycle,
        }),
        Mutation::AddLesson {
            content,
            confidence,
        } => kb.lessons.push(Lesson {
            content: content.clone(),
            timestamp: ctx.now,
            cycle: ctx.cycle,
            confidence: *confidence,
        }),
        Mutation::AddHypothesis { content } => kb.hypotheses.push(Hypothesis {
            content: content.clone(),
            timestamp: ctx.now,
            cycle: ctx.cycle,
            status: HypothesisStatus::Testing,
            evidence: Vec::new(),
        }),
        Mutation::AddStrategy { name, description } => kb.strategies.push(Strategy {
            name: name.clone(),
            description: description.clone(),
            timestamp: ctx.now,
            cycle: ctx.cycle,
            effectiveness: Default::default(),
        }),
        Mutation::PruneOld => {
            if let Some(keep) = ctx.keep_recent_observations {
                let excess = kb.observations.len().saturating_sub(keep);
                kb.observations = kb.observations.split_off(excess);
            }
        }
    }
}

/// Apply every valid command in order. Returns how many were applied.
pub fn apply_block(kb: &mut KnowledgeBase, block: &ValidatedBlock, ctx: &ApplyContext) -> usize {
    for command in &block.valid {
        apply_mutation(kb, &command.mutation, ctx);
    }
    block.valid.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(cycle: u64) -> ApplyContext {
        ApplyContext {
            cycle,
            now: DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp"),
            keep_recent_observations: None,
        }
    }

    fn empty_kb() -> KnowledgeBase {
        KnowledgeBase::empty(DateTime::from_timestamp(0, 0).expect("timestamp"))
    }

    #[test]
    fn add_lesson_at_cycle_three() {
        let block = validate_block(&[json!({
            "command": "add_lesson",
            "data": {"content": "X", "confidence": "high"}
        })]);
        assert!(block.skipped.is_empty());

        let mut kb = empty_kb();
        let applied = apply_block(&mut kb, &block, &ctx(3));

        assert_eq!(applied, 1);
        assert_eq!(kb.lessons.len(), 1);
        assert_eq!(kb.lessons[0].content, "X");
        assert_eq!(kb.lessons[0].confidence, Confidence::High);
        assert_eq!(kb.lessons[0].cycle, 3);
    }

    #[test]
    fn mistyped_content_is_skipped_without_touching_neighbours() {
        let block = validate_block(&[
            json!({"command": "add_observation", "data": {"content": 42}}),
            json!({"command": "add_observation", "reason": "seen", "data": {"content": "ok"}}),
        ]);

        assert_eq!(block.valid.len(), 1);
        assert_eq!(block.valid[0].reason, "seen");
        assert_eq!(block.skipped.len(), 1);
        assert_eq!(block.skipped[0].index, 0);
        assert_eq!(block.skipped[0].kind.as_deref(), Some("add_observation"));

        let mut kb = empty_kb();
        apply_block(&mut kb, &block, &ctx(1));
        assert_eq!(kb.observations.len(), 1);
        assert_eq!(kb.observations[0].content, "ok");
    }

    #[test]
    fn unknown_kind_and_non_objects_are_skipped() {
        let block = validate_block(&[
            json!({"command": "delete_everything", "data": {}}),
            json!("add_observation"),
            json!({"data": {"content": "no kind"}}),
        ]);
        assert!(block.valid.is_empty());
        assert_eq!(block.skipped.len(), 3);
        assert_eq!(block.skipped[0].kind.as_deref(), Some("delete_everything"));
        assert_eq!(block.skipped[1].kind, None);
    }

    #[test]
    fn strategy_requires_name_and_description() {
        let missing = validate_command(&json!({
            "command": "add_strategy",
            "data": {"name": "only name"}
        }));
        assert!(missing.is_err());

        let ok = validate_command(&json!({
            "command": "add_strategy",
            "data": {"name": "n", "description": "d"}
        }))
        .expect("valid strategy");
        assert_eq!(
            ok.mutation,
            Mutation::AddStrategy {
                name: "n".to_string(),
                description: "d".to_string()
            }
        );
    }

    #[test]
    fn hypothesis_starts_in_testing() {
        let block = validate_block(&[json!({
            "command": "add_hypothesis",
            "data": {"content": "cheaper at night"}
        })]);
        let mut kb = empty_kb();
        apply_block(&mut kb, &block, &ctx(2));
        assert_eq!(kb.hypotheses[0].status, HypothesisStatus::Testing);
        assert!(kb.hypotheses[0].evidence.is_empty());
    }

    #[test]
    fn odd_confidence_keeps_the_lesson() {
        let command = validate_command(&json!({
            "command": "add_lesson",
            "data": {"content": "c", "confidence": 7}
        }))
        .expect("valid lesson");
        assert_eq!(
            command.mutation,
            Mutation::AddLesson {
                content: "c".to_string(),
                confidence: Confidence::Unspecified
            }
        );
    }

    #[test]
    fn prune_old_is_a_no_op_without_a_cap() {
        let mut kb = empty_kb();
        for i in 0..4 {
            apply_mutation(
                &mut kb,
                &Mutation::AddObservation {
                    content: format!("obs {i}"),
                },
                &ctx(1),
            );
        }

        apply_mutation(&mut kb, &Mutation::PruneOld, &ctx(2));
        assert_eq!(kb.observations.len(), 4);

        let capped = ApplyContext {
            keep_recent_observations: Some(2),
            ..ctx(2)
        };
        apply_mutation(&mut kb, &Mutation::PruneOld, &capped);
        let kept: Vec<&str> = kb
            .observations
            .iter()
            .map(|obs| obs.content.as_str())
            .collect();
        assert_eq!(kept, vec!["obs 2", "obs 3"]);
    }

    #[test]
    fn prune_old_needs_no_data() {
        let command = validate_command(&json!({"command": "prune_old", "reason": "tidy"}))
            .expect("valid prune");
        assert_eq!(command.mutation, Mutation::PruneOld);
        assert_eq!(command.mutation.kind(), "prune_old");
    }

    #[test]
    fn prune_old_accepts_null_data() {
        let command = validate_command(&json!({"command": "prune_old", "data": null}))
            .expect("valid prune");
        assert_eq!(command.mutation, Mutation::PruneOld);
    }

    #[test]
    fn null_data_is_still_rejected_where_fields_are_required() {
        let err = validate_command(&json!({"command": "add_observation", "data": null}))
            .unwrap_err();
        assert!(!err.is_empty());
    }

    #[test]
    fn non_string_reason_is_recorded_as_empty() {
        let block = validate_block(&[
            json!({"command": "add_observation", "reason": null, "data": {"content": "a"}}),
            json!({"command": "add_hypothesis", "reason": 3, "data": {"content": "b"}}),
        ]);

        assert!(block.skipped.is_empty(), "{:?}", block.skipped);
        let reasons: Vec<&str> = block.valid.iter().map(|c| c.reason.as_str()).collect();
        assert_eq!(reasons, vec!["", ""]);
    }
}
