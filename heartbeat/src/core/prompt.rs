//! Deterministic prompt assembly from persisted state.
//!
//! The assembler reads nothing but its inputs. The header timestamp is passed
//! in rather than sampled, so identical inputs always render identical text.

use anyhow::Result;
use chrono::{DateTime, Utc};
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::extract::COMMAND_MARKER;
use crate::core::types::{GoalSet, HypothesisStatus, KnowledgeBase, Priority};

const CYCLE_TEMPLATE: &str = include_str!("prompts/cycle.md");

/// Observations older than the newest few stay on disk but leave the prompt.
pub const RECENT_OBSERVATIONS: usize = 5;

/// Longest mission excerpt shown in the prompt, in characters.
pub const MISSION_SUMMARY_CHARS: usize = 600;

/// Everything the next prompt is built from.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub knowledge: &'a KnowledgeBase,
    pub goals: &'a GoalSet,
    pub mission: &'a str,
    pub cycle: u64,
    pub now: DateTime<Utc>,
}

#[derive(Serialize)]
struct GoalView<'a> {
    id: u64,
    priority: Priority,
    title: &'a str,
    description: &'a str,
    latest: Option<&'a str>,
}

#[derive(Serialize)]
struct EntryView<'a> {
    cycle: u64,
    content: &'a str,
}

#[derive(Serialize)]
struct LessonView<'a> {
    content: &'a str,
    confidence: &'static str,
}

#[derive(Serialize)]
struct StrategyView<'a> {
    name: &'a str,
    description: &'a str,
    effectiveness: &'static str,
}

/// Render the prompt for `inputs.cycle`.
pub fn assemble_prompt(inputs: &PromptInputs<'_>) -> Result<String> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_template("cycle", CYCLE_TEMPLATE)?;

    let kb = inputs.knowledge;
    let goals: Vec<GoalView<'_>> = inputs
        .goals
        .active()
        .map(|goal| GoalView {
            id: goal.id,
            priority: goal.priority,
            title: &goal.title,
            description: &goal.description,
            latest: goal.latest_progress(),
        })
        .collect();
    let skip = kb.observations.len().saturating_sub(RECENT_OBSERVATIONS);
    let observations: Vec<EntryView<'_>> = kb.observations[skip..]
        .iter()
        .map(|obs| EntryView {
            cycle: obs.cycle,
            content: &obs.content,
        })
        .collect();
    let lessons: Vec<LessonView<'_>> = kb
        .lessons
        .iter()
        .map(|lesson| LessonView {
            content: &lesson.content,
            confidence: lesson.confidence.as_str(),
        })
        .collect();
    let hypotheses: Vec<EntryView<'_>> = kb
        .hypotheses
        .iter()
        .filter(|hyp| hyp.status == HypothesisStatus::Testing)
        .map(|hyp| EntryView {
            cycle: hyp.cycle,
            content: &hyp.content,
        })
        .collect();
    let strategies: Vec<StrategyView<'_>> = kb
        .strategies
        .iter()
        .map(|strategy| StrategyView {
            name: &strategy.name,
            description: &strategy.description,
            effectiveness: strategy.effectiveness.as_str(),
        })
        .collect();

    let template = env.get_template("cycle")?;
    let mut rendered = template.render(context! {
        cycle => inputs.cycle,
        timestamp => inputs.now.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        mission => summarize_mission(inputs.mission),
        goals => goals,
        observations => observations,
        lessons => lessons,
        hypotheses => hypotheses,
        strategies => strategies,
        marker => COMMAND_MARKER,
    })?;
    if !rendered.ends_with('\n') {
        rendered.push('\n');
    }
    Ok(rendered)
}

/// First prose paragraph of the mission, headings dropped, capped in length.
pub fn summarize_mission(mission: &str) -> String {
    let paragraph = mission
        .split("\n\n")
        .map(|para| {
            para.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .find(|para| !para.is_empty());

    match paragraph {
        None => "*No mission statement on file.*".to_string(),
        Some(text) if text.chars().count() > MISSION_SUMMARY_CHARS => {
            let cut: String = text.chars().take(MISSION_SUMMARY_CHARS - 3).collect();
            format!("{}...", cut.trim_end())
        }
        Some(text) => text,
    }
}
