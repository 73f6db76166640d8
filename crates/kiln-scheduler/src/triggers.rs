//! Trigger matching and cron schedules.

use chrono::{DateTime, Timelike, Utc};
use cron::Schedule;
use kiln_core::filter::BranchFilter;
use kiln_core::pipeline::{TriggerConfig, TriggerType, WorkflowDefinition};
use kiln_core::{Error, Result};
use std::str::FromStr;

/// Event that can start runs.
#[derive(Debug, Clone)]
pub enum TriggerEvent {
    Push {
        branch: String,
        revision: Option<String>,
    },
    /// Clock tick, optionally limited to one workflow.
    Tick {
        time: DateTime<Utc>,
        workflow: Option<String>,
    },
    Manual {
        workflow: String,
        branch: String,
    },
}

impl TriggerEvent {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            TriggerEvent::Push { .. } => TriggerType::Push,
            TriggerEvent::Tick { .. } => TriggerType::Schedule,
            TriggerEvent::Manual { .. } => TriggerType::Manual,
        }
    }
}

/// A parsed cron expression.
///
/// Five-field expressions have minute precision and are evaluated against
/// the tick time truncated to the minute; six or seven fields include seconds.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
    minute_precision: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields = expression.split_whitespace().count();
        let (normalized, minute_precision) = match fields {
            5 => (format!("0 {}", expression.trim()), true),
            6 | 7 => (expression.trim().to_string(), false),
            n => {
                return Err(Error::InvalidCron {
                    expression: expression.to_string(),
                    message: format!("expected 5 to 7 fields, found {n}"),
                });
            }
        };
        let schedule = Schedule::from_str(&normalized).map_err(|e| Error::InvalidCron {
            expression: expression.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
            minute_precision,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn align(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let time = time.with_nanosecond(0).unwrap_or(time);
        if self.minute_precision {
            time.with_second(0).unwrap_or(time)
        } else {
            time
        }
    }

    /// Whether the schedule fires at `time`.
    pub fn includes(&self, time: DateTime<Utc>) -> bool {
        self.schedule.includes(self.align(time))
    }

    /// First fire time strictly after `time`.
    pub fn next_after(&self, time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&time).next()
    }
}

/// Decides which workflows an event instantiates.
pub struct TriggerMatcher;

impl TriggerMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Check if a push on `branch` starts the workflow.
    pub fn push_matches(&self, workflow: &WorkflowDefinition, branch: &str) -> bool {
        if workflow.triggers.is_empty() {
            // Default: trigger on push to any branch
            return true;
        }
        workflow
            .triggers
            .iter()
            .filter(|t| t.trigger_type == TriggerType::Push)
            .any(|t| t.branches.matches(branch))
    }

    /// Branches a schedule trigger runs on: the literal names in its `only`
    /// list, or the default branch when that passes the filter.
    pub fn scheduled_branches(&self, trigger: &TriggerConfig, default_branch: &str) -> Vec<String> {
        scheduled_branches(&trigger.branches, default_branch)
    }
}

impl Default for TriggerMatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn is_literal(pattern: &str) -> bool {
    !pattern.contains('*') && !(pattern.starts_with('/') && pattern.ends_with('/'))
}

pub fn scheduled_branches(filter: &BranchFilter, default_branch: &str) -> Vec<String> {
    let literal: Vec<String> = filter
        .only
        .iter()
        .filter(|p| is_literal(p))
        .filter(|p| filter.matches(p))
        .cloned()
        .collect();
    if !literal.is_empty() {
        return literal;
    }
    if filter.matches(default_branch) {
        vec![default_branch.to_string()]
    } else {
        vec![]
    }
}
