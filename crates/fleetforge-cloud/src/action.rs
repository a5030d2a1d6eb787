//! Action records produced by a reconciliation pass

use serde::{Deserialize, Serialize};
use std::fmt;

/// One entry of the reconciliation trace. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub action: ActionType,

    /// What the action touches (e.g. "Node group", "Master upgrade")
    pub resource: String,

    pub message: String,
}

impl Action {
    pub fn new(action: ActionType, resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            action,
            resource: resource.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<6} {:<20} {}", self.action, self.resource, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionType {
    Nop,
    Add,
    Update,
    Delete,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            ActionType::Nop => "Nop",
            ActionType::Add => "Add",
            ActionType::Update => "Update",
            ActionType::Delete => "Delete",
        })
    }
}

/// Summary of an action list, for the CLI report footer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub add: usize,
    pub update: usize,
    pub delete: usize,
    pub nop: usize,
}

impl PlanSummary {
    pub fn of(actions: &[Action]) -> Self {
        let mut summary = Self::default();
        for action in actions {
            match action.action {
                ActionType::Add => summary.add += 1,
                ActionType::Update => summary.update += 1,
                ActionType::Delete => summary.delete += 1,
                ActionType::Nop => summary.nop += 1,
            }
        }
        summary
    }

    pub fn has_changes(&self) -> bool {
        self.add + self.update + self.delete > 0
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to add, {} to update, {} to delete",
            self.add, self.update, self.delete
        )
    }
}
