//! Workflow definitions: a DAG of tool-call steps.
//!
//! Edges come from two places. `depends_on` adds ordering-only edges;
//! a [`Binding::Step`] input adds a data edge from the step it reads.
//! Either way the referenced step must finish before this one starts.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use knack_types::{StepId, UserId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who may see and run a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Visibility {
    /// A draft: visible to its owner, not executable by anyone.
    #[default]
    Private,
    /// Executable by the owner only.
    ExecutableByOwner,
    /// Executable by every user.
    Shared,
}

/// Where one argument of a step comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "kebab-case")]
pub enum Binding {
    /// A fixed value baked into the definition.
    Literal { value: Value },
    /// Part of an upstream step's output, addressed by JSON Pointer.
    Step {
        step: StepId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pointer: Option<String>,
    },
    /// Part of the trigger input, addressed by JSON Pointer.
    Input {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pointer: Option<String>,
    },
}

/// What the engine does when a step fails.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Cancel everything still pending and fail the run.
    #[default]
    AbortRun,
    /// Record the failure and keep going; the run ends partially
    /// failed.
    SkipAndContinue,
    /// Pretend the step completed with this value.
    UseDefault { value: Value },
}

/// One step: a tool call with bound arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: StepId,
    /// Bare or `server__qualified` tool name.
    pub tool: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input: BTreeMap<String, Binding>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<StepId>,
    #[serde(default)]
    pub on_error: FailurePolicy,
    /// Per-step call deadline override, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl WorkflowStep {
    pub fn new(id: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            id: StepId::new(id),
            tool: tool.into(),
            input: BTreeMap::new(),
            depends_on: Vec::new(),
            on_error: FailurePolicy::default(),
            timeout_ms: None,
        }
    }

    /// Every upstream step this one waits for: explicit dependencies
    /// plus the steps its bindings read, deduplicated.
    pub fn upstream(&self) -> BTreeSet<&StepId> {
        let mut up: BTreeSet<&StepId> = self.depends_on.iter().collect();
        for binding in self.input.values() {
            if let Binding::Step { step, .. } = binding {
                up.insert(step);
            }
        }
        up
    }
}

/// A named, owned DAG of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub owner: UserId,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub visibility: Visibility,
    pub steps: Vec<WorkflowStep>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, owner: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: WorkflowId::new(),
            name: name.into(),
            owner,
            description: String::new(),
            visibility: Visibility::default(),
            steps: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, id: &StepId) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == *id)
    }

    /// Whether `user` may trigger a run of this workflow.
    pub fn executable_by(&self, user: &UserId) -> bool {
        match self.visibility {
            Visibility::Shared => true,
            Visibility::ExecutableByOwner => self.owner == *user,
            Visibility::Private => false,
        }
    }

    /// Steps nothing downstream consumes; their outputs form the run's
    /// aggregated output.
    pub fn terminal_steps(&self) -> Vec<&StepId> {
        let mut consumed: BTreeSet<&StepId> = BTreeSet::new();
        for step in &self.steps {
            consumed.extend(step.upstream());
        }
        self.steps
            .iter()
            .map(|s| &s.id)
            .filter(|id| !consumed.contains(*id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_serde_shapes() {
        let literal: Binding =
            serde_json::from_value(serde_json::json!({"from": "literal", "value": 42})).unwrap();
        assert_eq!(
            literal,
            Binding::Literal {
                value: serde_json::json!(42)
            }
        );

        let step: Binding = serde_json::from_value(
            serde_json::json!({"from": "step", "step": "fetch", "pointer": "/results/0"}),
        )
        .unwrap();
        assert_eq!(
            step,
            Binding::Step {
                step: StepId::new("fetch"),
                pointer: Some("/results/0".to_string())
            }
        );

        let input: Binding = serde_json::from_value(serde_json::json!({"from": "input"})).unwrap();
        assert_eq!(input, Binding::Input { pointer: None });
    }

    #[test]
    fn failure_policy_defaults_to_abort() {
        let step: WorkflowStep =
            serde_json::from_value(serde_json::json!({"id": "a", "tool": "search"})).unwrap();
        assert_eq!(step.on_error, FailurePolicy::AbortRun);

        let policy: FailurePolicy =
            serde_json::from_value(serde_json::json!({"mode": "use-default", "value": []}))
                .unwrap();
        assert_eq!(
            policy,
            FailurePolicy::UseDefault {
                value: serde_json::json!([])
            }
        );
    }

    #[test]
    fn visibility_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_value(Visibility::ExecutableByOwner).unwrap(),
            serde_json::json!("executable-by-owner")
        );
        let workflow: Workflow = serde_json::from_value(serde_json::json!({
            "id": "0193c7e4-0000-7000-8000-000000000000",
            "name": "t",
            "owner": "u1",
            "steps": [],
        }))
        .unwrap();
        assert_eq!(workflow.visibility, Visibility::Private);
    }

    #[test]
    fn upstream_merges_and_deduplicates_edges() {
        let mut step = WorkflowStep::new("b", "summarize");
        step.depends_on.push(StepId::new("a"));
        step.input.insert(
            "text".to_string(),
            Binding::Step {
                step: StepId::new("a"),
                pointer: None,
            },
        );
        step.input.insert(
            "limit".to_string(),
            Binding::Literal {
                value: serde_json::json!(5),
            },
        );
        let upstream = step.upstream();
        assert_eq!(upstream.len(), 1);
        assert!(upstream.contains(&StepId::new("a")));
    }

    #[test]
    fn executable_by_follows_visibility() {
        let owner = UserId::new("owner");
        let other = UserId::new("other");
        let mut workflow = Workflow::new("t", owner.clone());

        assert!(!workflow.executable_by(&owner));

        workflow.visibility = Visibility::ExecutableByOwner;
        assert!(workflow.executable_by(&owner));
        assert!(!workflow.executable_by(&other));

        workflow.visibility = Visibility::Shared;
        assert!(workflow.executable_by(&other));
    }

    #[test]
    fn terminal_steps_are_those_nobody_consumes() {
        let a = WorkflowStep::new("a", "search");
        let mut b = WorkflowStep::new("b", "summarize");
        b.input.insert(
            "text".to_string(),
            Binding::Step {
                step: StepId::new("a"),
                pointer: None,
            },
        );
        let mut c = WorkflowStep::new("c", "notify");
        c.depends_on.push(StepId::new("a"));

        let mut workflow = Workflow::new("t", UserId::new("u"));
        workflow.steps = vec![a, b, c];

        let terminal: Vec<&str> = workflow
            .terminal_steps()
            .iter()
            .map(|s| s.as_str())
            .collect();
        assert_eq!(terminal, vec!["b", "c"]);
    }
}
