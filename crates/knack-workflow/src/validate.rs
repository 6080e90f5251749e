//! Structural validation of workflow definitions.

use std::collections::HashSet;

use knack_types::StepId;

use crate::definition::Workflow;
use crate::error::ValidationError;

/// Check a workflow's structure and return its steps in a valid
/// execution order.
///
/// Rules: at least one step, unique step ids, every step names a tool,
/// every reference resolves, no self-references, no cycles. The order
/// is deterministic: among steps that become runnable together,
/// definition order wins.
pub fn validate(workflow: &Workflow) -> Result<Vec<StepId>, ValidationError> {
    if workflow.steps.is_empty() {
        return Err(ValidationError::EmptyWorkflow);
    }

    let mut ids: HashSet<&StepId> = HashSet::new();
    for step in &workflow.steps {
        if !ids.insert(&step.id) {
            return Err(ValidationError::DuplicateStep {
                step: step.id.clone(),
            });
        }
        if step.tool.trim().is_empty() {
            return Err(ValidationError::MissingTool {
                step: step.id.clone(),
            });
        }
    }

    for step in &workflow.steps {
        for reference in step.upstream() {
            if *reference == step.id {
                return Err(ValidationError::SelfReference {
                    step: step.id.clone(),
                });
            }
            if !ids.contains(reference) {
                return Err(ValidationError::UnknownStep {
                    step: step.id.clone(),
                    reference: reference.clone(),
                });
            }
        }
    }

    // Repeatedly sweep the definition in order, taking every step
    // whose upstreams are already taken. No progress means a cycle.
    let mut order: Vec<StepId> = Vec::with_capacity(workflow.steps.len());
    let mut done: HashSet<&StepId> = HashSet::new();
    loop {
        let mut advanced = false;
        for step in &workflow.steps {
            if done.contains(&step.id) {
                continue;
            }
            if step.upstream().iter().all(|up| done.contains(up)) {
                order.push(step.id.clone());
                done.insert(&step.id);
                advanced = true;
            }
        }
        if order.len() == workflow.steps.len() {
            return Ok(order);
        }
        if !advanced {
            let steps: Vec<StepId> = workflow
                .steps
                .iter()
                .filter(|s| !done.contains(&s.id))
                .map(|s| s.id.clone())
                .collect();
            return Err(ValidationError::Cycle { steps });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Binding, WorkflowStep};
    use knack_types::UserId;

    fn workflow(steps: Vec<WorkflowStep>) -> Workflow {
        let mut w = Workflow::new("test", UserId::new("u"));
        w.steps = steps;
        w
    }

    fn dep(id: &str, tool: &str, on: &[&str]) -> WorkflowStep {
        let mut step = WorkflowStep::new(id, tool);
        step.depends_on = on.iter().map(|s| StepId::new(*s)).collect();
        step
    }

    #[test]
    fn chain_orders_upstream_first_regardless_of_definition_order() {
        let w = workflow(vec![
            dep("c", "t", &["b"]),
            dep("b", "t", &["a"]),
            dep("a", "t", &[]),
        ]);
        let order = validate(&w).unwrap();
        let order: Vec<&str> = order.iter().map(|s| s.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn independent_steps_keep_definition_order() {
        let w = workflow(vec![
            dep("beta", "t", &[]),
            dep("alpha", "t", &[]),
            dep("join", "t", &["alpha", "beta"]),
        ]);
        let order = validate(&w).unwrap();
        let order: Vec<&str> = order.iter().map(|s| s.as_str()).collect();
        assert_eq!(order, vec!["beta", "alpha", "join"]);
    }

    #[test]
    fn diamond_validates() {
        let w = workflow(vec![
            dep("a", "t", &[]),
            dep("b", "t", &["a"]),
            dep("c", "t", &["a"]),
            dep("d", "t", &["b", "c"]),
        ]);
        let order = validate(&w).unwrap();
        assert_eq!(order.first().map(|s| s.as_str()), Some("a"));
        assert_eq!(order.last().map(|s| s.as_str()), Some("d"));
    }

    #[test]
    fn binding_edges_count_for_ordering() {
        let mut consumer = WorkflowStep::new("consumer", "t");
        consumer.input.insert(
            "data".to_string(),
            Binding::Step {
                step: StepId::new("producer"),
                pointer: None,
            },
        );
        let w = workflow(vec![consumer, dep("producer", "t", &[])]);
        let order = validate(&w).unwrap();
        let order: Vec<&str> = order.iter().map(|s| s.as_str()).collect();
        assert_eq!(order, vec!["producer", "consumer"]);
    }

    #[test]
    fn empty_workflow_is_rejected() {
        assert_eq!(
            validate(&workflow(vec![])).unwrap_err(),
            ValidationError::EmptyWorkflow
        );
    }

    #[test]
    fn duplicate_step_ids_are_rejected() {
        let w = workflow(vec![dep("a", "t", &[]), dep("a", "t", &[])]);
        assert!(matches!(
            validate(&w).unwrap_err(),
            ValidationError::DuplicateStep { step } if step.as_str() == "a"
        ));
    }

    #[test]
    fn blank_tool_name_is_rejected() {
        let w = workflow(vec![dep("a", "  ", &[])]);
        assert!(matches!(
            validate(&w).unwrap_err(),
            ValidationError::MissingTool { .. }
        ));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let w = workflow(vec![dep("a", "t", &["ghost"])]);
        assert!(matches!(
            validate(&w).unwrap_err(),
            ValidationError::UnknownStep { reference, .. } if reference.as_str() == "ghost"
        ));
    }

    #[test]
    fn unknown_binding_source_is_rejected() {
        let mut step = WorkflowStep::new("a", "t");
        step.input.insert(
            "x".to_string(),
            Binding::Step {
                step: StepId::new("ghost"),
                pointer: None,
            },
        );
        let w = workflow(vec![step]);
        assert!(matches!(
            validate(&w).unwrap_err(),
            ValidationError::UnknownStep { .. }
        ));
    }

    #[test]
    fn self_reference_is_rejected() {
        let w = workflow(vec![dep("a", "t", &["a"])]);
        assert!(matches!(
            validate(&w).unwrap_err(),
            ValidationError::SelfReference { step } if step.as_str() == "a"
        ));
    }

    #[test]
    fn cycles_are_rejected_with_the_stuck_steps() {
        let w = workflow(vec![
            dep("a", "t", &["b"]),
            dep("b", "t", &["a"]),
            dep("c", "t", &[]),
        ]);
        match validate(&w).unwrap_err() {
            ValidationError::Cycle { steps } => {
                let names: Vec<&str> = steps.iter().map(|s| s.as_str()).collect();
                assert_eq!(names, vec!["a", "b"]);
            }
            other => panic!("expected Cycle, got {other:?}"),
        }
    }
}
