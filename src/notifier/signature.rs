//! Step signature and container plan.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::execution::{Action, ActionGroup};
use crate::protocol::INIT_STEP_REF;

/// One node of the step tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Signature>,
}

impl Signature {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            name: None,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: Signature) -> Self {
        self.children.push(child);
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Builds the forest from the `declare` actions, in declaration order.
    ///
    /// A step's direct parent is the last entry of its `parents`.
    pub fn from_groups(groups: &[ActionGroup]) -> Vec<Signature> {
        let mut order = Vec::new();
        let mut parent_of: HashMap<String, Option<String>> = HashMap::new();
        for action in groups.iter().flatten() {
            if let Action::Declare {
                reference, parents, ..
            } = action
            {
                if !parent_of.contains_key(reference) {
                    order.push(reference.clone());
                    parent_of.insert(reference.clone(), parents.last().cloned());
                }
            }
        }

        fn build(
            reference: &str,
            order: &[String],
            parent_of: &HashMap<String, Option<String>>,
        ) -> Signature {
            let mut node = Signature::new(reference);
            for candidate in order {
                if parent_of.get(candidate).and_then(|p| p.as_deref()) == Some(reference) {
                    node.children.push(build(candidate, order, parent_of));
                }
            }
            node
        }

        order
            .iter()
            .filter(|r| {
                parent_of
                    .get(*r)
                    .and_then(|p| p.as_ref())
                    .map(|p| !parent_of.contains_key(p))
                    .unwrap_or(true)
            })
            .map(|r| build(r, &order, &parent_of))
            .collect()
    }
}

/// Pre-order references of a forest.
pub fn walk(forest: &[Signature]) -> Vec<&Signature> {
    let mut nodes = Vec::new();
    let mut stack: Vec<&Signature> = forest.iter().rev().collect();
    while let Some(node) = stack.pop() {
        nodes.push(node);
        stack.extend(node.children.iter().rev());
    }
    nodes
}

/// Reference of the step that runs last.
pub fn last_step(forest: &[Signature]) -> Option<&str> {
    walk(forest)
        .into_iter()
        .filter(|n| n.is_leaf())
        .last()
        .map(|n| n.reference.as_str())
}

/// Steps run by one container.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedContainer {
    pub name: String,
    pub steps: Vec<String>,
}

/// Which container runs which step, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub signature: Vec<Signature>,
    pub containers: Vec<PlannedContainer>,
}

impl Plan {
    /// Pairs each action group with the container that runs it.
    pub fn new(signature: Vec<Signature>, groups: &[ActionGroup], names: &[String]) -> Self {
        let containers = groups
            .iter()
            .zip(names)
            .map(|(group, name)| {
                let mut steps = Vec::new();
                for action in group {
                    let reference = match action {
                        Action::Setup { .. } => INIT_STEP_REF,
                        Action::Execute { reference, .. } => reference.as_str(),
                        _ => continue,
                    };
                    if !steps.iter().any(|s| s == reference) {
                        steps.push(reference.to_string());
                    }
                }
                PlannedContainer {
                    name: name.clone(),
                    steps,
                }
            })
            .collect();
        Self {
            signature,
            containers,
        }
    }

    /// Derives the signature from the groups themselves.
    pub fn from_groups(groups: &[ActionGroup], names: &[String]) -> Self {
        Self::new(Signature::from_groups(groups), groups, names)
    }

    /// Container that runs a step.
    pub fn container_of(&self, reference: &str) -> Option<&PlannedContainer> {
        self.containers
            .iter()
            .find(|c| c.steps.iter().any(|s| s == reference))
    }

    /// Pre-order step references.
    pub fn order(&self) -> Vec<String> {
        walk(&self.signature)
            .into_iter()
            .map(|n| n.reference.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::ContainerConfig;

    fn declare(reference: &str, parents: &[&str]) -> Action {
        Action::Declare {
            reference: reference.into(),
            condition: "passed".into(),
            parents: parents.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn execute(reference: &str) -> Action {
        Action::Execute {
            reference: reference.into(),
            negative: false,
        }
    }

    fn groups() -> Vec<ActionGroup> {
        vec![
            vec![
                Action::Setup {
                    copy_binaries: true,
                    target_dir: None,
                },
                declare("root", &[]),
                declare("a", &["root"]),
                declare("b", &["root"]),
                declare("b1", &["root", "b"]),
                Action::Container {
                    reference: "a".into(),
                    config: ContainerConfig::new(["true"]),
                },
                execute("a"),
            ],
            vec![execute("b1")],
        ]
    }

    #[test]
    fn test_signature_from_declarations() {
        let forest = Signature::from_groups(&groups());
        assert_eq!(forest.len(), 1);
        let root = &forest[0];
        assert_eq!(root.reference, "root");
        assert_eq!(root.children.len(), 2);
        assert_eq!(root.children[1].children[0].reference, "b1");

        let order: Vec<&str> = walk(&forest).iter().map(|n| n.reference.as_str()).collect();
        assert_eq!(order, vec!["root", "a", "b", "b1"]);
        assert_eq!(last_step(&forest), Some("b1"));
    }

    #[test]
    fn test_plan_maps_steps_to_containers() {
        let names = vec!["init".to_string(), "step-1".to_string()];
        let plan = Plan::from_groups(&groups(), &names);

        assert_eq!(plan.containers[0].steps, vec![INIT_STEP_REF, "a"]);
        assert_eq!(plan.container_of("b1").unwrap().name, "step-1");
        assert!(plan.container_of("root").is_none());
    }

    #[test]
    fn test_signature_serde() {
        let json = r#"{"ref":"g","children":[{"ref":"x"},{"ref":"y","name":"Y"}]}"#;
        let signature: Signature = serde_json::from_str(json).unwrap();
        assert_eq!(
            signature,
            Signature::new("g")
                .with_child(Signature::new("x"))
                .with_child(Signature {
                    name: Some("Y".into()),
                    ..Signature::new("y")
                })
        );
    }
}
