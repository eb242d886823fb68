//! Workflow graphs.
//!
//! A workflow is a directed multigraph of named nodes. A node either wraps
//! an operation or nests another workflow; links connect an out port (or,
//! for sources, a workflow in port) to destination in ports. Construction
//! is validated eagerly: linking to an unknown node or port is a
//! [`DefinitionError`] at build time, never a runtime surprise.

use std::collections::HashMap;

use crate::operation::{DefinitionError, OperationRegistry};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Nodes and links
// ---------------------------------------------------------------------------

/// Destination of a link inside a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    /// An in port of a sibling node.
    Port { node: String, port: String },
    /// An out port of the enclosing workflow.
    Out { port: String },
}

/// A node wrapping a registered operation.
#[derive(Debug, Clone)]
pub struct OperationNode {
    pub operation: String,
    /// Strategy override; falls back to the operation's default.
    pub strategy: Option<String>,
    /// Arguments handed to the strategy's deploy hook.
    pub args: Value,
    /// Out-port name to destinations.
    pub links: HashMap<String, Vec<LinkTarget>>,
}

/// A node nesting another workflow.
#[derive(Debug, Clone)]
pub struct NestedNode {
    pub workflow: Workflow,
    /// Nested workflow out-port name to destinations in this workflow.
    pub links: HashMap<String, Vec<LinkTarget>>,
}

/// Either kind of workflow node. Flattening eliminates the nested variant,
/// so the runtime only ever deals with operation nodes.
#[derive(Debug, Clone)]
pub enum WorkflowNode {
    Operation(OperationNode),
    Nested(NestedNode),
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A validated workflow graph.
#[derive(Debug, Clone, Default)]
pub struct Workflow {
    pub(crate) in_ports: Vec<String>,
    pub(crate) out_ports: Vec<String>,
    /// Nodes in insertion order; flattening preserves this ordering.
    pub(crate) nodes: Vec<(String, WorkflowNode)>,
    /// Workflow in-port name to destinations.
    pub(crate) in_links: HashMap<String, Vec<LinkTarget>>,
}

impl Workflow {
    #[must_use]
    pub fn in_ports(&self) -> &[String] {
        &self.in_ports
    }

    #[must_use]
    pub fn out_ports(&self) -> &[String] {
        &self.out_ports
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, &WorkflowNode)> {
        self.nodes.iter().map(|(name, node)| (name.as_str(), node))
    }

    #[must_use]
    pub fn node(&self, name: &str) -> Option<&WorkflowNode> {
        self.nodes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node)
    }
}

// ---------------------------------------------------------------------------
// WorkflowBuilder
// ---------------------------------------------------------------------------

/// Builder validating node names and link endpoints against the operation
/// registry as the graph is assembled.
#[derive(Debug)]
pub struct WorkflowBuilder<'r> {
    registry: &'r OperationRegistry,
    workflow: Workflow,
}

impl<'r> WorkflowBuilder<'r> {
    #[must_use]
    pub fn new(registry: &'r OperationRegistry) -> Self {
        Self {
            registry,
            workflow: Workflow::default(),
        }
    }

    #[must_use]
    pub fn in_ports<S: Into<String>>(mut self, ports: impl IntoIterator<Item = S>) -> Self {
        self.workflow.in_ports = ports.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn out_ports<S: Into<String>>(mut self, ports: impl IntoIterator<Item = S>) -> Self {
        self.workflow.out_ports = ports.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an operation node.
    ///
    /// # Errors
    ///
    /// `UnknownOperation` when the operation is not registered,
    /// `DuplicateNode` when the name is taken.
    pub fn operation(
        mut self,
        name: impl Into<String>,
        operation: &str,
        strategy: Option<&str>,
        args: Value,
    ) -> Result<Self, DefinitionError> {
        let name = name.into();
        self.check_fresh_name(&name)?;
        self.registry.resolve(operation)?;
        self.workflow.nodes.push((
            name,
            WorkflowNode::Operation(OperationNode {
                operation: operation.to_string(),
                strategy: strategy.map(ToString::to_string),
                args,
                links: HashMap::new(),
            }),
        ));
        Ok(self)
    }

    /// Adds a nested workflow node.
    ///
    /// # Errors
    ///
    /// `DuplicateNode` when the name is taken.
    pub fn nested(
        mut self,
        name: impl Into<String>,
        workflow: Workflow,
    ) -> Result<Self, DefinitionError> {
        let name = name.into();
        self.check_fresh_name(&name)?;
        self.workflow.nodes.push((
            name,
            WorkflowNode::Nested(NestedNode {
                workflow,
                links: HashMap::new(),
            }),
        ));
        Ok(self)
    }

    /// Links an out port of `src_node` to an in port of `dst_node`.
    ///
    /// # Errors
    ///
    /// `UnknownNode`/`UnknownPort` for invalid endpoints.
    pub fn link(
        self,
        src_node: &str,
        src_port: &str,
        dst_node: &str,
        dst_port: &str,
    ) -> Result<Self, DefinitionError> {
        let target = LinkTarget::Port {
            node: dst_node.to_string(),
            port: dst_port.to_string(),
        };
        self.add_link(src_node, src_port, target)
    }

    /// Links an out port of `src_node` to an out port of this workflow.
    ///
    /// # Errors
    ///
    /// `UnknownNode`/`UnknownPort` for invalid endpoints.
    pub fn link_out(
        self,
        src_node: &str,
        src_port: &str,
        out_port: &str,
    ) -> Result<Self, DefinitionError> {
        if !self.workflow.out_ports.iter().any(|p| p == out_port) {
            return Err(DefinitionError::UnknownWorkflowPort {
                port: out_port.to_string(),
            });
        }
        let target = LinkTarget::Out {
            port: out_port.to_string(),
        };
        self.add_link(src_node, src_port, target)
    }

    /// Links a workflow in port to an in port of a node: how external
    /// records and records from an enclosing workflow enter.
    ///
    /// # Errors
    ///
    /// `UnknownWorkflowPort`/`UnknownNode`/`UnknownPort` for invalid
    /// endpoints.
    pub fn link_in(
        mut self,
        in_port: &str,
        dst_node: &str,
        dst_port: &str,
    ) -> Result<Self, DefinitionError> {
        if !self.workflow.in_ports.iter().any(|p| p == in_port) {
            return Err(DefinitionError::UnknownWorkflowPort {
                port: in_port.to_string(),
            });
        }
        let target = LinkTarget::Port {
            node: dst_node.to_string(),
            port: dst_port.to_string(),
        };
        self.check_target(&target)?;
        self.workflow
            .in_links
            .entry(in_port.to_string())
            .or_default()
            .push(target);
        Ok(self)
    }

    /// Finalizes the workflow. All validation happened while linking.
    #[must_use]
    pub fn build(self) -> Workflow {
        self.workflow
    }

    fn add_link(
        mut self,
        src_node: &str,
        src_port: &str,
        target: LinkTarget,
    ) -> Result<Self, DefinitionError> {
        self.check_out_port(src_node, src_port)?;
        self.check_target(&target)?;
        let links = match self
            .workflow
            .nodes
            .iter_mut()
            .find(|(name, _)| name == src_node)
        {
            Some((_, WorkflowNode::Operation(node))) => &mut node.links,
            Some((_, WorkflowNode::Nested(node))) => &mut node.links,
            None => unreachable!("check_out_port verified the node exists"),
        };
        links.entry(src_port.to_string()).or_default().push(target);
        Ok(self)
    }

    fn check_fresh_name(&self, name: &str) -> Result<(), DefinitionError> {
        if self.workflow.nodes.iter().any(|(n, _)| n == name) {
            return Err(DefinitionError::DuplicateNode {
                node: name.to_string(),
            });
        }
        Ok(())
    }

    fn check_out_port(&self, node: &str, port: &str) -> Result<(), DefinitionError> {
        let found = self
            .workflow
            .nodes
            .iter()
            .find(|(name, _)| name == node)
            .ok_or_else(|| DefinitionError::UnknownNode {
                node: node.to_string(),
            })?;
        let has_port = match &found.1 {
            WorkflowNode::Operation(op_node) => self
                .registry
                .resolve(&op_node.operation)?
                .out_port_index(port)
                .is_some(),
            WorkflowNode::Nested(nested) => nested.workflow.out_ports.iter().any(|p| p == port),
        };
        if has_port {
            Ok(())
        } else {
            Err(DefinitionError::UnknownPort {
                node: node.to_string(),
                port: port.to_string(),
            })
        }
    }

    fn check_target(&self, target: &LinkTarget) -> Result<(), DefinitionError> {
        let LinkTarget::Port { node, port } = target else {
            return Ok(());
        };
        let found = self
            .workflow
            .nodes
            .iter()
            .find(|(name, _)| name == node)
            .ok_or_else(|| DefinitionError::UnknownNode {
                node: node.clone(),
            })?;
        let has_port = match &found.1 {
            WorkflowNode::Operation(op_node) => self
                .registry
                .resolve(&op_node.operation)?
                .in_port_index(port)
                .is_some(),
            WorkflowNode::Nested(nested) => nested.workflow.in_ports.iter().any(|p| p == port),
        };
        if has_port {
            Ok(())
        } else {
            Err(DefinitionError::UnknownPort {
                node: node.clone(),
                port: port.clone(),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationBuilder;

    fn registry() -> OperationRegistry {
        let registry = OperationRegistry::new();
        registry
            .register(
                OperationBuilder::new("double")
                    .in_ports(["value"])
                    .out_ports(["doubled"])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
            .register(
                OperationBuilder::new("join")
                    .in_ports(["left", "right"])
                    .out_ports(["pair"])
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    #[test]
    fn builds_a_linked_workflow() {
        let registry = registry();
        let workflow = WorkflowBuilder::new(&registry)
            .in_ports(["records"])
            .operation("a", "double", None, Value::Nil)
            .unwrap()
            .operation("b", "join", None, Value::Nil)
            .unwrap()
            .link_in("records", "a", "value")
            .unwrap()
            .link("a", "doubled", "b", "left")
            .unwrap()
            .link("a", "doubled", "b", "right")
            .unwrap()
            .build();

        assert_eq!(workflow.in_ports(), ["records"]);
        assert!(workflow.node("a").is_some());
        let Some(WorkflowNode::Operation(a)) = workflow.node("a") else {
            panic!("expected operation node");
        };
        assert_eq!(a.links.get("doubled").map(Vec::len), Some(2));
    }

    #[test]
    fn duplicate_node_name_fails() {
        let registry = registry();
        let err = WorkflowBuilder::new(&registry)
            .operation("a", "double", None, Value::Nil)
            .unwrap()
            .operation("a", "double", None, Value::Nil)
            .unwrap_err();
        assert_eq!(
            err,
            DefinitionError::DuplicateNode {
                node: "a".to_string()
            }
        );
    }

    #[test]
    fn unknown_operation_fails() {
        let registry = registry();
        let err = WorkflowBuilder::new(&registry)
            .operation("a", "missing", None, Value::Nil)
            .unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownOperation { .. }));
    }

    #[test]
    fn linking_unknown_node_fails() {
        let registry = registry();
        let err = WorkflowBuilder::new(&registry)
            .operation("a", "double", None, Value::Nil)
            .unwrap()
            .link("a", "doubled", "ghost", "value")
            .unwrap_err();
        assert_eq!(
            err,
            DefinitionError::UnknownNode {
                node: "ghost".to_string()
            }
        );
    }

    #[test]
    fn linking_unknown_port_fails() {
        let registry = registry();
        let err = WorkflowBuilder::new(&registry)
            .operation("a", "double", None, Value::Nil)
            .unwrap()
            .operation("b", "join", None, Value::Nil)
            .unwrap()
            .link("a", "doubled", "b", "middle")
            .unwrap_err();
        assert_eq!(
            err,
            DefinitionError::UnknownPort {
                node: "b".to_string(),
                port: "middle".to_string(),
            }
        );

        let err = WorkflowBuilder::new(&registry)
            .operation("a", "double", None, Value::Nil)
            .unwrap()
            .operation("b", "join", None, Value::Nil)
            .unwrap()
            .link("a", "halved", "b", "left")
            .unwrap_err();
        assert_eq!(
            err,
            DefinitionError::UnknownPort {
                node: "a".to_string(),
                port: "halved".to_string(),
            }
        );
    }

    #[test]
    fn link_in_validates_workflow_port() {
        let registry = registry();
        let err = WorkflowBuilder::new(&registry)
            .in_ports(["records"])
            .operation("a", "double", None, Value::Nil)
            .unwrap()
            .link_in("nope", "a", "value")
            .unwrap_err();
        assert_eq!(
            err,
            DefinitionError::UnknownWorkflowPort {
                port: "nope".to_string()
            }
        );
    }

    #[test]
    fn nested_workflow_ports_participate_in_links() {
        let registry = registry();
        let inner = WorkflowBuilder::new(&registry)
            .in_ports(["in"])
            .out_ports(["out"])
            .operation("d", "double", None, Value::Nil)
            .unwrap()
            .link_in("in", "d", "value")
            .unwrap()
            .link_out("d", "doubled", "out")
            .unwrap()
            .build();

        let outer = WorkflowBuilder::new(&registry)
            .in_ports(["records"])
            .operation("pre", "double", None, Value::Nil)
            .unwrap()
            .nested("sub", inner)
            .unwrap()
            .link_in("records", "pre", "value")
            .unwrap()
            .link("pre", "doubled", "sub", "in")
            .unwrap()
            .build();

        let Some(WorkflowNode::Operation(pre)) = outer.node("pre") else {
            panic!("expected operation node");
        };
        assert_eq!(
            pre.links.get("doubled"),
            Some(&vec![LinkTarget::Port {
                node: "sub".to_string(),
                port: "in".to_string(),
            }])
        );
    }

    #[test]
    fn linking_to_missing_nested_port_fails() {
        let registry = registry();
        let inner = WorkflowBuilder::new(&registry).in_ports(["in"]).build();
        let err = WorkflowBuilder::new(&registry)
            .operation("pre", "double", None, Value::Nil)
            .unwrap()
            .nested("sub", inner)
            .unwrap()
            .link("pre", "doubled", "sub", "bogus")
            .unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownPort { .. }));
    }
}
