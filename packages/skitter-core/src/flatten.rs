//! Workflow flattening.
//!
//! Flattening expands nested workflows in place, assigns dense node
//! indices, and resolves every link to `(node-idx, in-port-idx)` pairs.
//! The result is the canonical runtime representation: it references
//! operations and strategies by name only, so it serializes and replicates
//! cluster-wide, and each node re-resolves the names against its own
//! registries at deploy time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::operation::{DefinitionError, OperationRegistry};
use crate::value::Value;
use crate::workflow::{LinkTarget, NestedNode, OperationNode, Workflow, WorkflowNode};

/// Resolution through in/out passthrough chains is bounded by this depth;
/// beyond it the workflow necessarily contains a port-to-port cycle.
const MAX_PASSTHROUGH_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// Flattened representation
// ---------------------------------------------------------------------------

/// A resolved link destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    /// Index of the destination node in the flattened node list.
    pub node: usize,
    /// In-port index on that node's operation.
    pub port: usize,
}

/// One node of a flattened workflow. Always an operation node; flattening
/// eliminated the nested variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatNode {
    /// Path-qualified name, e.g. `outer/inner`.
    pub name: String,
    pub operation: String,
    /// Strategy resolved from the node override or the operation default.
    pub strategy: String,
    pub args: Value,
    /// Destinations per out port, indexed by out-port index. An empty
    /// entry is a sink: records emitted there are discarded.
    pub links: Vec<Vec<Destination>>,
}

/// The dense, fully resolved form of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlattenedWorkflow {
    pub nodes: Vec<FlatNode>,
    /// Workflow in-port name to destinations: where external records enter.
    pub in_links: HashMap<String, Vec<Destination>>,
}

// ---------------------------------------------------------------------------
// Scope tree (flattening internals)
// ---------------------------------------------------------------------------

enum Entry<'a> {
    Op { idx: usize, node: &'a OperationNode },
    Nested { node: &'a NestedNode, scope: Scope<'a> },
}

struct Scope<'a> {
    entries: Vec<(&'a str, Entry<'a>)>,
}

impl<'a> Scope<'a> {
    fn entry(&self, name: &str) -> Option<&Entry<'a>> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, e)| e)
    }
}

/// Stack frame used to resolve `Out` targets: the scope enclosing a nested
/// node together with that node's own links.
#[derive(Clone, Copy)]
struct Frame<'s, 'a> {
    parent_scope: &'s Scope<'a>,
    nested_links: &'a HashMap<String, Vec<LinkTarget>>,
}

// ---------------------------------------------------------------------------
// flatten
// ---------------------------------------------------------------------------

/// Flattens a workflow into its dense runtime form.
///
/// Node ordering is stable: depth-first over the workflow's insertion
/// order, nested workflows expanded in place.
///
/// # Errors
///
/// `DefinitionError` when an operation or port cannot be resolved, an
/// operation ends up without a strategy, or in/out passthrough links form
/// a cycle.
pub fn flatten(
    workflow: &Workflow,
    registry: &OperationRegistry,
) -> Result<FlattenedWorkflow, DefinitionError> {
    let mut nodes = Vec::new();
    let scope = build_scope(workflow, "", registry, &mut nodes)?;
    resolve_scope(&scope, &[], registry, &mut nodes)?;

    let mut in_links = HashMap::new();
    for (port, targets) in &workflow.in_links {
        let mut destinations = Vec::new();
        resolve_targets(targets, &scope, &[], registry, 0, &mut destinations)?;
        in_links.insert(port.clone(), destinations);
    }

    Ok(FlattenedWorkflow { nodes, in_links })
}

/// Depth-first index assignment; pushes one skeleton `FlatNode` per
/// operation node and mirrors the nesting structure as a scope tree.
fn build_scope<'a>(
    workflow: &'a Workflow,
    prefix: &str,
    registry: &OperationRegistry,
    nodes: &mut Vec<FlatNode>,
) -> Result<Scope<'a>, DefinitionError> {
    let mut entries = Vec::with_capacity(workflow.nodes.len());
    for (name, node) in &workflow.nodes {
        let qualified = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        match node {
            WorkflowNode::Operation(op_node) => {
                let operation = registry.resolve(&op_node.operation)?;
                let strategy = op_node
                    .strategy
                    .clone()
                    .or_else(|| operation.default_strategy().map(ToString::to_string))
                    .ok_or_else(|| DefinitionError::MissingStrategy {
                        operation: op_node.operation.clone(),
                    })?;
                let idx = nodes.len();
                nodes.push(FlatNode {
                    name: qualified,
                    operation: op_node.operation.clone(),
                    strategy,
                    args: op_node.args.clone(),
                    links: vec![Vec::new(); operation.out_ports().len()],
                });
                entries.push((name.as_str(), Entry::Op { idx, node: op_node }));
            }
            WorkflowNode::Nested(nested) => {
                let scope = build_scope(&nested.workflow, &qualified, registry, nodes)?;
                entries.push((name.as_str(), Entry::Nested { node: nested, scope }));
            }
        }
    }
    Ok(Scope { entries })
}

/// Fills the `links` of every flattened node reachable from `scope`.
fn resolve_scope<'a>(
    scope: &Scope<'a>,
    stack: &[Frame<'_, 'a>],
    registry: &OperationRegistry,
    nodes: &mut Vec<FlatNode>,
) -> Result<(), DefinitionError> {
    for (name, entry) in &scope.entries {
        match entry {
            Entry::Op { idx, node } => {
                let operation = registry.resolve(&node.operation)?;
                for (port_name, targets) in &node.links {
                    let port_idx = operation.out_port_index(port_name).ok_or_else(|| {
                        DefinitionError::UnknownPort {
                            node: (*name).to_string(),
                            port: port_name.clone(),
                        }
                    })?;
                    let mut destinations = Vec::new();
                    resolve_targets(targets, scope, stack, registry, 0, &mut destinations)?;
                    nodes[*idx].links[port_idx] = destinations;
                }
            }
            Entry::Nested { node, scope: sub } => {
                let mut inner_stack = stack.to_vec();
                inner_stack.push(Frame {
                    parent_scope: scope,
                    nested_links: &node.links,
                });
                resolve_scope(sub, &inner_stack, registry, nodes)?;
            }
        }
    }
    Ok(())
}

/// Resolves link targets to concrete destinations, following nested
/// workflow boundaries in both directions.
fn resolve_targets<'a>(
    targets: &'a [LinkTarget],
    scope: &Scope<'a>,
    stack: &[Frame<'_, 'a>],
    registry: &OperationRegistry,
    depth: usize,
    out: &mut Vec<Destination>,
) -> Result<(), DefinitionError> {
    if depth > MAX_PASSTHROUGH_DEPTH {
        return Err(DefinitionError::PassthroughCycle);
    }
    for target in targets {
        match target {
            LinkTarget::Port { node, port } => {
                match scope.entry(node) {
                    Some(Entry::Op { idx, node: op_node }) => {
                        let operation = registry.resolve(&op_node.operation)?;
                        let port_idx = operation.in_port_index(port).ok_or_else(|| {
                            DefinitionError::UnknownPort {
                                node: node.clone(),
                                port: port.clone(),
                            }
                        })?;
                        out.push(Destination {
                            node: *idx,
                            port: port_idx,
                        });
                    }
                    Some(Entry::Nested { node: nested, scope: sub }) => {
                        if !nested.workflow.in_ports().iter().any(|p| p == port) {
                            return Err(DefinitionError::UnknownPort {
                                node: node.clone(),
                                port: port.clone(),
                            });
                        }
                        // Records crossing into the nested workflow follow
                        // its in-port links; an unlinked in port drops them.
                        let mut inner_stack = stack.to_vec();
                        inner_stack.push(Frame {
                            parent_scope: scope,
                            nested_links: &nested.links,
                        });
                        if let Some(inner) = nested.workflow.in_links.get(port) {
                            resolve_targets(inner, sub, &inner_stack, registry, depth + 1, out)?;
                        }
                    }
                    None => {
                        return Err(DefinitionError::UnknownNode { node: node.clone() });
                    }
                }
            }
            LinkTarget::Out { port } => match stack.last() {
                // Top-level out port: nothing listens, discard.
                None => {}
                Some(frame) => {
                    if let Some(outer) = frame.nested_links.get(port) {
                        resolve_targets(
                            outer,
                            frame.parent_scope,
                            &stack[..stack.len() - 1],
                            registry,
                            depth + 1,
                            out,
                        )?;
                    }
                }
            },
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
