//! Resource dependency graph of a config dump.
//!
//! Nodes are `(kind, name)` keys and edges point from the referring resource
//! to the referenced one. References to resources that are not part of the
//! dump produce placeholder nodes marked unresolved, so a missing resource
//! is visible in the rendering rather than silently dropped.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::message::ConfigDumpEntry;
use crate::resource::{ResourceKind, ResourceRef};

/// A vertex of the [`DependencyGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphNode {
    /// Whether the resource is present in the dump.
    pub resolved: bool,
}

/// A directed graph of resource references.
///
/// Built with [`DependencyGraph::build`] and never modified afterwards.
/// Ordered maps make both the structure and the DOT output independent of
/// the order of the input entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyGraph {
    nodes: BTreeMap<ResourceRef, GraphNode>,
    edges: BTreeMap<(ResourceRef, ResourceRef), usize>,
}

impl DependencyGraph {
    /// Build the graph of a node's config dump entries.
    pub fn build(entries: &[ConfigDumpEntry]) -> Self {
        let mut graph = Self::default();

        for entry in entries {
            graph
                .nodes
                .insert(key_of(entry), GraphNode { resolved: true });
        }

        for entry in entries {
            let from = key_of(entry);
            for reference in &entry.references {
                graph
                    .nodes
                    .entry(reference.clone())
                    .or_insert(GraphNode { resolved: false });
                *graph
                    .edges
                    .entry((from.clone(), reference.clone()))
                    .or_default() += 1;
            }
        }

        graph
    }

    /// Returns true if the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a node.
    pub fn node(&self, key: &ResourceRef) -> Option<&GraphNode> {
        self.nodes.get(key)
    }

    /// All nodes, ordered by kind then name.
    pub fn nodes(&self) -> impl Iterator<Item = (&ResourceRef, &GraphNode)> {
        self.nodes.iter()
    }

    /// All edges with their weights, ordered by source then target.
    pub fn edges(&self) -> impl Iterator<Item = (&ResourceRef, &ResourceRef, usize)> {
        self.edges
            .iter()
            .map(|((from, to), weight)| (from, to, *weight))
    }

    /// The weight of the edge between two nodes, or 0 if there is none.
    pub fn edge_weight(&self, from: &ResourceRef, to: &ResourceRef) -> usize {
        self.edges
            .get(&(from.clone(), to.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Render the graph in Graphviz DOT.
    ///
    /// Each resource kind is drawn as its own cluster. Unresolved nodes are
    /// dashed and red; edges referenced more than once carry their count.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph xds {\n  rankdir=LR;\n  node [shape=box];\n");

        let mut by_kind: BTreeMap<&ResourceKind, Vec<(&ResourceRef, &GraphNode)>> =
            BTreeMap::new();
        for (key, node) in &self.nodes {
            by_kind.entry(&key.kind).or_default().push((key, node));
        }

        for (kind, nodes) in by_kind {
            let _ = writeln!(out, "  subgraph {} {{", quote(&format!("cluster_{kind}")));
            let _ = writeln!(out, "    label={};", quote(kind.as_str()));
            for (key, node) in nodes {
                let style = if node.resolved {
                    ""
                } else {
                    ", style=dashed, color=red"
                };
                let _ = writeln!(
                    out,
                    "    {} [label={}{style}];",
                    quote(&node_id(key)),
                    quote(&key.name)
                );
            }
            out.push_str("  }\n");
        }

        for (from, to, weight) in self.edges() {
            let label = if weight > 1 {
                format!(" [label=\"{weight}\"]")
            } else {
                String::new()
            };
            let _ = writeln!(
                out,
                "  {} -> {}{label};",
                quote(&node_id(from)),
                quote(&node_id(to))
            );
        }

        out.push_str("}\n");
        out
    }
}

fn key_of(entry: &ConfigDumpEntry) -> ResourceRef {
    ResourceRef {
        kind: ResourceKind::from_type_url(&entry.type_url),
        name: entry.name.clone(),
    }
}

fn node_id(key: &ResourceRef) -> String {
    format!("{}/{}", key.kind, key.name)
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}
