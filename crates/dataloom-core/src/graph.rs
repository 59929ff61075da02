use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::{Catalog, NamespaceNames, QualifiedName};

/// Foreign key edge from a referencing (child) table to its referenced (parent) table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub child: QualifiedName,
    pub column: String,
    pub parent: QualifiedName,
    /// Non-nullable referencing column; the planner must honor it.
    pub required: bool,
}

impl DependencyEdge {
    pub fn is_self_reference(&self) -> bool {
        self.child == self.parent
    }
}

impl fmt::Display for DependencyEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} -> {}", self.child, self.column, self.parent)
    }
}

/// Tables and foreign key edges of a catalog, resolved to concrete namespaces.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: BTreeSet<QualifiedName>,
    edges: Vec<DependencyEdge>,
}

impl DependencyGraph {
    pub fn from_catalog(catalog: &Catalog, names: &NamespaceNames) -> Self {
        let mut nodes = BTreeSet::new();
        let mut edges = Vec::new();

        for table in &catalog.tables {
            let child = table.qualified(names);
            nodes.insert(child.clone());

            for fk in &table.foreign_keys {
                let parent = names.qualify(fk.references.namespace, &fk.references.table);
                nodes.insert(parent.clone());
                let required = table
                    .column(&fk.column)
                    .map(|column| !column.nullable)
                    .unwrap_or(true);
                edges.push(DependencyEdge {
                    child: child.clone(),
                    column: fk.column.clone(),
                    parent,
                    required,
                });
            }
        }

        edges.sort();
        Self { nodes, edges }
    }

    pub fn nodes(&self) -> &BTreeSet<QualifiedName> {
        &self.nodes
    }

    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }
}

/// Edges that participate in at least one cycle of required foreign keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub edges: Vec<DependencyEdge>,
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.edges.iter().map(ToString::to_string).collect();
        f.write_str(&rendered.join(", "))
    }
}

/// Total insertion order over the catalog tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadPlan {
    pub tables: Vec<QualifiedName>,
    /// Optional references whose parent is loaded after the child.
    pub unhonored_hints: Vec<DependencyEdge>,
}

impl LoadPlan {
    pub fn position(&self, table: &QualifiedName) -> Option<usize> {
        self.tables.iter().position(|item| item == table)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Compute a deterministic insertion order honoring every required foreign key.
///
/// Self references never constrain ordering. Nullable references are hints:
/// among ready tables the one with the fewest unplanned optional parents goes
/// first, ties broken by qualified name.
pub fn plan_load_order(graph: &DependencyGraph) -> Result<LoadPlan> {
    let mut required: BTreeMap<&QualifiedName, BTreeSet<&QualifiedName>> = BTreeMap::new();
    let mut optional: BTreeMap<&QualifiedName, BTreeSet<&QualifiedName>> = BTreeMap::new();

    for node in &graph.nodes {
        required.entry(node).or_default();
        optional.entry(node).or_default();
    }

    for edge in graph.edges.iter().filter(|edge| !edge.is_self_reference()) {
        let bucket = if edge.required {
            &mut required
        } else {
            &mut optional
        };
        bucket.entry(&edge.child).or_default().insert(&edge.parent);
    }

    let mut planned: BTreeSet<&QualifiedName> = BTreeSet::new();
    let mut order: Vec<QualifiedName> = Vec::with_capacity(graph.nodes.len());

    while order.len() < graph.nodes.len() {
        let next = required
            .iter()
            .filter(|(node, parents)| {
                !planned.contains(*node) && parents.iter().all(|parent| planned.contains(parent))
            })
            .map(|(node, _)| {
                let pending_hints = optional
                    .get(node)
                    .map(|parents| {
                        parents
                            .iter()
                            .filter(|parent| !planned.contains(*parent))
                            .count()
                    })
                    .unwrap_or(0);
                (pending_hints, *node)
            })
            .min();

        match next {
            Some((_, node)) => {
                planned.insert(node);
                order.push(node.clone());
            }
            None => {
                return Err(Error::Planning(find_required_cycles(graph, &planned)));
            }
        }
    }

    let plan = LoadPlan {
        tables: order,
        unhonored_hints: Vec::new(),
    };
    let unhonored_hints = graph
        .edges
        .iter()
        .filter(|edge| !edge.required && !edge.is_self_reference())
        .filter(|edge| plan.position(&edge.parent) > plan.position(&edge.child))
        .cloned()
        .collect();

    Ok(LoadPlan {
        unhonored_hints,
        ..plan
    })
}

fn find_required_cycles(
    graph: &DependencyGraph,
    planned: &BTreeSet<&QualifiedName>,
) -> CycleReport {
    let mut digraph: DiGraph<&QualifiedName, usize> = DiGraph::new();
    let mut indices: BTreeMap<&QualifiedName, NodeIndex> = BTreeMap::new();

    for node in graph.nodes.iter().filter(|node| !planned.contains(node)) {
        indices.insert(node, digraph.add_node(node));
    }

    for (position, edge) in graph.edges.iter().enumerate() {
        if !edge.required || edge.is_self_reference() {
            continue;
        }
        if let (Some(child), Some(parent)) = (indices.get(&edge.child), indices.get(&edge.parent))
        {
            digraph.add_edge(*child, *parent, position);
        }
    }

    let mut component_of: BTreeMap<NodeIndex, usize> = BTreeMap::new();
    for (component, members) in tarjan_scc(&digraph).into_iter().enumerate() {
        if members.len() > 1 {
            for member in members {
                component_of.insert(member, component);
            }
        }
    }

    let mut edges: Vec<DependencyEdge> = digraph
        .edge_indices()
        .filter_map(|edge| {
            let (child, parent) = digraph.edge_endpoints(edge)?;
            let same_component = component_of
                .get(&child)
                .zip(component_of.get(&parent))
                .is_some_and(|(left, right)| left == right);
            if !same_component {
                return None;
            }
            let position = *digraph.edge_weight(edge)?;
            graph.edges.get(position).cloned()
        })
        .collect();
    edges.sort();

    CycleReport { edges }
}
