//! Dependency ordering of flushed rows.
//!
//! Every pending insert (or delete) is a node; an edge `a -> b` says `a`
//! holds a foreign key to `b`, so `b` must be inserted first (and `a` deleted
//! first). Strongly connected components are found with Tarjan's algorithm,
//! which yields them dependencies-first.
//!
//! Cycles are broken in two ways:
//!
//! - nullable edges inside a component are deferred: the row is written with
//!   the reference NULL and patched by a follow-up update (for deletes, the
//!   reference is nulled before the delete);
//! - a cycle left over after that must lie within one table, and its rows are
//!   written by a single multi-row statement, which storage checks as a whole.
//!
//! Anything else cannot be ordered and is reported as a [`CycleError`].

use std::collections::{HashMap, HashSet};

/// An outgoing foreign key of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Edge {
    pub(crate) to: usize,
    pub(crate) nullable: bool,
}

/// Nodes (rows) with their table group and outgoing edges.
#[derive(Debug, Default)]
pub(crate) struct DependencyGraph {
    groups: Vec<usize>,
    edges: Vec<Vec<Edge>>,
}

impl DependencyGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a node written to table `group`.
    pub(crate) fn add_node(&mut self, group: usize) -> usize {
        self.groups.push(group);
        self.edges.push(Vec::new());
        self.groups.len() - 1
    }

    pub(crate) fn add_edge(&mut self, from: usize, to: usize, nullable: bool) {
        let edge = Edge { to, nullable };
        if !self.edges[from].contains(&edge) {
            self.edges[from].push(edge);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.groups.len()
    }

    fn has_self_edge(&self, node: usize, include_nullable: bool) -> bool {
        self.edges[node]
            .iter()
            .any(|e| e.to == node && (include_nullable || !e.nullable))
    }
}

/// One unit of the write order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    Single(usize),
    /// Rows of one table that must be written by one statement
    Group(Vec<usize>),
}

/// Write order plus the edges whose references are written separately.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Schedule {
    /// Dependencies first
    pub(crate) steps: Vec<Step>,
    /// `(from, to)`: `from`'s reference to `to` is deferred
    pub(crate) deferred: Vec<(usize, usize)>,
}

/// Rows that form a cycle no statement order can satisfy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CycleError {
    pub(crate) nodes: Vec<usize>,
}

/// Order the graph's nodes dependencies-first.
pub(crate) fn schedule(graph: &DependencyGraph) -> Result<Schedule, CycleError> {
    let all: Vec<usize> = (0..graph.len()).collect();
    let components = strongly_connected(&all, |v| graph.edges[v].iter().map(|e| e.to).collect());

    let mut plan = Schedule::default();
    for component in components {
        if component.len() == 1 && !graph.has_self_edge(component[0], true) {
            plan.steps.push(Step::Single(component[0]));
            continue;
        }

        let members: HashSet<usize> = component.iter().copied().collect();
        for &node in &component {
            for edge in &graph.edges[node] {
                if edge.nullable && members.contains(&edge.to) {
                    plan.deferred.push((node, edge.to));
                }
            }
        }

        let rigid = strongly_connected(&component, |v| {
            graph.edges[v]
                .iter()
                .filter(|e| !e.nullable && members.contains(&e.to))
                .map(|e| e.to)
                .collect()
        });
        for sub in rigid {
            if sub.len() == 1 && !graph.has_self_edge(sub[0], false) {
                plan.steps.push(Step::Single(sub[0]));
            } else if sub.iter().all(|n| graph.groups[*n] == graph.groups[sub[0]]) {
                plan.steps.push(Step::Group(sub));
            } else {
                return Err(CycleError { nodes: sub });
            }
        }
    }
    Ok(plan)
}

/// Tarjan's algorithm over `nodes`, iterative.
///
/// Components come out in reverse topological order of the condensation:
/// every component is emitted after all components it has edges into.
fn strongly_connected(nodes: &[usize], successors: impl Fn(usize) -> Vec<usize>) -> Vec<Vec<usize>> {
    let scope: HashSet<usize> = nodes.iter().copied().collect();
    let mut index: HashMap<usize, usize> = HashMap::new();
    let mut low: HashMap<usize, usize> = HashMap::new();
    let mut on_stack: HashSet<usize> = HashSet::new();
    let mut stack: Vec<usize> = Vec::new();
    let mut components = Vec::new();
    let mut counter = 0;

    for &root in nodes {
        if index.contains_key(&root) {
            continue;
        }
        let mut calls: Vec<(usize, Vec<usize>, usize)> = Vec::new();
        index.insert(root, counter);
        low.insert(root, counter);
        counter += 1;
        stack.push(root);
        on_stack.insert(root);
        calls.push((root, successors(root), 0));

        while let Some(frame) = calls.last_mut() {
            let v = frame.0;
            if frame.2 < frame.1.len() {
                let w = frame.1[frame.2];
                frame.2 += 1;
                if !scope.contains(&w) {
                    continue;
                }
                if let Some(&w_index) = index.get(&w) {
                    if on_stack.contains(&w) {
                        let v_low = low[&v].min(w_index);
                        low.insert(v, v_low);
                    }
                } else {
                    index.insert(w, counter);
                    low.insert(w, counter);
                    counter += 1;
                    stack.push(w);
                    on_stack.insert(w);
                    calls.push((w, successors(w), 0));
                }
                continue;
            }

            calls.pop();
            let v_low = low[&v];
            if let Some(parent) = calls.last() {
                let parent_low = low[&parent.0].min(v_low);
                low.insert(parent.0, parent_low);
            }
            if v_low == index[&v] {
                let mut component = Vec::new();
                while let Some(w) = stack.pop() {
                    on_stack.remove(&w);
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                component.reverse();
                components.push(component);
            }
        }
    }
    components
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_is_written_dependencies_first() {
        let mut g = DependencyGraph::new();
        let child = g.add_node(0);
        let parent = g.add_node(1);
        let grandparent = g.add_node(2);
        g.add_edge(child, parent, false);
        g.add_edge(parent, grandparent, false);

        let plan = schedule(&g).unwrap();
        assert_eq!(
            plan.steps,
            vec![Step::Single(grandparent), Step::Single(parent), Step::Single(child)]
        );
        assert!(plan.deferred.is_empty());
    }

    #[test]
    fn nullable_edge_in_cycle_is_deferred() {
        let mut g = DependencyGraph::new();
        let a = g.add_node(0);
        let b = g.add_node(1);
        g.add_edge(a, b, false);
        g.add_edge(b, a, true);

        let plan = schedule(&g).unwrap();
        assert_eq!(plan.deferred, vec![(b, a)]);
        assert_eq!(plan.steps, vec![Step::Single(b), Step::Single(a)]);
    }

    #[test]
    fn rigid_cycle_within_one_table_becomes_a_group() {
        let mut g = DependencyGraph::new();
        let a = g.add_node(3);
        let b = g.add_node(3);
        g.add_edge(a, b, false);
        g.add_edge(b, a, false);

        let plan = schedule(&g).unwrap();
        assert_eq!(plan.steps.len(), 1);
        let Step::Group(nodes) = &plan.steps[0] else {
            panic!("expected a group");
        };
        let mut nodes = nodes.clone();
        nodes.sort_unstable();
        assert_eq!(nodes, vec![a, b]);
    }

    #[test]
    fn rigid_cycle_across_tables_is_rejected() {
        let mut g = DependencyGraph::new();
        let a = g.add_node(0);
        let b = g.add_node(1);
        g.add_edge(a, b, false);
        g.add_edge(b, a, false);

        let err = schedule(&g).unwrap_err();
        assert_eq!(err.nodes.len(), 2);
    }

    #[test]
    fn non_null_self_reference_is_a_single_row_group() {
        let mut g = DependencyGraph::new();
        let a = g.add_node(0);
        g.add_edge(a, a, false);
        let plan = schedule(&g).unwrap();
        assert_eq!(plan.steps, vec![Step::Group(vec![a])]);
    }

    #[test]
    fn independent_nodes_keep_input_order() {
        let mut g = DependencyGraph::new();
        let a = g.add_node(0);
        let b = g.add_node(0);
        let plan = schedule(&g).unwrap();
        assert_eq!(plan.steps, vec![Step::Single(a), Step::Single(b)]);
    }
}
