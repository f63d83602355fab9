//! DAG construction, cycle detection, and deterministic execution ordering.
//!
//! Uses `petgraph` to model stage dependencies as a directed graph with one
//! node per stage, added in declaration order so that node indices double as
//! declaration positions. Cycle detection is a depth-first traversal with an
//! explicit recursion stack, which lets the error name every stage on the
//! cycle. Ordering is Kahn's algorithm with a min-heap on declaration index,
//! so equal inputs always produce the same order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::unionfind::UnionFind;
use petgraph::Direction;
use thiserror::Error;
use waypoint_types::workflow::StageDefinition;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Graph defects found at validation time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    /// The dependency graph contains a cycle through these stages.
    #[error("cycle detected: {}", .stages.join(" -> "))]
    Cycle { stages: Vec<String> },

    /// A stage depends on a stage that is not declared.
    #[error("stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },
}

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

/// Build the dependency graph: an edge runs from a dependency to its dependent.
fn build_graph(stages: &[StageDefinition]) -> Result<DiGraph<&str, ()>, DagError> {
    let mut graph = DiGraph::<&str, ()>::with_capacity(stages.len(), stages.len());
    let mut index: HashMap<&str, NodeIndex> = HashMap::with_capacity(stages.len());
    for stage in stages {
        let node = graph.add_node(stage.id.as_str());
        index.entry(stage.id.as_str()).or_insert(node);
    }

    for (pos, stage) in stages.iter().enumerate() {
        let to = NodeIndex::new(pos);
        for dep in &stage.depends_on {
            let from = index.get(dep.as_str()).ok_or_else(|| DagError::UnknownDependency {
                stage: stage.id.clone(),
                dependency: dep.clone(),
            })?;
            graph.update_edge(*from, to, ());
        }
    }

    Ok(graph)
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search that returns the first cycle found, as stage IDs.
///
/// Iterative so that deep chains cannot overflow the call stack. Roots are
/// visited in declaration order, which makes the reported cycle deterministic.
fn find_cycle(graph: &DiGraph<&str, ()>) -> Option<Vec<String>> {
    let mut marks = vec![Mark::Unvisited; graph.node_count()];
    let mut path: Vec<NodeIndex> = Vec::new();

    for root in graph.node_indices() {
        if marks[root.index()] != Mark::Unvisited {
            continue;
        }

        // Each frame holds a node and its remaining successors.
        let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = Vec::new();
        marks[root.index()] = Mark::OnStack;
        path.push(root);
        stack.push((root, successors(graph, root)));

        while let Some((_, pending)) = stack.last_mut() {
            match pending.pop() {
                Some(next) => match marks[next.index()] {
                    Mark::OnStack => {
                        let start = path.iter().position(|n| *n == next).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|n| graph[*n].to_string()).collect();
                        cycle.push(graph[next].to_string());
                        return Some(cycle);
                    }
                    Mark::Unvisited => {
                        marks[next.index()] = Mark::OnStack;
                        path.push(next);
                        stack.push((next, successors(graph, next)));
                    }
                    Mark::Done => {}
                },
                None => {
                    if let Some((node, _)) = stack.pop() {
                        marks[node.index()] = Mark::Done;
                        path.pop();
                    }
                }
            }
        }
    }

    None
}

/// Successors sorted so that `pop()` yields the lowest declaration index first.
fn successors(graph: &DiGraph<&str, ()>, node: NodeIndex) -> Vec<NodeIndex> {
    let mut next: Vec<NodeIndex> = graph.neighbors_directed(node, Direction::Outgoing).collect();
    next.sort_by_key(|n| Reverse(n.index()));
    next
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Validate that stages form a DAG: every dependency exists and there are no cycles.
pub fn validate_dag(stages: &[StageDefinition]) -> Result<(), DagError> {
    let graph = build_graph(stages)?;
    match find_cycle(&graph) {
        Some(stages) => Err(DagError::Cycle { stages }),
        None => Ok(()),
    }
}

/// Compute the execution order of a validated stage list.
///
/// Returns a topological order in which ties between ready stages are
/// broken by declaration order. Fails with the same errors as
/// [`validate_dag`]; a partial order is never returned.
pub fn compute_execution_order(stages: &[StageDefinition]) -> Result<Vec<String>, DagError> {
    let graph = build_graph(stages)?;
    if let Some(cycle) = find_cycle(&graph) {
        return Err(DagError::Cycle { stages: cycle });
    }

    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(stages.len());
    while let Some(Reverse(pos)) = ready.pop() {
        order.push(stages[pos].id.clone());
        for next in graph.neighbors_directed(NodeIndex::new(pos), Direction::Outgoing) {
            let degree = &mut in_degree[next.index()];
            *degree -= 1;
            if *degree == 0 {
                ready.push(Reverse(next.index()));
            }
        }
    }

    Ok(order)
}

/// Returns the transitive closure of all dependencies for a given stage.
///
/// If `stage_id` is not found, returns an empty vec.
pub fn get_stage_dependencies<'a>(stage_id: &str, stages: &'a [StageDefinition]) -> Vec<&'a str> {
    let stage_map: HashMap<&str, &StageDefinition> =
        stages.iter().map(|s| (s.id.as_str(), s)).collect();

    let mut visited = HashSet::new();
    let mut stack = vec![stage_id];

    while let Some(current) = stack.pop() {
        if let Some(stage) = stage_map.get(current) {
            for dep in &stage.depends_on {
                if visited.insert(dep.as_str()) {
                    stack.push(dep.as_str());
                }
            }
        }
    }

    let mut deps: Vec<&str> = visited.into_iter().collect();
    deps.sort_unstable();
    deps
}

/// Whether two stages could run concurrently: neither transitively depends
/// on the other and they share no transitive dependency.
pub fn are_independent(a: &str, b: &str, stages: &[StageDefinition]) -> bool {
    if a == b {
        return false;
    }
    let deps_a: HashSet<&str> = get_stage_dependencies(a, stages).into_iter().collect();
    let deps_b: HashSet<&str> = get_stage_dependencies(b, stages).into_iter().collect();
    !deps_a.contains(b) && !deps_b.contains(a) && deps_a.is_disjoint(&deps_b)
}

/// Partition the stages into branches that share no transitive dependency.
///
/// Each branch is a weakly connected component of the dependency graph, with
/// its stages in execution order. Branches are ordered by the declaration
/// position of their first stage.
pub fn independent_branches(stages: &[StageDefinition]) -> Result<Vec<Vec<String>>, DagError> {
    let order = compute_execution_order(stages)?;
    let graph = build_graph(stages)?;

    let mut sets = UnionFind::<usize>::new(graph.node_count());
    for edge in graph.raw_edges() {
        sets.union(edge.source().index(), edge.target().index());
    }

    let position: HashMap<&str, usize> = stages
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    // Component representative -> branch index, in declaration order.
    let mut branch_of: HashMap<usize, usize> = HashMap::new();
    for i in 0..stages.len() {
        let root = sets.find(i);
        let next = branch_of.len();
        branch_of.entry(root).or_insert(next);
    }

    let mut branches = vec![Vec::new(); branch_of.len()];
    for id in order {
        let root = sets.find(position[id.as_str()]);
        branches[branch_of[&root]].push(id);
    }
    Ok(branches)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
