//! Immutable DAG over a segment set resolved from a ride (Section 4.5).

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use thiserror::Error;

use crate::types::{Ride, Segment};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("ride references undefined segment '{0}'")]
    UnresolvedReference(String),
    #[error("segment '{0}' depends on itself")]
    SelfDependency(String),
    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
    #[error("duplicate segment name '{0}'")]
    DuplicateSegmentName(String),
    #[error("maxConcurrency must be >= 1, got {0}")]
    InvalidConcurrency(usize),
    #[error("segment '{dependent}' depends on '{dependency}', which is disabled for this ride")]
    DisabledDependency { dependent: String, dependency: String },
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// Immutable DAG over the segments reachable from a ride's `flow` (plus
/// their transitive `dependsOn`), with per-ride overrides already applied.
#[derive(Debug, Clone)]
pub struct Graph {
    segments: BTreeMap<String, Segment>,
    /// Effective dependency set per segment, after override unions.
    depends_on: BTreeMap<String, BTreeSet<String>>,
    topological_order: Vec<String>,
    levels: Vec<Vec<String>>,
}

/// The authored flow shape alongside the effective topological plan, for
/// dry-run display (Section 4.5 note, Section 1B).
#[derive(Debug, Clone)]
pub struct PlanView<'a> {
    pub topological_order: &'a [String],
    pub levels: &'a [Vec<String>],
}

impl Graph {
    /// Build a graph for `ride` out of `all_segments` (the full loaded
    /// set; only the reachable subset is retained).
    pub fn build(ride: &Ride, all_segments: &[Segment]) -> Result<Self> {
        let mut by_name: BTreeMap<String, Segment> = BTreeMap::new();
        for segment in all_segments {
            if by_name.insert(segment.name.clone(), segment.clone()).is_some() {
                return Err(GraphError::DuplicateSegmentName(segment.name.clone()));
            }
        }

        if let Some(max_concurrency) = ride.max_concurrency {
            if max_concurrency < 1 {
                return Err(GraphError::InvalidConcurrency(max_concurrency));
            }
        }

        // 1. Resolve segment names referenced by flow, transitively, plus
        // their transitive dependsOn. Disabled-by-override segments are
        // dropped here so they never enter the reachable set.
        let mut referenced = BTreeSet::new();
        ride.flow.referenced_names(&mut referenced);

        let mut reachable: BTreeSet<String> = BTreeSet::new();
        let mut queue: VecDeque<String> = referenced.into_iter().collect();
        while let Some(name) = queue.pop_front() {
            if ride
                .overrides
                .get(&name)
                .is_some_and(|o| !o.enabled)
            {
                continue;
            }
            if !reachable.insert(name.clone()) {
                continue;
            }
            let Some(segment) = by_name.get(&name) else {
                return Err(GraphError::UnresolvedReference(name));
            };
            let mut deps: BTreeSet<String> = segment.depends_on.clone();
            if let Some(over) = ride.overrides.get(&name) {
                deps.extend(over.extra_depends_on.iter().cloned());
            }
            for dep in deps {
                queue.push_back(dep);
            }
        }

        // 2. Verify every reachable name has a definition, and build the
        // effective dependsOn map (override union).
        let mut depends_on: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for name in &reachable {
            let Some(segment) = by_name.get(name) else {
                return Err(GraphError::UnresolvedReference(name.clone()));
            };
            if segment.depends_on.contains(name) {
                return Err(GraphError::SelfDependency(name.clone()));
            }
            let mut deps = segment.depends_on.clone();
            if let Some(over) = ride.overrides.get(name) {
                deps.extend(over.extra_depends_on.iter().cloned());
            }
            if deps.contains(name) {
                return Err(GraphError::SelfDependency(name.clone()));
            }
            // A dependency outside the reachable set that nonetheless has
            // no definition is still an error; one inside is fine. A
            // dependency that exists but is disabled for this ride can
            // never produce a terminal status for the eligibility check
            // (Section 4.6.1 step 1) to observe, so it is a configuration
            // error rather than a silently-dropped graph node.
            for dep in &deps {
                if !by_name.contains_key(dep) {
                    return Err(GraphError::UnresolvedReference(dep.clone()));
                }
                if ride.overrides.get(dep).is_some_and(|o| !o.enabled) {
                    return Err(GraphError::DisabledDependency {
                        dependent: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            depends_on.insert(name.clone(), deps);
        }

        // 3. Cycle detection (DFS with a recursion stack).
        detect_cycle(&depends_on)?;

        // 4. Topological order (Kahn's algorithm, ties broken by name).
        let topological_order = topological_sort(&depends_on);

        // 5. Execution levels (longest distance from a root).
        let levels = compute_levels(&depends_on, &topological_order);

        let segments = by_name
            .into_iter()
            .filter(|(name, _)| reachable.contains(name))
            .collect();

        Ok(Self {
            segments,
            depends_on,
            topological_order,
            levels,
        })
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }

    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.get(name)
    }

    pub fn depends_on(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.depends_on.get(name)
    }

    pub fn topological_order(&self) -> &[String] {
        &self.topological_order
    }

    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn render_plan(&self) -> PlanView<'_> {
        PlanView {
            topological_order: &self.topological_order,
            levels: &self.levels,
        }
    }
}

fn detect_cycle(depends_on: &BTreeMap<String, BTreeSet<String>>) -> Result<()> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    let mut stack: Vec<String> = Vec::new();

    fn visit<'a>(
        name: &'a str,
        depends_on: &'a BTreeMap<String, BTreeSet<String>>,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<String>,
    ) -> Result<()> {
        if let Some(Mark::Done) = marks.get(name) {
            return Ok(());
        }
        if let Some(Mark::Visiting) = marks.get(name) {
            let start = stack.iter().position(|n| n == name).unwrap_or(0);
            let mut cycle: Vec<String> = stack[start..].to_vec();
            cycle.push(name.to_string());
            return Err(GraphError::Cycle(cycle));
        }

        marks.insert(name, Mark::Visiting);
        stack.push(name.to_string());
        if let Some(deps) = depends_on.get(name) {
            for dep in deps {
                visit(dep, depends_on, marks, stack)?;
            }
        }
        stack.pop();
        marks.insert(name, Mark::Done);
        Ok(())
    }

    for name in depends_on.keys() {
        visit(name, depends_on, &mut marks, &mut stack)?;
    }
    Ok(())
}

/// Kahn's algorithm; the ready set is a `BTreeSet` so ties break by name.
fn topological_sort(depends_on: &BTreeMap<String, BTreeSet<String>>) -> Vec<String> {
    let mut in_degree: BTreeMap<&str, usize> = depends_on
        .keys()
        .map(|name| (name.as_str(), 0))
        .collect();
    // in_degree here is "number of dependencies not yet satisfied", i.e.
    // |depends_on(name)|; we pop names whose dependencies are all done.
    for (name, deps) in depends_on {
        in_degree.insert(name.as_str(), deps.len());
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut order = Vec::new();
    let mut remaining = in_degree.clone();

    while let Some(&name) = ready.iter().next() {
        ready.remove(name);
        order.push(name.to_string());
        for (other, deps) in depends_on {
            if deps.contains(name) {
                let count = remaining.get_mut(other.as_str()).unwrap();
                *count -= 1;
                if *count == 0 {
                    ready.insert(other.as_str());
                }
            }
        }
    }

    order
}

fn compute_levels(
    depends_on: &BTreeMap<String, BTreeSet<String>>,
    topological_order: &[String],
) -> Vec<Vec<String>> {
    let mut level_of: BTreeMap<&str, usize> = BTreeMap::new();
    for name in topological_order {
        let deps = depends_on.get(name).map(BTreeSet::len).unwrap_or(0);
        let level = if deps == 0 {
            0
        } else {
            depends_on[name]
                .iter()
                .map(|dep| level_of.get(dep.as_str()).copied().unwrap_or(0))
                .max()
                .unwrap_or(0)
                + 1
        };
        level_of.insert(name.as_str(), level);
    }

    let max_level = level_of.values().copied().max();
    let Some(max_level) = max_level else {
        return Vec::new();
    };
    let mut levels = vec![Vec::new(); max_level + 1];
    for name in topological_order {
        levels[level_of[name.as_str()]].push(name.clone());
    }
    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FlowNode, Segment, SegmentOverride};
    use std::sync::Arc;

    fn seg(name: &str, deps: &[&str]) -> Segment {
        let mut s = Segment::new(name, Arc::new(|_ctx| Ok(())));
        s.depends_on = deps.iter().map(|d| d.to_string()).collect();
        s
    }

    fn seq_ride(names: &[&str]) -> Ride {
        Ride::new(
            "r",
            FlowNode::Sequence(names.iter().map(|n| FlowNode::Ref((*n).to_string())).collect()),
        )
    }

    #[test]
    fn linear_chain_topological_order() {
        let segments = vec![seg("a", &[]), seg("b", &["a"]), seg("c", &["b"])];
        let ride = seq_ride(&["a", "b", "c"]);
        let graph = Graph::build(&ride, &segments).unwrap();
        assert_eq!(graph.topological_order(), &["a", "b", "c"]);
    }

    #[test]
    fn diamond_levels() {
        let segments = vec![
            seg("a", &[]),
            seg("b", &["a"]),
            seg("c", &["a"]),
            seg("d", &["a"]),
            seg("e", &["b", "c", "d"]),
        ];
        let ride = seq_ride(&["a", "b", "c", "d", "e"]);
        let graph = Graph::build(&ride, &segments).unwrap();
        assert_eq!(graph.levels().len(), 3);
        assert_eq!(graph.levels()[0], vec!["a".to_string()]);
        assert_eq!(
            graph.levels()[1],
            vec!["b".to_string(), "c".to_string(), "d".to_string()]
        );
        assert_eq!(graph.levels()[2], vec!["e".to_string()]);
    }

    #[test]
    fn cycle_is_rejected() {
        let segments = vec![seg("a", &["b"]), seg("b", &["a"])];
        let ride = seq_ride(&["a", "b"]);
        let err = Graph::build(&ride, &segments).unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let segments = vec![seg("a", &["a"])];
        let ride = seq_ride(&["a"]);
        let err = Graph::build(&ride, &segments).unwrap_err();
        assert_eq!(err, GraphError::SelfDependency("a".to_string()));
    }

    #[test]
    fn unresolved_reference_is_rejected() {
        let segments = vec![seg("a", &[])];
        let ride = seq_ride(&["missing"]);
        let err = Graph::build(&ride, &segments).unwrap_err();
        assert_eq!(err, GraphError::UnresolvedReference("missing".to_string()));
    }

    #[test]
    fn duplicate_segment_name_is_rejected() {
        let segments = vec![seg("a", &[]), seg("a", &[])];
        let ride = seq_ride(&["a"]);
        let err = Graph::build(&ride, &segments).unwrap_err();
        assert_eq!(err, GraphError::DuplicateSegmentName("a".to_string()));
    }

    #[test]
    fn unreachable_definitions_are_silently_excluded() {
        let segments = vec![seg("a", &[]), seg("unused", &[])];
        let ride = seq_ride(&["a"]);
        let graph = Graph::build(&ride, &segments).unwrap();
        assert!(graph.segment("unused").is_none());
        assert_eq!(graph.segments().count(), 1);
    }

    #[test]
    fn disabled_override_drops_segment_from_reachable_set() {
        let segments = vec![seg("a", &[]), seg("b", &["a"])];
        let mut ride = seq_ride(&["a", "b"]);
        ride.overrides.insert("b".to_string(), SegmentOverride::disabled());
        let graph = Graph::build(&ride, &segments).unwrap();
        assert!(graph.segment("b").is_none());
    }

    #[test]
    fn live_segment_depending_on_a_disabled_segment_is_rejected() {
        let segments = vec![seg("a", &[]), seg("b", &["a"])];
        let mut ride = seq_ride(&["b"]);
        ride.overrides.insert("a".to_string(), SegmentOverride::disabled());
        let err = Graph::build(&ride, &segments).unwrap_err();
        assert_eq!(
            err,
            GraphError::DisabledDependency {
                dependent: "b".to_string(),
                dependency: "a".to_string(),
            }
        );
    }

    #[test]
    fn override_extra_depends_on_is_unioned() {
        let segments = vec![seg("a", &[]), seg("b", &[]), seg("c", &[])];
        let mut ride = seq_ride(&["a", "b", "c"]);
        let mut over = SegmentOverride::new();
        over.extra_depends_on.insert("a".to_string());
        ride.overrides.insert("c".to_string(), over);
        let graph = Graph::build(&ride, &segments).unwrap();
        assert!(graph.depends_on("c").unwrap().contains("a"));
    }

    #[test]
    fn empty_flow_produces_empty_graph() {
        let segments = vec![seg("a", &[])];
        let ride = Ride::new("r", FlowNode::Sequence(vec![]));
        let graph = Graph::build(&ride, &segments).unwrap();
        assert!(graph.is_empty());
    }

    #[test]
    fn invalid_concurrency_is_rejected() {
        let segments = vec![seg("a", &[])];
        let mut ride = seq_ride(&["a"]);
        ride.max_concurrency = Some(0);
        let err = Graph::build(&ride, &segments).unwrap_err();
        assert_eq!(err, GraphError::InvalidConcurrency(0));
    }

    #[test]
    fn topological_order_linearises_dependencies() {
        let segments = vec![
            seg("a", &[]),
            seg("b", &["a"]),
            seg("c", &["a"]),
            seg("d", &["b", "c"]),
        ];
        let ride = seq_ride(&["a", "b", "c", "d"]);
        let graph = Graph::build(&ride, &segments).unwrap();
        let order = graph.topological_order();
        let index = |n: &str| order.iter().position(|x| x == n).unwrap();
        for (name, deps) in [("b", ["a"]), ("c", ["a"])] {
            for dep in deps {
                assert!(index(dep) < index(name));
            }
        }
        assert!(index("b") < index("d"));
        assert!(index("c") < index("d"));
    }
}
