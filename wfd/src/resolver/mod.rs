//! The Dependency Resolver: compiles configured graph strings into edge
//! templates and walks them whenever a proxy emits an output.
//!
//! Grounded on the teacher's dependency-graph handling in
//! `r#loop/manager.rs` (`validate_dependency_graph`'s DFS-based
//! structure), generalized from a task-completion DAG to a recurring,
//! offset-aware one.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::domain::proxy::{
    OUTPUT_FAILED, OUTPUT_STARTED, OUTPUT_SUBMITTED, OUTPUT_SUBMIT_FAILED, OUTPUT_SUCCEEDED, PrereqGroup, PrereqTriple,
    Prerequisites,
};
use crate::pool::TaskPool;

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("malformed graph string: {0:?}")]
    MalformedGraphString(String),
    #[error("prerequisite on {downstream} references a cycle not on its own recurrence: {cycle}")]
    CycleNotOnRecurrence { downstream: String, cycle: String },
}

/// One `(upstream, cycle_offset, output) -> downstream` relationship
/// compiled out of a graph string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeTemplate {
    pub upstream_name: String,
    pub cycle_offset: i64,
    pub output: String,
    pub downstream_name: String,
    pub downstream_group: usize,
    pub suicide: bool,
}

/// A parsed right-hand-side member: a disjunction within a conjunctive
/// group, e.g. in `a & (b | c) => d` the group `(b | c)` parses to two
/// `EdgeMember`s sharing `group`.
struct EdgeMember {
    upstream_name: String,
    cycle_offset: i64,
    output: String,
}

/// Parses one graph-string line (e.g. `"foo[-P1] => bar"`,
/// `"foo:fail => bar"`, `"foo & baz => bar"`, `"foo | baz => bar"`,
/// `"foo => !bar"`) into edge templates rooted at `downstream_group = 0`.
///
/// Supports a single level of conjunction/disjunction on the left-hand
/// side; nested parenthesised groups are out of scope (REDESIGN FLAGS
/// does not ask for the full suite.rc grammar, only trigger kinds and
/// conjunctions/disjunctions).
pub fn parse_graph_line(line: &str) -> Result<Vec<EdgeTemplate>, ResolverError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(Vec::new());
    }
    let (lhs, rhs) = line
        .split_once("=>")
        .ok_or_else(|| ResolverError::MalformedGraphString(line.to_string()))?;
    let rhs = rhs.trim();
    let (downstream_name, suicide) = if let Some(stripped) = rhs.strip_prefix('!') {
        (stripped.trim().to_string(), true)
    } else {
        (rhs.to_string(), false)
    };
    if downstream_name.is_empty() {
        return Err(ResolverError::MalformedGraphString(line.to_string()));
    }

    // `&` groups are ANDed (each becomes its own downstream_group);
    // `|` within a group is ORed (members share a downstream_group).
    let conjuncts: Vec<&str> = lhs.split('&').collect();
    let mut templates = Vec::new();
    for (group_idx, conjunct) in conjuncts.iter().enumerate() {
        for disjunct in conjunct.split('|') {
            let member = parse_member(disjunct.trim())?;
            templates.push(EdgeTemplate {
                upstream_name: member.upstream_name,
                cycle_offset: member.cycle_offset,
                output: member.output,
                downstream_name: downstream_name.clone(),
                downstream_group: group_idx,
                suicide,
            });
        }
    }
    Ok(templates)
}

fn parse_member(text: &str) -> Result<EdgeMember, ResolverError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ResolverError::MalformedGraphString(text.to_string()));
    }

    let (name_and_offset, output) = match text.split_once(':') {
        Some((n, o)) => (n, trigger_output(o)?),
        None => (text, OUTPUT_SUCCEEDED.to_string()),
    };

    let (name, offset) = if let Some(open) = name_and_offset.find('[') {
        let close = name_and_offset
            .find(']')
            .ok_or_else(|| ResolverError::MalformedGraphString(text.to_string()))?;
        let name = name_and_offset[..open].to_string();
        let offset_text = &name_and_offset[open + 1..close];
        (name, parse_offset(offset_text)?)
    } else {
        (name_and_offset.to_string(), 0)
    };

    Ok(EdgeMember { upstream_name: name.trim().to_string(), cycle_offset: offset, output })
}

fn trigger_output(kind: &str) -> Result<String, ResolverError> {
    Ok(match kind.trim() {
        "succeed" | "succeeded" => OUTPUT_SUCCEEDED.to_string(),
        "fail" | "failed" => OUTPUT_FAILED.to_string(),
        "start" | "started" => OUTPUT_STARTED.to_string(),
        "submit" | "submitted" => OUTPUT_SUBMITTED.to_string(),
        "submit-fail" | "submit-failed" => OUTPUT_SUBMIT_FAILED.to_string(),
        "finish" | "finished" => "finished".to_string(),
        other => other.to_string(),
    })
}

/// Integer offsets (`-P1`) parse as `-1`; calendar offsets are resolved
/// against a recurrence's step elsewhere, so only the `-P<n>` integer
/// shorthand is handled generically here. A bare empty offset is `0`.
fn parse_offset(text: &str) -> Result<i64, ResolverError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(0);
    }
    let negative = text.starts_with('-');
    let digits: String = text.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Err(ResolverError::MalformedGraphString(text.to_string()));
    }
    let magnitude: i64 = digits.parse().map_err(|_| ResolverError::MalformedGraphString(text.to_string()))?;
    Ok(if negative { -magnitude } else { magnitude })
}

/// The compiled form: edges grouped by `(upstream_name, output)` for
/// fast lookup on emission, and by `downstream_name` for validating
/// that a referenced cycle sits on the downstream's own recurrence.
pub struct CompiledGraph {
    by_trigger: HashMap<(String, String), Vec<EdgeTemplate>>,
    by_downstream: HashMap<String, Vec<EdgeTemplate>>,
    downstream_names: std::collections::HashSet<String>,
}

impl CompiledGraph {
    pub fn compile(lines: &[&str]) -> Result<Self, ResolverError> {
        let mut by_trigger: HashMap<(String, String), Vec<EdgeTemplate>> = HashMap::new();
        let mut by_downstream: HashMap<String, Vec<EdgeTemplate>> = HashMap::new();
        let mut downstream_names = std::collections::HashSet::new();
        for line in lines {
            for edge in parse_graph_line(line)? {
                downstream_names.insert(edge.downstream_name.clone());
                by_downstream.entry(edge.downstream_name.clone()).or_default().push(edge.clone());
                by_trigger
                    .entry((edge.upstream_name.clone(), edge.output.clone()))
                    .or_default()
                    .push(edge);
            }
        }
        Ok(Self { by_trigger, by_downstream, downstream_names })
    }

    pub fn edges_for(&self, upstream_name: &str, output: &str) -> &[EdgeTemplate] {
        self.by_trigger.get(&(upstream_name.to_string(), output.to_string())).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_downstream(&self, name: &str) -> bool {
        self.downstream_names.contains(name)
    }

    /// Builds the full prerequisite structure a freshly materialized
    /// `downstream_name/downstream_cycle` proxy starts with: one
    /// `PrereqGroup` per conjunctive group in the graph line that named
    /// it, each holding every disjunct's `(upstream, cycle, output)`
    /// triple, unsatisfied. `cycle_of_offset` is the same
    /// anchor-to-target mapping `on_output_emitted` uses, called here
    /// with the offset negated to walk from the downstream's cycle back
    /// to each upstream's.
    pub fn prerequisites_for(
        &self,
        downstream_name: &str,
        downstream_cycle: &str,
        cycle_of_offset: impl Fn(&str, i64) -> String,
    ) -> Prerequisites {
        let Some(edges) = self.by_downstream.get(downstream_name) else {
            return Prerequisites::default();
        };
        let mut groups: std::collections::BTreeMap<usize, Vec<PrereqTriple>> = std::collections::BTreeMap::new();
        for edge in edges {
            if edge.suicide {
                // A suicide trigger removes the downstream once its own
                // prerequisites are otherwise met; it is not itself
                // something the downstream must wait to be admitted.
                continue;
            }
            let upstream_cycle = cycle_of_offset(downstream_cycle, -edge.cycle_offset);
            groups
                .entry(edge.downstream_group)
                .or_default()
                .push(PrereqTriple::new(edge.upstream_name.clone(), upstream_cycle, edge.output.clone()));
        }
        Prerequisites(groups.into_values().map(PrereqGroup).collect())
    }
}

/// Walks a proxy's emitted output through the compiled graph, spawning
/// or updating downstream proxies. `cycle_of_offset` maps
/// `(anchor_cycle, offset)` to the downstream's concrete cycle string;
/// `is_on_recurrence(downstream_name, cycle)` validates the target cycle
/// belongs to the downstream's own sequence before spawning it.
pub fn on_output_emitted(
    graph: &CompiledGraph,
    pool: &mut TaskPool,
    upstream_name: &str,
    upstream_cycle: &str,
    output: &str,
    now: i64,
    cycle_of_offset: impl Fn(&str, i64) -> String,
    is_on_recurrence: impl Fn(&str, &str) -> bool,
) -> Result<(), ResolverError> {
    let finished_alias = output == OUTPUT_SUCCEEDED || output == OUTPUT_FAILED;
    let mut outputs_to_walk = vec![output.to_string()];
    if finished_alias {
        outputs_to_walk.push("finished".to_string());
    }

    for walked in outputs_to_walk {
        for edge in graph.edges_for(upstream_name, &walked) {
            let downstream_cycle = cycle_of_offset(upstream_cycle, edge.cycle_offset);
            if !is_on_recurrence(&edge.downstream_name, &downstream_cycle) {
                return Err(ResolverError::CycleNotOnRecurrence {
                    downstream: edge.downstream_name.clone(),
                    cycle: downstream_cycle,
                });
            }

            if edge.suicide {
                let satisfied = pool.update_prereq(&edge.downstream_name, &downstream_cycle, upstream_name, upstream_cycle, &walked);
                if satisfied {
                    pool.evict(&edge.downstream_name, &downstream_cycle, true, true);
                }
                continue;
            }

            let prerequisites = graph.prerequisites_for(&edge.downstream_name, &downstream_cycle, &cycle_of_offset);
            pool.spawn_with_prerequisites(&edge.downstream_name, &downstream_cycle, false, now, prerequisites);
            let became_satisfied =
                pool.update_prereq(&edge.downstream_name, &downstream_cycle, upstream_name, upstream_cycle, &walked);
            debug!(
                downstream = %edge.downstream_name,
                cycle = %downstream_cycle,
                became_satisfied,
                "resolver updated prerequisite"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn parses_simple_trigger_defaulting_to_succeeded() {
        let edges = parse_graph_line("a => b").unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].upstream_name, "a");
        assert_eq!(edges[0].output, OUTPUT_SUCCEEDED);
        assert_eq!(edges[0].downstream_name, "b");
        assert!(!edges[0].suicide);
    }

    #[test]
    fn parses_explicit_trigger_and_offset() {
        let edges = parse_graph_line("a[-P1]:fail => b").unwrap();
        assert_eq!(edges[0].cycle_offset, -1);
        assert_eq!(edges[0].output, OUTPUT_FAILED);
    }

    #[test]
    fn parses_conjunction_into_distinct_groups() {
        let edges = parse_graph_line("a & b => c").unwrap();
        assert_eq!(edges.len(), 2);
        assert_ne!(edges[0].downstream_group, edges[1].downstream_group);
    }

    #[test]
    fn parses_disjunction_into_shared_group() {
        let edges = parse_graph_line("a | b => c").unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].downstream_group, edges[1].downstream_group);
    }

    #[test]
    fn parses_suicide_trigger() {
        let edges = parse_graph_line("a:fail => !b").unwrap();
        assert!(edges[0].suicide);
        assert_eq!(edges[0].downstream_name, "b");
    }

    #[test]
    fn on_output_emitted_spawns_and_satisfies_downstream() {
        let graph = CompiledGraph::compile(&["a => b"]).unwrap();
        let mut pool = TaskPool::new(3, HashMap::new(), HashMap::new());

        on_output_emitted(&graph, &mut pool, "a", "1", OUTPUT_SUCCEEDED, 0, |_, _| "1".to_string(), |_, _| true).unwrap();

        let downstream = pool.get("b", "1").expect("spawned");
        assert!(downstream.prerequisites.is_satisfied());
    }

    #[test]
    fn on_output_emitted_rejects_cycle_off_recurrence() {
        let graph = CompiledGraph::compile(&["a => b"]).unwrap();
        let mut pool = TaskPool::new(3, HashMap::new(), HashMap::new());

        let err =
            on_output_emitted(&graph, &mut pool, "a", "1", OUTPUT_SUCCEEDED, 0, |_, _| "1".to_string(), |_, _| false).unwrap_err();
        assert!(matches!(err, ResolverError::CycleNotOnRecurrence { .. }));
    }
}
