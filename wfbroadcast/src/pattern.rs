//! Namespace-ancestry and cycle pattern matching.
//!
//! A target matches an ancestry/cycle pair the same way an `IdResolver`
//! matches a partial reference against a small in-memory set: exact
//! match first, then the wildcard forms (`root` for namespace, `*` for
//! cycle).

use crate::entry::BroadcastTarget;

/// `true` if `target` applies to a proxy with the given namespace
/// ancestry (closest-first, e.g. `["task_a", "family_x", "root"]`) and
/// cycle point string.
pub fn matches(target: &BroadcastTarget, ancestry: &[&str], cycle: &str) -> bool {
    namespace_matches(target, ancestry) && cycle_matches(target, cycle)
}

fn namespace_matches(target: &BroadcastTarget, ancestry: &[&str]) -> bool {
    if target.namespace == "root" {
        return true;
    }
    ancestry.iter().any(|ns| *ns == target.namespace)
}

fn cycle_matches(target: &BroadcastTarget, cycle: &str) -> bool {
    target.cycle == "*" || target.cycle == cycle
}

/// Specificity rank used to order overlapping matches, least to most
/// specific: `root` namespace < an intermediate parent < the exact
/// namespace; `*` cycle < an exact cycle. Namespace specificity
/// dominates cycle specificity, matching the ordered-merge rule in the
/// component design ("namespace root -> intermediate parents -> exact
/// namespace, and `*` cycle -> exact cycle").
pub fn specificity(target: &BroadcastTarget, ancestry: &[&str]) -> u32 {
    let namespace_rank = if target.namespace == "root" {
        0
    } else {
        // Position in the ancestry chain: closer to the proxy's own
        // namespace (index 0) is more specific.
        let depth_from_leaf = ancestry.iter().position(|ns| *ns == target.namespace).unwrap_or(ancestry.len());
        (ancestry.len() - depth_from_leaf) as u32
    };
    let cycle_rank = if target.cycle == "*" { 0 } else { 1 };
    namespace_rank * 2 + cycle_rank
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_matches_any_namespace() {
        let t = BroadcastTarget::new("root", "*");
        assert!(matches(&t, &["task_a", "family_x"], "2020"));
    }

    #[test]
    fn exact_namespace_matches_only_that_namespace() {
        let t = BroadcastTarget::new("task_a", "*");
        assert!(matches(&t, &["task_a", "family_x"], "2020"));
        assert!(!matches(&t, &["task_b", "family_x"], "2020"));
    }

    #[test]
    fn wildcard_cycle_matches_any_cycle() {
        let t = BroadcastTarget::new("root", "*");
        assert!(matches(&t, &["task_a"], "2021"));
    }

    #[test]
    fn exact_cycle_matches_only_that_cycle() {
        let t = BroadcastTarget::new("root", "2020");
        assert!(matches(&t, &["task_a"], "2020"));
        assert!(!matches(&t, &["task_a"], "2021"));
    }

    #[test]
    fn exact_namespace_outranks_root() {
        let root = BroadcastTarget::new("root", "*");
        let exact = BroadcastTarget::new("task_a", "*");
        let ancestry = ["task_a", "family_x", "root"];
        assert!(specificity(&exact, &ancestry) > specificity(&root, &ancestry));
    }
}
