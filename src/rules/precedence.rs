//! Conflict resolution over the set of rules matching one host.

use std::cmp::Ordering;

use super::{Rule, RuleAction, RuleKind};

/// The outcome of evaluating a host against the rule database.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow(Rule),
    Block(Rule),
    /// No rule matched; the query is forwarded.
    Unknown,
}

impl Verdict {
    pub fn is_block(&self) -> bool {
        matches!(self, Verdict::Block(_))
    }
}

/// Order two rules of the same action; `Greater` wins.
///
/// Higher priority first, then source rank, then specificity (exact >
/// wildcard > regex; longer suffix between wildcards), then a
/// deterministic lexicographic tail so resolution is a total order.
fn stronger(a: &Rule, b: &Rule) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| a.source.rank().cmp(&b.source.rank()))
        .then_with(|| a.kind.specificity().cmp(&b.kind.specificity()))
        .then_with(|| {
            if a.kind == RuleKind::Wildcard && b.kind == RuleKind::Wildcard {
                a.domain.len().cmp(&b.domain.len())
            } else {
                Ordering::Equal
            }
        })
        // Lexicographically smallest domain (and pattern, for regex rules,
        // whose pattern is the domain field) wins the final tie.
        .then_with(|| b.domain.cmp(&a.domain))
}

/// Resolve the matching set into a verdict.
///
/// The strongest rule of each action is found independently; a block only
/// wins when its priority is strictly higher than the best allow.
pub fn resolve(matching: &[Rule]) -> Verdict {
    let best_allow = matching
        .iter()
        .filter(|r| r.action == RuleAction::Allow)
        .max_by(|a, b| stronger(a, b));
    let best_block = matching
        .iter()
        .filter(|r| r.action == RuleAction::Block)
        .max_by(|a, b| stronger(a, b));

    match (best_allow, best_block) {
        (Some(allow), Some(block)) => {
            if block.priority > allow.priority {
                Verdict::Block(block.clone())
            } else {
                Verdict::Allow(allow.clone())
            }
        }
        (Some(allow), None) => Verdict::Allow(allow.clone()),
        (None, Some(block)) => Verdict::Block(block.clone()),
        (None, None) => Verdict::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleSource;

    fn rule(
        domain: &str,
        kind: RuleKind,
        action: RuleAction,
        source: RuleSource,
        priority: u32,
    ) -> Rule {
        Rule {
            domain: domain.to_string(),
            kind,
            action,
            source,
            priority,
            comment: None,
        }
    }

    #[test]
    fn test_empty_set_is_unknown() {
        assert_eq!(resolve(&[]), Verdict::Unknown);
    }

    #[test]
    fn test_allow_wins_at_equal_priority() {
        let rules = vec![
            rule("x.com", RuleKind::Exact, RuleAction::Block, RuleSource::User, 100),
            rule("x.com", RuleKind::Exact, RuleAction::Allow, RuleSource::User, 100),
        ];
        assert!(matches!(resolve(&rules), Verdict::Allow(_)));
    }

    #[test]
    fn test_higher_priority_block_wins() {
        let rules = vec![
            rule("x.com", RuleKind::Exact, RuleAction::Allow, RuleSource::User, 100),
            rule("x.com", RuleKind::Exact, RuleAction::Block, RuleSource::Manifest, 200),
        ];
        assert!(matches!(resolve(&rules), Verdict::Block(_)));
    }

    #[test]
    fn test_allow_override_of_wildcard_block() {
        // A user allow at higher priority punches through a manifest block
        let rules = vec![
            rule("blocked.com", RuleKind::Wildcard, RuleAction::Block, RuleSource::Manifest, 100),
            rule(
                "allowed.blocked.com",
                RuleKind::Exact,
                RuleAction::Allow,
                RuleSource::User,
                150,
            ),
        ];
        assert!(matches!(resolve(&rules), Verdict::Allow(_)));
    }

    #[test]
    fn test_source_order_tie_break() {
        let rules = vec![
            rule("x.com", RuleKind::Exact, RuleAction::Block, RuleSource::Default, 100),
            rule("x.com", RuleKind::Exact, RuleAction::Block, RuleSource::User, 100),
        ];
        match resolve(&rules) {
            Verdict::Block(winner) => assert_eq!(winner.source, RuleSource::User),
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[test]
    fn test_specificity_tie_break() {
        let rules = vec![
            rule("x.com", RuleKind::Wildcard, RuleAction::Block, RuleSource::User, 100),
            rule("a.x.com", RuleKind::Exact, RuleAction::Block, RuleSource::User, 100),
        ];
        match resolve(&rules) {
            Verdict::Block(winner) => assert_eq!(winner.kind, RuleKind::Exact),
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[test]
    fn test_longer_wildcard_suffix_wins() {
        let rules = vec![
            rule("x.com", RuleKind::Wildcard, RuleAction::Block, RuleSource::User, 100),
            rule("sub.x.com", RuleKind::Wildcard, RuleAction::Allow, RuleSource::User, 100),
        ];
        // Equal priority: allow wins outright, and it is also the longer suffix
        assert!(matches!(resolve(&rules), Verdict::Allow(_)));

        let blocks_only = vec![
            rule("x.com", RuleKind::Wildcard, RuleAction::Block, RuleSource::User, 100),
            rule("sub.x.com", RuleKind::Wildcard, RuleAction::Block, RuleSource::User, 100),
        ];
        match resolve(&blocks_only) {
            Verdict::Block(winner) => assert_eq!(winner.domain, "sub.x.com"),
            other => panic!("expected block, got {:?}", other),
        }
    }

    #[test]
    fn test_deterministic_lexicographic_tail() {
        let rules = vec![
            rule("b.com", RuleKind::Exact, RuleAction::Block, RuleSource::User, 100),
            rule("a.com", RuleKind::Exact, RuleAction::Block, RuleSource::User, 100),
        ];
        match resolve(&rules) {
            Verdict::Block(winner) => assert_eq!(winner.domain, "a.com"),
            other => panic!("expected block, got {:?}", other),
        }
    }
}
