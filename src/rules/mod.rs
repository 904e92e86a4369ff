pub mod database;
pub mod parser;
pub mod precedence;

pub use database::{RuleCounts, RuleDatabase};
pub use precedence::{Verdict, resolve};

use serde::{Deserialize, Serialize};

/// What a matching rule does to the query.
///
/// The integer values are the persisted encoding in the rule database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleAction {
    Block,
    Allow,
}

impl RuleAction {
    pub fn as_db(self) -> i64 {
        match self {
            RuleAction::Block => 0,
            RuleAction::Allow => 1,
        }
    }

    pub fn from_db(value: i64) -> Option<Self> {
        match value {
            0 => Some(RuleAction::Block),
            1 => Some(RuleAction::Allow),
            _ => None,
        }
    }
}

/// How the rule's `domain` field is interpreted when matching a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleKind {
    Exact,
    Wildcard,
    Regex,
}

impl RuleKind {
    pub fn as_db(self) -> i64 {
        match self {
            RuleKind::Exact => 0,
            RuleKind::Wildcard => 1,
            RuleKind::Regex => 2,
        }
    }

    pub fn from_db(value: i64) -> Option<Self> {
        match value {
            0 => Some(RuleKind::Exact),
            1 => Some(RuleKind::Wildcard),
            2 => Some(RuleKind::Regex),
            _ => None,
        }
    }

    /// Specificity rank used as a precedence tie-break: exact rules beat
    /// wildcards, wildcards beat regexes.
    pub fn specificity(self) -> u8 {
        match self {
            RuleKind::Exact => 2,
            RuleKind::Wildcard => 1,
            RuleKind::Regex => 0,
        }
    }
}

/// Where a rule came from. Sources tie-break precedence and scope bulk
/// invalidation; the integer encoding doubles as the precedence rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleSource {
    Default,
    System,
    Manifest,
    Managed,
    User,
}

impl RuleSource {
    pub fn as_db(self) -> i64 {
        self.rank() as i64
    }

    pub fn from_db(value: i64) -> Option<Self> {
        match value {
            0 => Some(RuleSource::Default),
            1 => Some(RuleSource::System),
            2 => Some(RuleSource::Manifest),
            3 => Some(RuleSource::Managed),
            4 => Some(RuleSource::User),
            _ => None,
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            RuleSource::Default => 0,
            RuleSource::System => 1,
            RuleSource::Manifest => 2,
            RuleSource::Managed => 3,
            RuleSource::User => 4,
        }
    }
}

/// Whether a wildcard rule also covers the bare suffix itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WildcardMode {
    /// `*.example.com` matches subdomains only.
    SubdomainsOnly,
    /// `*.example.com` matches subdomains and `example.com` itself.
    #[default]
    IncludeRoot,
}

/// A single filtering rule.
///
/// `domain` is stored lowercase; wildcard rules store only the suffix (the
/// leading `*.` is stripped on construction); regex rules store the
/// pattern text and are compiled once by the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub domain: String,
    pub kind: RuleKind,
    pub action: RuleAction,
    pub source: RuleSource,
    pub priority: u32,
    pub comment: Option<String>,
}

impl Rule {
    /// Build a rule from a domain spec, inferring the wildcard kind from a
    /// leading `*.` and normalizing case.
    pub fn from_domain_spec(
        spec: &str,
        action: RuleAction,
        source: RuleSource,
        priority: u32,
    ) -> Self {
        let spec = normalize_domain(spec);
        if let Some(suffix) = spec.strip_prefix("*.") {
            Rule {
                domain: suffix.to_string(),
                kind: RuleKind::Wildcard,
                action,
                source,
                priority,
                comment: None,
            }
        } else {
            Rule {
                domain: spec,
                kind: RuleKind::Exact,
                action,
                source,
                priority,
                comment: None,
            }
        }
    }

    /// Whether this rule matches `host`. Regex rules cannot be decided
    /// here (compilation happens in the database layer) and return false.
    pub fn matches(&self, host: &str, mode: WildcardMode) -> bool {
        let host = normalize_domain(host);
        match self.kind {
            RuleKind::Exact => host == self.domain,
            RuleKind::Wildcard => wildcard_matches(&self.domain, &host, mode),
            RuleKind::Regex => false,
        }
    }
}

/// Lowercase and strip the trailing root dot. Wire-format names arrive
/// already punycoded, so ASCII casing is the only normalization needed.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_lowercase()
}

/// Suffix-or-equal wildcard matching over a stored (already stripped)
/// suffix. `*.foo.com` never matches `barfoo.com`: the boundary must be a
/// label dot.
pub fn wildcard_matches(suffix: &str, host: &str, mode: WildcardMode) -> bool {
    if host == suffix {
        return mode == WildcardMode::IncludeRoot;
    }
    host.len() > suffix.len()
        && host.ends_with(suffix)
        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
}

/// The parent-suffix walk used by the database lookup: `a.b.c` yields
/// `["a.b.c", "b.c", "c"]`.
pub fn parent_suffixes(host: &str) -> Vec<String> {
    let mut suffixes = vec![host.to_string()];
    let mut rest = host;
    while let Some(dot) = rest.find('.') {
        rest = &rest[dot + 1..];
        if !rest.is_empty() {
            suffixes.push(rest.to_string());
        }
    }
    suffixes
}

/// Metadata attached to a parsed rule set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSetMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub custom_fields: serde_json::Map<String, serde_json::Value>,
}

/// A parsed collection of rules from one source document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub metadata: RuleSetMetadata,
}

impl RuleSet {
    pub fn approx_size(&self) -> usize {
        // Rough per-rule accounting for the cache's byte budget
        self.rules
            .iter()
            .map(|r| {
                48 + r.domain.len() + r.comment.as_deref().map_or(0, str::len)
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_case_insensitive() {
        let rule = Rule::from_domain_spec("Ads.Example.COM", RuleAction::Block, RuleSource::User, 100);
        assert_eq!(rule.domain, "ads.example.com");
        assert!(rule.matches("ADS.example.com", WildcardMode::IncludeRoot));
        assert!(!rule.matches("example.com", WildcardMode::IncludeRoot));
        assert!(!rule.matches("notads.example.com", WildcardMode::IncludeRoot));
    }

    #[test]
    fn test_wildcard_strips_star_dot() {
        let rule =
            Rule::from_domain_spec("*.tracker.net", RuleAction::Block, RuleSource::Manifest, 100);
        assert_eq!(rule.kind, RuleKind::Wildcard);
        assert_eq!(rule.domain, "tracker.net");
    }

    #[test]
    fn test_wildcard_subdomains_only() {
        assert!(wildcard_matches(
            "tracker.net",
            "a.tracker.net",
            WildcardMode::SubdomainsOnly
        ));
        assert!(!wildcard_matches(
            "tracker.net",
            "tracker.net",
            WildcardMode::SubdomainsOnly
        ));
    }

    #[test]
    fn test_wildcard_include_root() {
        assert!(wildcard_matches(
            "account-gemini.com",
            "account-gemini.com",
            WildcardMode::IncludeRoot
        ));
        assert!(wildcard_matches(
            "account-gemini.com",
            "login.account-gemini.com",
            WildcardMode::IncludeRoot
        ));
    }

    #[test]
    fn test_wildcard_never_matches_sibling() {
        // *.foo.com must not match barfoo.com
        assert!(!wildcard_matches(
            "foo.com",
            "barfoo.com",
            WildcardMode::IncludeRoot
        ));
        assert!(!wildcard_matches(
            "foo.com",
            "barfoo.com",
            WildcardMode::SubdomainsOnly
        ));
    }

    #[test]
    fn test_parent_suffixes() {
        assert_eq!(
            parent_suffixes("a.b.c"),
            vec!["a.b.c".to_string(), "b.c".to_string(), "c".to_string()]
        );
        assert_eq!(parent_suffixes("c"), vec!["c".to_string()]);
    }

    #[test]
    fn test_normalize_strips_root_dot() {
        assert_eq!(normalize_domain("Example.COM."), "example.com");
    }
}
