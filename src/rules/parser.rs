//! Rule-set document parsers.
//!
//! Sources deliver rules as JSON/YAML/plist documents or classic hosts
//! files. All formats funnel into [`RuleSet`]; malformed entries are
//! logged and skipped rather than failing the whole document.

use std::net::IpAddr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{DnshieldError, Result};

use super::{Rule, RuleAction, RuleKind, RuleSet, RuleSetMetadata, RuleSource, normalize_domain};

/// Wire format of a rule-source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSetFormat {
    Json,
    Yaml,
    Plist,
    Hosts,
}

/// Parse a rule-source document into a `RuleSet`.
///
/// `default_priority` applies to entries that do not carry their own
/// priority (typically the enclosing feed's priority).
pub fn parse_rule_set(
    bytes: &[u8],
    format: RuleSetFormat,
    source: RuleSource,
    default_priority: u32,
) -> Result<RuleSet> {
    match format {
        RuleSetFormat::Hosts => parse_hosts(bytes, source, default_priority),
        RuleSetFormat::Json => {
            let value: Value = serde_json::from_slice(bytes)
                .map_err(|e| DnshieldError::RuleParse(format!("invalid JSON: {}", e)))?;
            from_document(value, source, default_priority)
        }
        RuleSetFormat::Yaml => {
            let value: Value = serde_yaml::from_slice(bytes)
                .map_err(|e| DnshieldError::RuleParse(format!("invalid YAML: {}", e)))?;
            from_document(value, source, default_priority)
        }
        RuleSetFormat::Plist => {
            let value: Value = plist::from_bytes(bytes)
                .map_err(|e| DnshieldError::RuleParse(format!("invalid plist: {}", e)))?;
            from_document(value, source, default_priority)
        }
    }
}

/// Interpret a decoded document: either a top-level array of entries or an
/// object with `rules` plus metadata fields.
fn from_document(value: Value, source: RuleSource, default_priority: u32) -> Result<RuleSet> {
    let (entries, metadata) = match value {
        Value::Array(entries) => (entries, RuleSetMetadata::default()),
        Value::Object(mut map) => {
            let entries = match map.remove("rules") {
                Some(Value::Array(entries)) => entries,
                Some(_) => {
                    return Err(DnshieldError::RuleParse("'rules' must be an array".into()));
                }
                None => Vec::new(),
            };
            let metadata = RuleSetMetadata {
                name: map.get("name").and_then(Value::as_str).map(String::from),
                version: map.get("version").and_then(Value::as_str).map(String::from),
                author: map.get("author").and_then(Value::as_str).map(String::from),
                custom_fields: map
                    .into_iter()
                    .filter(|(k, _)| !matches!(k.as_str(), "name" | "version" | "author"))
                    .collect(),
            };
            (entries, metadata)
        }
        _ => {
            return Err(DnshieldError::RuleParse(
                "rule document must be an object or array".into(),
            ));
        }
    };

    let mut rules = Vec::with_capacity(entries.len());
    for entry in entries {
        match parse_entry(&entry, source, default_priority) {
            Ok(rule) => rules.push(rule),
            Err(e) => warn!("Skipping rule entry: {}", e),
        }
    }

    debug!("Parsed {} rules from document", rules.len());
    Ok(RuleSet { rules, metadata })
}

fn parse_entry(entry: &Value, source: RuleSource, default_priority: u32) -> Result<Rule> {
    match entry {
        // Shorthand: a bare string blocks the domain (wildcard inferred)
        Value::String(spec) => {
            let rule = Rule::from_domain_spec(spec, RuleAction::Block, source, default_priority);
            validate_rule_domain(&rule)?;
            Ok(rule)
        }
        Value::Object(map) => {
            let domain = map
                .get("domain")
                .and_then(Value::as_str)
                .ok_or_else(|| DnshieldError::RuleParse("entry missing 'domain'".into()))?;
            let action = match map.get("action").and_then(Value::as_str) {
                Some("allow") => RuleAction::Allow,
                Some("block") | None => RuleAction::Block,
                Some(other) => {
                    return Err(DnshieldError::RuleParse(format!(
                        "unknown action '{}'",
                        other
                    )));
                }
            };
            let priority = map
                .get("priority")
                .and_then(Value::as_u64)
                .map(|p| p as u32)
                .unwrap_or(default_priority);
            let comment = map.get("comment").and_then(Value::as_str).map(String::from);

            let mut rule = match map.get("type").and_then(Value::as_str) {
                Some("regex") => Rule {
                    domain: domain.to_string(),
                    kind: RuleKind::Regex,
                    action,
                    source,
                    priority,
                    comment: None,
                },
                Some("wildcard") => Rule {
                    domain: normalize_domain(domain.trim_start_matches("*.")),
                    kind: RuleKind::Wildcard,
                    action,
                    source,
                    priority,
                    comment: None,
                },
                Some("exact") => Rule {
                    domain: normalize_domain(domain),
                    kind: RuleKind::Exact,
                    action,
                    source,
                    priority,
                    comment: None,
                },
                Some(other) => {
                    return Err(DnshieldError::RuleParse(format!("unknown type '{}'", other)));
                }
                None => Rule::from_domain_spec(domain, action, source, priority),
            };
            rule.comment = comment;

            if rule.kind == RuleKind::Regex {
                regex::Regex::new(&rule.domain)
                    .map_err(|e| DnshieldError::RuleParse(format!("invalid regex: {}", e)))?;
            } else {
                validate_rule_domain(&rule)?;
            }
            Ok(rule)
        }
        other => Err(DnshieldError::RuleParse(format!(
            "unsupported entry: {}",
            other
        ))),
    }
}

/// Parse a hosts-format file: `IP domain [aliases...]` per line, comments
/// and localhost entries skipped. Every entry becomes an exact block rule.
fn parse_hosts(bytes: &[u8], source: RuleSource, default_priority: u32) -> Result<RuleSet> {
    let text = String::from_utf8_lossy(bytes);
    let mut rules = Vec::new();

    for line in text.lines() {
        if let Some(domain) = parse_hosts_line(line) {
            rules.push(Rule {
                domain,
                kind: RuleKind::Exact,
                action: RuleAction::Block,
                source,
                priority: default_priority,
                comment: None,
            });
        }
    }

    Ok(RuleSet {
        rules,
        metadata: RuleSetMetadata::default(),
    })
}

fn parse_hosts_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut parts = line.split_whitespace();
    let ip = parts.next()?;
    if ip.parse::<IpAddr>().is_err() {
        return None;
    }

    let domain = normalize_domain(parts.next()?);
    if domain == "localhost" || !is_valid_domain(&domain) {
        return None;
    }
    Some(domain)
}

fn validate_rule_domain(rule: &Rule) -> Result<()> {
    if is_valid_domain(&rule.domain) {
        Ok(())
    } else {
        Err(DnshieldError::RuleParse(format!(
            "invalid domain '{}'",
            rule.domain
        )))
    }
}

/// Structural domain validation: label lengths, total length, and the
/// allowed hyphen placement.
pub fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }

    for part in domain.split('.') {
        if part.is_empty() || part.len() > 63 {
            return false;
        }
        let bytes = part.as_bytes();
        for (i, &b) in bytes.iter().enumerate() {
            let alnum = b.is_ascii_alphanumeric();
            if i == 0 || i == bytes.len() - 1 {
                if !alnum {
                    return false;
                }
            } else if !alnum && b != b'-' && b != b'_' {
                return false;
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_document() {
        let doc = br#"{
            "name": "corp-blocklist",
            "version": "3",
            "rules": [
                {"domain": "ads.example.com", "action": "block"},
                {"domain": "*.tracker.net", "action": "block", "priority": 200},
                {"domain": "safe.example.com", "action": "allow"},
                {"domain": "^metrics[0-9]+\\.example\\.com$", "action": "block", "type": "regex"},
                "shorthand.example.com"
            ]
        }"#;
        let set = parse_rule_set(doc, RuleSetFormat::Json, RuleSource::Manifest, 100).unwrap();
        assert_eq!(set.metadata.name.as_deref(), Some("corp-blocklist"));
        assert_eq!(set.rules.len(), 5);

        assert_eq!(set.rules[0].kind, RuleKind::Exact);
        assert_eq!(set.rules[0].priority, 100);
        assert_eq!(set.rules[1].kind, RuleKind::Wildcard);
        assert_eq!(set.rules[1].domain, "tracker.net");
        assert_eq!(set.rules[1].priority, 200);
        assert_eq!(set.rules[2].action, RuleAction::Allow);
        assert_eq!(set.rules[3].kind, RuleKind::Regex);
        assert_eq!(set.rules[4].action, RuleAction::Block);
    }

    #[test]
    fn test_yaml_document() {
        let doc = b"rules:\n  - domain: ads.example.com\n  - domain: '*.cdn.example.com'\n    action: block\n";
        let set = parse_rule_set(doc, RuleSetFormat::Yaml, RuleSource::Manifest, 50).unwrap();
        assert_eq!(set.rules.len(), 2);
        assert_eq!(set.rules[1].kind, RuleKind::Wildcard);
    }

    #[test]
    fn test_hosts_file() {
        let doc = b"# comment\n0.0.0.0 ads.example.com\n127.0.0.1 localhost\n::1 v6.tracker.net\nnot-an-ip example.com\n";
        let set = parse_rule_set(doc, RuleSetFormat::Hosts, RuleSource::Manifest, 100).unwrap();
        let domains: Vec<_> = set.rules.iter().map(|r| r.domain.as_str()).collect();
        assert_eq!(domains, vec!["ads.example.com", "v6.tracker.net"]);
        assert!(set.rules.iter().all(|r| r.action == RuleAction::Block));
    }

    #[test]
    fn test_invalid_entries_are_skipped() {
        let doc = br#"{"rules": [{"domain": "-bad-.com"}, {"domain": "good.com"}, {"action": "block"}]}"#;
        let set = parse_rule_set(doc, RuleSetFormat::Json, RuleSource::Manifest, 100).unwrap();
        assert_eq!(set.rules.len(), 1);
        assert_eq!(set.rules[0].domain, "good.com");
    }

    #[test]
    fn test_invalid_regex_rejected() {
        let doc = br#"{"rules": [{"domain": "([", "type": "regex"}]}"#;
        let set = parse_rule_set(doc, RuleSetFormat::Json, RuleSource::Manifest, 100).unwrap();
        assert!(set.rules.is_empty());
    }

    #[test]
    fn test_top_level_array() {
        let doc = br#"["a.example.com", "*.b.example.com"]"#;
        let set = parse_rule_set(doc, RuleSetFormat::Json, RuleSource::User, 10).unwrap();
        assert_eq!(set.rules.len(), 2);
        assert_eq!(set.rules[1].kind, RuleKind::Wildcard);
    }

    #[test]
    fn test_not_a_document() {
        assert!(parse_rule_set(b"42", RuleSetFormat::Json, RuleSource::User, 1).is_err());
    }
}
