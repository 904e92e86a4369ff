//! Manifest model, format sniffing, sanitization and validation.
//!
//! Manifests arrive as JSON, YAML or property lists and are decoded into
//! one JSON value algebra before being validated into typed structs.
//! Sanitization strips `null`s recursively so the persisted form stays a
//! valid document in every supported format.

pub mod condition;
pub mod disk_cache;
pub mod fetch;
pub mod resolver;

pub use condition::{ConditionError, EvaluationContext, Predicate};
pub use disk_cache::{CachedManifest, ManifestDiskCache};
pub use fetch::{HttpManifestFetcher, ManifestFetch, RetryPolicy, fetch_with_retry};
pub use resolver::{ManifestResolver, ResolvedManifest};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DnshieldError, Result};
use crate::rules::parser::RuleSetFormat;

pub const MANIFEST_VERSION: &str = "1.0";

fn default_feed_priority() -> u32 {
    100
}

fn default_update_interval() -> u64 {
    300
}

fn default_enabled() -> bool {
    true
}

/// Transport for a rule feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    Https,
    File,
}

/// Document format of a rule feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    #[default]
    Json,
    Yaml,
    Plist,
    Hosts,
}

impl From<FeedFormat> for RuleSetFormat {
    fn from(format: FeedFormat) -> Self {
        match format {
            FeedFormat::Json => RuleSetFormat::Json,
            FeedFormat::Yaml => RuleSetFormat::Yaml,
            FeedFormat::Plist => RuleSetFormat::Plist,
            FeedFormat::Hosts => RuleSetFormat::Hosts,
        }
    }
}

/// An external source of rules declared by a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleFeed {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: FeedKind,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub format: FeedFormat,
    #[serde(default = "default_feed_priority")]
    pub priority: u32,
    #[serde(default = "default_update_interval", rename = "updateInterval")]
    pub update_interval: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub configuration: serde_json::Map<String, Value>,
}

/// Inline allow/block lists. Unknown keys are a validation error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagedRules {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub block: Vec<String>,
}

impl ManagedRules {
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.block.is_empty()
    }
}

/// Content applied only when its predicate evaluates true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalItem {
    pub condition: String,
    #[serde(default)]
    pub managed_rules: Option<ManagedRules>,
    #[serde(default)]
    pub rule_sources: Option<Vec<RuleFeed>>,
    #[serde(default)]
    pub included_manifests: Option<Vec<String>>,
    #[serde(default)]
    pub priority: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub manifest_version: String,
    pub identifier: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub included_manifests: Vec<String>,
    #[serde(default)]
    pub rule_sources: Vec<RuleFeed>,
    #[serde(default)]
    pub managed_rules: ManagedRules,
    #[serde(default)]
    pub conditional_items: Vec<ConditionalItem>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

/// Sniffed document format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Plist,
    Yaml,
}

/// Detect a manifest's format from its content: `{`/`[` mean JSON, an XML
/// prologue or the binary-plist magic mean plist, anything else is YAML.
pub fn detect_format(bytes: &[u8]) -> DocumentFormat {
    if bytes.starts_with(b"bplist") {
        return DocumentFormat::Plist;
    }
    let trimmed = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|i| &bytes[i..])
        .unwrap_or(&[]);
    match trimmed.first() {
        Some(b'{') | Some(b'[') => DocumentFormat::Json,
        _ if trimmed.starts_with(b"<?xml") => DocumentFormat::Plist,
        _ => DocumentFormat::Yaml,
    }
}

/// Decode a manifest document of any supported format into the JSON value
/// algebra.
pub fn parse_document(bytes: &[u8]) -> Result<Value> {
    match detect_format(bytes) {
        DocumentFormat::Json => serde_json::from_slice(bytes)
            .map_err(|e| DnshieldError::ManifestParse(format!("invalid JSON: {}", e))),
        DocumentFormat::Yaml => serde_yaml::from_slice(bytes)
            .map_err(|e| DnshieldError::ManifestParse(format!("invalid YAML: {}", e))),
        DocumentFormat::Plist => plist::from_bytes(bytes)
            .map_err(|e| DnshieldError::ManifestParse(format!("invalid plist: {}", e))),
    }
}

/// Recursively strip `null` values from objects and arrays.
///
/// Applied before any manifest is persisted; running it twice is a no-op.
pub fn sanitize(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, sanitize(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|v| !v.is_null())
                .map(sanitize)
                .collect(),
        ),
        other => other,
    }
}

/// Validate structural requirements the serde model cannot express.
pub fn validate(manifest: &Manifest) -> Result<()> {
    if manifest.manifest_version != MANIFEST_VERSION {
        return Err(DnshieldError::ManifestInvalid(format!(
            "unsupported manifest_version '{}'",
            manifest.manifest_version
        )));
    }
    if manifest.identifier.trim().is_empty() {
        return Err(DnshieldError::ManifestInvalid("empty identifier".into()));
    }

    let feeds = manifest.rule_sources.iter().chain(
        manifest
            .conditional_items
            .iter()
            .filter_map(|item| item.rule_sources.as_ref())
            .flatten(),
    );
    for feed in feeds {
        match feed.kind {
            FeedKind::Https if feed.url.is_none() => {
                return Err(DnshieldError::ManifestInvalid(format!(
                    "https source '{}' missing url",
                    feed.id
                )));
            }
            FeedKind::File if feed.path.is_none() => {
                return Err(DnshieldError::ManifestInvalid(format!(
                    "file source '{}' missing path",
                    feed.id
                )));
            }
            _ => {}
        }
    }

    Ok(())
}

/// Decode, sanitize and validate a manifest document. Returns the typed
/// manifest together with the sanitized value that gets persisted.
pub fn parse_manifest(bytes: &[u8]) -> Result<(Manifest, Value)> {
    let value = sanitize(parse_document(bytes)?);
    let manifest: Manifest = serde_json::from_value(value.clone())
        .map_err(|e| DnshieldError::ManifestParse(e.to_string()))?;
    validate(&manifest)?;
    Ok((manifest, value))
}
