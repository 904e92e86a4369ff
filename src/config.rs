use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use ipnet::IpNet;

use crate::cache::{CachePolicyAction, DomainCachePolicy};
use crate::error::{DnshieldError, Result};
use crate::rules::WildcardMode;

/// Preferred manifest document format; drives the extension search order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManifestFormat {
    #[default]
    Json,
    Plist,
    Yml,
    Yaml,
}

impl ManifestFormat {
    pub fn parse_str(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "json" => Some(ManifestFormat::Json),
            "plist" => Some(ManifestFormat::Plist),
            "yml" => Some(ManifestFormat::Yml),
            "yaml" => Some(ManifestFormat::Yaml),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ManifestFormat::Json => ".json",
            ManifestFormat::Plist => ".plist",
            ManifestFormat::Yml => ".yml",
            ManifestFormat::Yaml => ".yaml",
        }
    }

    /// All candidate extensions, the preferred one first.
    pub fn extension_candidates(self) -> Vec<&'static str> {
        let mut exts = vec![self.extension()];
        for ext in [".json", ".plist", ".yml", ".yaml"] {
            if ext != self.extension() {
                exts.push(ext);
            }
        }
        exts
    }
}

/// The preference table the core consumes, with documented defaults.
#[derive(Debug, Clone)]
pub struct Preferences {
    /// Base URL manifests are fetched from; unset means local-only.
    pub manifest_url: Option<String>,
    /// Legacy alias for `manifest_url`, honored when the primary is unset.
    pub software_repo_url: Option<String>,
    pub manifest_format: ManifestFormat,
    pub manifest_update_interval: Duration,
    pub client_identifier: Option<String>,
    /// Legacy identifier preference, second in the fallback chain seed.
    pub manifest_identifier: Option<String>,
    /// Extra request headers as `"Header: Value"` strings.
    pub additional_http_headers: Vec<String>,
    /// Directories searched for manifests when no URL is configured.
    pub local_manifest_dirs: Vec<PathBuf>,
    /// Device serial consumed from the host integration.
    pub device_serial: Option<String>,

    pub bind_addr: SocketAddr,
    pub upstream_servers: Vec<SocketAddr>,
    pub vpn_resolvers: Vec<IpNet>,
    pub enable_chain_preservation: bool,
    pub upstream_timeout: Duration,
    pub max_concurrent_queries: usize,

    pub max_retries: u32,
    pub initial_backoff: Duration,

    pub domain_cache_rules: Vec<DomainCachePolicy>,
    pub cache_bypass_domains: Vec<String>,
    pub max_dns_cache_entries: usize,
    pub rule_cache_memory_bytes: usize,
    pub rule_cache_disk_bytes: u64,
    pub wildcard_mode: WildcardMode,

    pub rules_db_path: PathBuf,
    pub app_support_dir: PathBuf,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            manifest_url: None,
            software_repo_url: None,
            manifest_format: ManifestFormat::default(),
            manifest_update_interval: Duration::from_secs(300),
            client_identifier: None,
            manifest_identifier: None,
            additional_http_headers: Vec::new(),
            local_manifest_dirs: vec![
                PathBuf::from("/Library/Application Support/DNShield/manifests"),
                PathBuf::from("/etc/dnshield/manifests"),
            ],
            device_serial: None,
            bind_addr: "127.0.0.1:5353".parse().expect("default bind address is valid"),
            upstream_servers: vec![
                "1.1.1.1:53".parse().expect("Cloudflare DNS is valid"),
                "8.8.8.8:53".parse().expect("Google DNS is valid"),
            ],
            vpn_resolvers: vec![
                "100.64.0.0/10".parse().expect("CGNAT range is valid"),
                "fc00::/7".parse().expect("ULA range is valid"),
            ],
            enable_chain_preservation: true,
            upstream_timeout: Duration::from_secs(5),
            max_concurrent_queries: 10_000,
            max_retries: 3,
            initial_backoff: Duration::from_millis(250),
            domain_cache_rules: Vec::new(),
            cache_bypass_domains: Vec::new(),
            max_dns_cache_entries: 10_000,
            rule_cache_memory_bytes: 16 * 1024 * 1024,
            rule_cache_disk_bytes: 128 * 1024 * 1024,
            wildcard_mode: WildcardMode::IncludeRoot,
            rules_db_path: PathBuf::from("/var/db/dnshield/rules.db"),
            app_support_dir: PathBuf::from("/Library/Application Support/DNShield"),
        }
    }
}

impl Preferences {
    /// Build preferences from `DNSHIELD_*` environment variables layered
    /// over the defaults.
    pub fn from_env() -> Result<Self> {
        let mut prefs = Self::default();

        if let Ok(url) = std::env::var("DNSHIELD_MANIFEST_URL") {
            prefs.manifest_url = Some(url.trim_end_matches('/').to_string());
        }
        if let Ok(url) = std::env::var("DNSHIELD_SOFTWARE_REPO_URL") {
            prefs.software_repo_url = Some(url.trim_end_matches('/').to_string());
        }
        if let Ok(format) = std::env::var("DNSHIELD_MANIFEST_FORMAT") {
            prefs.manifest_format = ManifestFormat::parse_str(&format).ok_or_else(|| {
                DnshieldError::ConfigurationInvalid(format!("unknown manifest format: {}", format))
            })?;
        }
        if let Ok(interval) = std::env::var("DNSHIELD_MANIFEST_UPDATE_INTERVAL") {
            let secs: u64 = interval.parse().map_err(|_| {
                DnshieldError::ConfigurationInvalid(format!("invalid update interval: {}", interval))
            })?;
            if secs == 0 {
                return Err(DnshieldError::ConfigurationInvalid(
                    "update interval must be greater than 0".into(),
                ));
            }
            prefs.manifest_update_interval = Duration::from_secs(secs);
        }
        if let Ok(id) = std::env::var("DNSHIELD_CLIENT_IDENTIFIER") {
            prefs.client_identifier = Some(id);
        }
        if let Ok(id) = std::env::var("DNSHIELD_MANIFEST_IDENTIFIER") {
            prefs.manifest_identifier = Some(id);
        }
        if let Ok(headers) = std::env::var("DNSHIELD_ADDITIONAL_HTTP_HEADERS") {
            prefs.additional_http_headers =
                headers.split(',').map(|h| h.trim().to_string()).collect();
        }
        if let Ok(serial) = std::env::var("DNSHIELD_DEVICE_SERIAL") {
            prefs.device_serial = Some(serial);
        }

        if let Ok(addr) = std::env::var("DNSHIELD_BIND_ADDR") {
            prefs.bind_addr = addr.parse().map_err(|_| {
                DnshieldError::ConfigurationInvalid(format!("invalid bind address: {}", addr))
            })?;
        }
        if let Ok(servers) = std::env::var("DNSHIELD_UPSTREAM_SERVERS") {
            let parsed: std::result::Result<Vec<SocketAddr>, _> = servers
                .split(',')
                .map(|s| s.trim().parse::<SocketAddr>())
                .collect();
            prefs.upstream_servers = parsed.map_err(|_| {
                DnshieldError::ConfigurationInvalid(format!("invalid upstream servers: {}", servers))
            })?;
            if prefs.upstream_servers.is_empty() {
                return Err(DnshieldError::ConfigurationInvalid(
                    "no upstream servers provided".into(),
                ));
            }
        }
        if let Ok(resolvers) = std::env::var("DNSHIELD_VPN_RESOLVERS") {
            let parsed: std::result::Result<Vec<IpNet>, _> = resolvers
                .split(',')
                .map(|s| s.trim().parse::<IpNet>())
                .collect();
            prefs.vpn_resolvers = parsed.map_err(|_| {
                DnshieldError::ConfigurationInvalid(format!("invalid VPN resolvers: {}", resolvers))
            })?;
        }
        if let Ok(enabled) = std::env::var("DNSHIELD_ENABLE_DNS_CHAIN_PRESERVATION") {
            prefs.enable_chain_preservation = parse_bool(&enabled, true);
        }
        if let Ok(timeout) = std::env::var("DNSHIELD_UPSTREAM_TIMEOUT") {
            let secs: u64 = timeout.parse().map_err(|_| {
                DnshieldError::ConfigurationInvalid(format!("invalid timeout: {}", timeout))
            })?;
            prefs.upstream_timeout = Duration::from_secs(secs);
        }

        if let Ok(retries) = std::env::var("DNSHIELD_MAX_RETRIES") {
            prefs.max_retries = retries.parse().map_err(|_| {
                DnshieldError::ConfigurationInvalid(format!("invalid max retries: {}", retries))
            })?;
        }
        if let Ok(backoff) = std::env::var("DNSHIELD_INITIAL_BACKOFF_MS") {
            let ms: u64 = backoff.parse().map_err(|_| {
                DnshieldError::ConfigurationInvalid(format!("invalid backoff: {}", backoff))
            })?;
            prefs.initial_backoff = Duration::from_millis(ms);
        }

        if let Ok(rules) = std::env::var("DNSHIELD_DOMAIN_CACHE_RULES") {
            prefs.domain_cache_rules = parse_domain_cache_rules(&rules)?;
        }
        if let Ok(domains) = std::env::var("DNSHIELD_CACHE_BYPASS_DOMAINS") {
            prefs.cache_bypass_domains =
                domains.split(',').map(|d| d.trim().to_string()).collect();
        }
        if let Ok(mode) = std::env::var("DNSHIELD_WILDCARD_MODE") {
            prefs.wildcard_mode = match mode.to_lowercase().as_str() {
                "subdomains_only" => WildcardMode::SubdomainsOnly,
                "include_root" => WildcardMode::IncludeRoot,
                other => {
                    return Err(DnshieldError::ConfigurationInvalid(format!(
                        "unknown wildcard mode: {}",
                        other
                    )));
                }
            };
        }

        if let Ok(path) = std::env::var("DNSHIELD_RULES_DB_PATH") {
            prefs.rules_db_path = PathBuf::from(path);
        }
        if let Ok(dir) = std::env::var("DNSHIELD_APP_SUPPORT_DIR") {
            prefs.app_support_dir = PathBuf::from(dir);
        }

        Ok(prefs)
    }

    /// Effective manifest base URL: the primary preference, falling back
    /// to the legacy repo URL.
    pub fn manifest_base_url(&self) -> Option<&str> {
        self.manifest_url
            .as_deref()
            .or(self.software_repo_url.as_deref())
    }

    pub fn manifest_cache_dir(&self) -> PathBuf {
        self.app_support_dir.join("manifest_cache")
    }

    pub fn rule_cache_dir(&self) -> PathBuf {
        self.app_support_dir.join("rule_cache")
    }

    pub fn commands_incoming_dir(&self) -> PathBuf {
        self.app_support_dir.join("Commands").join("incoming")
    }

    pub fn commands_responses_dir(&self) -> PathBuf {
        self.app_support_dir.join("Commands").join("responses")
    }
}

/// `pattern=never|always|<seconds>` entries, comma separated.
fn parse_domain_cache_rules(value: &str) -> Result<Vec<DomainCachePolicy>> {
    let mut policies = Vec::new();
    for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (pattern, action) = item.split_once('=').ok_or_else(|| {
            DnshieldError::ConfigurationInvalid(format!("invalid cache rule: {}", item))
        })?;
        let action = match action.trim() {
            "never" => CachePolicyAction::Never,
            "always" => CachePolicyAction::Always,
            ttl => CachePolicyAction::Custom(ttl.parse().map_err(|_| {
                DnshieldError::ConfigurationInvalid(format!("invalid cache TTL: {}", ttl))
            })?),
        };
        policies.push(DomainCachePolicy {
            pattern: pattern.trim().to_string(),
            action,
        });
    }
    Ok(policies)
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_table() {
        let prefs = Preferences::default();
        assert_eq!(prefs.manifest_format, ManifestFormat::Json);
        assert_eq!(prefs.manifest_update_interval, Duration::from_secs(300));
        assert_eq!(prefs.max_retries, 3);
        assert_eq!(prefs.initial_backoff, Duration::from_millis(250));
        assert!(prefs.enable_chain_preservation);
        assert_eq!(prefs.vpn_resolvers.len(), 2);
        assert_eq!(prefs.rules_db_path, PathBuf::from("/var/db/dnshield/rules.db"));
    }

    #[test]
    fn test_extension_candidates_prefer_configured_format() {
        assert_eq!(
            ManifestFormat::Yml.extension_candidates(),
            vec![".yml", ".json", ".plist", ".yaml"]
        );
        assert_eq!(ManifestFormat::Json.extension_candidates()[0], ".json");
    }

    #[test]
    fn test_parse_domain_cache_rules() {
        let policies =
            parse_domain_cache_rules("*.okta.com=never, pin.com=always, slow.com=120").unwrap();
        assert_eq!(policies.len(), 3);
        assert_eq!(policies[0].action, CachePolicyAction::Never);
        assert_eq!(policies[1].action, CachePolicyAction::Always);
        assert_eq!(policies[2].action, CachePolicyAction::Custom(120));
        assert!(parse_domain_cache_rules("broken").is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true", false));
        assert!(parse_bool("YES", false));
        assert!(!parse_bool("off", true));
        assert!(parse_bool("garbage", true));
    }

    #[test]
    fn test_manifest_base_url_fallback() {
        let mut prefs = Preferences::default();
        assert!(prefs.manifest_base_url().is_none());
        prefs.software_repo_url = Some("https://legacy.example.com/manifests".into());
        assert_eq!(
            prefs.manifest_base_url(),
            Some("https://legacy.example.com/manifests")
        );
        prefs.manifest_url = Some("https://repo.example.com/manifests".into());
        assert_eq!(
            prefs.manifest_base_url(),
            Some("https://repo.example.com/manifests")
        );
    }
}
