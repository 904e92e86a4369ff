pub mod dns_cache;
pub mod rule_cache;

pub use dns_cache::{CachePolicyAction, DnsResponseCache, DomainCachePolicy};
pub use rule_cache::{CacheEvent, CacheEventKind, RuleCache, RuleCacheConfig};
