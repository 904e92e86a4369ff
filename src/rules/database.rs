//! Persistent, indexed rule store backed by SQLite.
//!
//! One writer connection serializes all mutations; bulk operations run in
//! a single transaction so concurrent readers never observe a
//! half-applied source. Reads go through a small pool of read-only WAL
//! connections. Parent-domain evaluation walks the host's suffixes and
//! hits the `(domain)` index with an `IN` list instead of `LIKE` scans;
//! regex rules are kept compiled in memory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use rusqlite::{Connection, OpenFlags, params};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{DnshieldError, Result};

use super::{Rule, RuleAction, RuleKind, RuleSource, WildcardMode, normalize_domain, parent_suffixes};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS dns_rules (
    domain   TEXT    NOT NULL,
    type     INTEGER NOT NULL,
    action   INTEGER NOT NULL,
    source   INTEGER NOT NULL,
    priority INTEGER NOT NULL,
    comment  TEXT,
    UNIQUE (domain, type, source)
);
CREATE INDEX IF NOT EXISTS idx_dns_rules_domain ON dns_rules (domain);
CREATE INDEX IF NOT EXISTS idx_dns_rules_type_action ON dns_rules (type, action);
CREATE INDEX IF NOT EXISTS idx_dns_rules_source ON dns_rules (source);
";

const UPSERT: &str = "
INSERT INTO dns_rules (domain, type, action, source, priority, comment)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT (domain, type, source)
DO UPDATE SET action = excluded.action,
              priority = excluded.priority,
              comment = excluded.comment
";

const READER_POOL_SIZE: usize = 4;

/// Rule totals by action, reported through `getStatus`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCounts {
    pub allow: u64,
    pub block: u64,
}

impl RuleCounts {
    pub fn total(&self) -> u64 {
        self.allow + self.block
    }
}

struct ReaderPool {
    path: PathBuf,
    pool: Arc<ArrayQueue<Connection>>,
}

impl ReaderPool {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            pool: Arc::new(ArrayQueue::new(READER_POOL_SIZE)),
        }
    }

    fn get(&self) -> Result<PooledReader> {
        let conn = match self.pool.pop() {
            Some(conn) => conn,
            None => {
                let conn = Connection::open_with_flags(
                    &self.path,
                    OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
                )?;
                conn.busy_timeout(std::time::Duration::from_secs(5))?;
                conn
            }
        };
        Ok(PooledReader {
            conn: Some(conn),
            pool: Arc::clone(&self.pool),
        })
    }
}

struct PooledReader {
    conn: Option<Connection>,
    pool: Arc<ArrayQueue<Connection>>,
}

impl Drop for PooledReader {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Over-capacity connections are simply closed
            let _ = self.pool.push(conn);
        }
    }
}

impl std::ops::Deref for PooledReader {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

pub struct RuleDatabase {
    writer: Mutex<Connection>,
    readers: Option<ReaderPool>,
    regex_rules: RwLock<Vec<(Rule, Regex)>>,
}

impl RuleDatabase {
    /// Open (creating if needed) the rule database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;

        let db = Self {
            writer: Mutex::new(conn),
            readers: Some(ReaderPool::new(path.to_path_buf())),
            regex_rules: RwLock::new(Vec::new()),
        };
        db.reload_regex_rules()?;
        info!("Rule database ready at {:?}", path);
        Ok(db)
    }

    /// In-memory database for tests. Reads share the writer connection.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            writer: Mutex::new(conn),
            readers: None,
            regex_rules: RwLock::new(Vec::new()),
        })
    }

    /// Insert or update a single rule, keyed by `(domain, type, source)`.
    pub fn add(&self, rule: &Rule) -> Result<()> {
        {
            let conn = self.writer.lock();
            conn.execute(
                UPSERT,
                params![
                    rule.domain,
                    rule.kind.as_db(),
                    rule.action.as_db(),
                    rule.source.as_db(),
                    rule.priority,
                    rule.comment,
                ],
            )?;
        }
        if rule.kind == RuleKind::Regex {
            self.reload_regex_rules()?;
        }
        Ok(())
    }

    /// Upsert a batch of rules under one source in a single transaction.
    /// Every rule is re-tagged with `source` so a batch cannot leak into
    /// another source's namespace.
    pub fn add_bulk(&self, rules: &[Rule], source: RuleSource) -> Result<usize> {
        let count = {
            let mut conn = self.writer.lock();
            let tx = conn.transaction()?;
            let mut count = 0usize;
            {
                let mut stmt = tx.prepare_cached(UPSERT)?;
                for rule in rules {
                    stmt.execute(params![
                        rule.domain,
                        rule.kind.as_db(),
                        rule.action.as_db(),
                        source.as_db(),
                        rule.priority,
                        rule.comment,
                    ])?;
                    count += 1;
                }
            }
            tx.commit()?;
            count
        };

        self.reload_regex_rules()?;
        debug!("Upserted {} rules for source {:?}", count, source);
        Ok(count)
    }

    /// Atomically swap a source's rule set: delete everything the source
    /// owned, then insert the replacement, all in one transaction.
    pub fn replace_source(&self, source: RuleSource, rules: &[Rule]) -> Result<usize> {
        let count = {
            let mut conn = self.writer.lock();
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM dns_rules WHERE source = ?1",
                params![source.as_db()],
            )?;
            let mut count = 0usize;
            {
                let mut stmt = tx.prepare_cached(UPSERT)?;
                for rule in rules {
                    stmt.execute(params![
                        rule.domain,
                        rule.kind.as_db(),
                        rule.action.as_db(),
                        source.as_db(),
                        rule.priority,
                        rule.comment,
                    ])?;
                    count += 1;
                }
            }
            tx.commit()?;
            count
        };

        self.reload_regex_rules()?;
        info!("Replaced source {:?} with {} rules", source, count);
        Ok(count)
    }

    pub fn remove_all_from_source(&self, source: RuleSource) -> Result<usize> {
        let removed = {
            let conn = self.writer.lock();
            conn.execute(
                "DELETE FROM dns_rules WHERE source = ?1",
                params![source.as_db()],
            )?
        };
        self.reload_regex_rules()?;
        debug!("Removed {} rules from source {:?}", removed, source);
        Ok(removed)
    }

    /// All rules matching `host`.
    ///
    /// Exact and wildcard candidates come from one indexed query over the
    /// host's parent-suffix walk; regex rules are evaluated against the
    /// in-memory compiled list.
    pub fn lookup(&self, host: &str, mode: WildcardMode) -> Result<Vec<Rule>> {
        let host = normalize_domain(host);
        if host.is_empty() {
            return Ok(Vec::new());
        }

        let suffixes = parent_suffixes(&host);
        let placeholders = vec!["?"; suffixes.len()].join(", ");
        let sql = format!(
            "SELECT domain, type, action, source, priority, comment \
             FROM dns_rules WHERE type IN (0, 1) AND domain IN ({})",
            placeholders
        );

        let candidates = match &self.readers {
            Some(readers) => {
                let conn = readers.get()?;
                Self::query_rules(&conn, &sql, &suffixes)?
            }
            None => {
                let conn = self.writer.lock();
                Self::query_rules(&conn, &sql, &suffixes)?
            }
        };

        let mut matching: Vec<Rule> = candidates
            .into_iter()
            .filter(|rule| rule.matches(&host, mode))
            .collect();

        for (rule, regex) in self.regex_rules.read().iter() {
            if regex.is_match(&host) {
                matching.push(rule.clone());
            }
        }

        Ok(matching)
    }

    pub fn counts(&self) -> Result<RuleCounts> {
        let run = |conn: &Connection| -> Result<RuleCounts> {
            let mut stmt =
                conn.prepare_cached("SELECT action, COUNT(*) FROM dns_rules GROUP BY action")?;
            let mut counts = RuleCounts::default();
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let action: i64 = row.get(0)?;
                let count: u64 = row.get(1)?;
                match RuleAction::from_db(action) {
                    Some(RuleAction::Allow) => counts.allow = count,
                    Some(RuleAction::Block) => counts.block = count,
                    None => warn!("Ignoring rules with unknown action {}", action),
                }
            }
            Ok(counts)
        };

        match &self.readers {
            Some(readers) => {
                let reader = readers.get()?;
                run(&reader)
            }
            None => run(&self.writer.lock()),
        }
    }

    fn query_rules(conn: &Connection, sql: &str, suffixes: &[String]) -> Result<Vec<Rule>> {
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(suffixes.iter()), row_to_rule)?;
        let mut rules = Vec::new();
        for row in rows {
            match row? {
                Some(rule) => rules.push(rule),
                None => warn!("Skipping rule row with unknown enum encoding"),
            }
        }
        Ok(rules)
    }

    /// Recompile the regex rule list from the table. Invalid patterns are
    /// skipped with a warning; they cannot match anything.
    fn reload_regex_rules(&self) -> Result<()> {
        let rules = {
            let conn = self.writer.lock();
            let mut stmt = conn.prepare_cached(
                "SELECT domain, type, action, source, priority, comment \
                 FROM dns_rules WHERE type = 2",
            )?;
            let rows = stmt.query_map([], row_to_rule)?;
            let mut rules = Vec::new();
            for row in rows {
                if let Some(rule) = row? {
                    rules.push(rule);
                }
            }
            rules
        };

        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            match Regex::new(&rule.domain) {
                Ok(regex) => compiled.push((rule, regex)),
                Err(e) => warn!("Ignoring invalid regex rule '{}': {}", rule.domain, e),
            }
        }

        *self.regex_rules.write() = compiled;
        Ok(())
    }
}

fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<Rule>> {
    let kind: i64 = row.get(1)?;
    let action: i64 = row.get(2)?;
    let source: i64 = row.get(3)?;

    let (Some(kind), Some(action), Some(source)) = (
        RuleKind::from_db(kind),
        RuleAction::from_db(action),
        RuleSource::from_db(source),
    ) else {
        return Ok(None);
    };

    Ok(Some(Rule {
        domain: row.get(0)?,
        kind,
        action,
        source,
        priority: row.get::<_, i64>(4)? as u32,
        comment: row.get(5)?,
    }))
}

impl std::fmt::Debug for RuleDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleDatabase")
            .field("regex_rules", &self.regex_rules.read().len())
            .finish_non_exhaustive()
    }
}
