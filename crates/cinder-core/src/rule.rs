//! SQL rule classifier seam.
//!
//! Decides which layer a SQL-shaped query routes to: the cache layer,
//! the hot shard database, or the full database. The proxy consults
//! the classifier before forwarding; a classifier failure degrades to
//! the safest answer (full database) at the call site rather than
//! blocking the request.

use thiserror::Error;

/// Routing layer for a classified statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Served by the table-cache helpers.
    CacheLayer,
    /// Served by the sharded hot database.
    HotShard,
    /// Served by the full database.
    FullDatabase,
}

/// Classification failure. Callers degrade to [`RouteClass::FullDatabase`].
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RuleError {
    /// The statement could not be parsed far enough to find a table.
    #[error("statement failed to parse")]
    Parse,
    /// No candidate key to match rules against.
    #[error("no candidate key for rule match")]
    EmptyKey,
}

/// Classifies a statement given its text and candidate key.
pub trait RuleClassifier: Send + Sync {
    fn classify(&self, sql: &str, key: &[u8]) -> Result<RouteClass, RuleError>;
}

/// Table-list driven classifier.
///
/// INSERT statements always go to the cache layer (the cache is the
/// write path for cached tables). Otherwise the target table decides:
/// tables in the cacheable list hit the cache layer, tables in the hot
/// list hit the hot shard, and everything else falls through to the
/// full database.
#[derive(Debug, Default)]
pub struct StaticRules {
    cacheable_tables: Vec<String>,
    hot_tables: Vec<String>,
}

impl StaticRules {
    pub fn new(cacheable_tables: Vec<String>, hot_tables: Vec<String>) -> Self {
        Self {
            cacheable_tables: cacheable_tables
                .into_iter()
                .map(|t| t.to_ascii_lowercase())
                .collect(),
            hot_tables: hot_tables
                .into_iter()
                .map(|t| t.to_ascii_lowercase())
                .collect(),
        }
    }
}

impl RuleClassifier for StaticRules {
    fn classify(&self, sql: &str, key: &[u8]) -> Result<RouteClass, RuleError> {
        if key.is_empty() {
            return Err(RuleError::EmptyKey);
        }

        let lower = sql.to_ascii_lowercase();
        if lower.contains("insert into") {
            return Ok(RouteClass::CacheLayer);
        }

        let table = target_table(&lower).ok_or(RuleError::Parse)?;
        if self.cacheable_tables.iter().any(|t| t == table) {
            Ok(RouteClass::CacheLayer)
        } else if self.hot_tables.iter().any(|t| t == table) {
            Ok(RouteClass::HotShard)
        } else {
            Ok(RouteClass::FullDatabase)
        }
    }
}

/// Pulls the target table name out of a lowercased statement: the token
/// after `from` for selects/deletes, after `update` for updates.
fn target_table(lower: &str) -> Option<&str> {
    let mut tokens = lower.split_whitespace().peekable();
    while let Some(tok) = tokens.next() {
        if tok == "from" || tok == "update" {
            let table = tokens.next()?;
            return Some(table.trim_end_matches([';', ',']));
        }
    }
    None
}
