use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite};

pub const DEFAULT_LIMIT: usize = 100;
pub const DEFAULT_OFFSET: usize = 0;

/// How a multi-tag search combines its tags.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagMode {
    /// Every requested tag must be present.
    #[default]
    All,
    /// At least one requested tag must be present.
    Any,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Incoming,
    Outgoing,
    #[default]
    Both,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HubMetric {
    #[default]
    InDegree,
    OutDegree,
}

/// How [`crate::store::DocumentStore::resolve_nodes`] interprets each name.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolveStrategy {
    /// Title (case-insensitive), then id, then canonical path.
    #[default]
    Exact,
    /// [`ResolveStrategy::Exact`], then the same base-name lookups link resolution uses.
    Lenient,
}

/// Conjunctive filter for [`crate::store::DocumentStore::list_nodes`]. Unset fields match
/// everything.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFilter {
    /// Case-insensitive (ASCII) title prefix.
    pub title_prefix: Option<String>,
    /// Prefix of the canonical source path, e.g. `projects/`.
    pub path_prefix: Option<String>,
    pub tag: Option<String>,
    /// Substring of the title or the content.
    pub text: Option<String>,
}

impl NodeFilter {
    pub fn is_empty(&self) -> bool {
        self.title_prefix.is_none()
            && self.path_prefix.is_none()
            && self.tag.is_none()
            && self.text.is_none()
    }

    /// Append a `WHERE` clause over the `nodes` table.
    pub(crate) fn push_where(&self, qb: &mut QueryBuilder<Sqlite>) {
        qb.push(" WHERE 1 = 1");
        if let Some(prefix) = &self.title_prefix {
            qb.push(" AND title LIKE ");
            qb.push_bind(format!("{}%", escape_like(prefix)));
            qb.push(" ESCAPE '\\'");
        }
        if let Some(prefix) = &self.path_prefix {
            let mut key = crate::paths::canonical_path(prefix);
            if prefix.ends_with('/') && !key.is_empty() {
                key.push('/');
            }
            qb.push(" AND substr(source_key, 1, ");
            qb.push_bind(key.chars().count() as i64);
            qb.push(") = ");
            qb.push_bind(key);
        }
        if let Some(tag) = &self.tag {
            qb.push(" AND EXISTS (SELECT 1 FROM json_each(nodes.tag_keys) AS t WHERE t.value = ");
            qb.push_bind(tag_key(tag));
            qb.push(")");
        }
        if let Some(text) = &self.text {
            let pattern = format!("%{}%", escape_like(text));
            qb.push(" AND (title LIKE ");
            qb.push_bind(pattern.clone());
            qb.push(" ESCAPE '\\' OR content LIKE ");
            qb.push_bind(pattern);
            qb.push(" ESCAPE '\\')");
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Defaults to [`DEFAULT_LIMIT`].
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl Pagination {
    pub fn new(limit: usize, offset: usize) -> Self {
        Pagination {
            limit: Some(limit),
            offset: Some(offset),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }

    pub fn offset(&self) -> usize {
        self.offset.unwrap_or(DEFAULT_OFFSET)
    }
}

/// A page of results from the node cache.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultsPage<B> {
    /// Total matches, ignoring pagination.
    pub count: usize,
    pub start: usize,
    pub results: B,
}

/// The searchable form of a tag: `#` stripped, trimmed, lower-cased.
pub fn tag_key(tag: &str) -> String {
    tag.trim().trim_start_matches('#').to_lowercase()
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
