//! Node, source reference and derived-record types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::error::DocGraphError;

/// Stable node identity. Either a minted UUID or, transiently, the canonical source path of a
/// document that has not been assigned one yet.
pub type NodeId = String;

/// Open front-matter fields that are neither the id, the title nor the tag list.
pub type Properties = BTreeMap<String, Value>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    File,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::File => write!(f, "file"),
        }
    }
}

impl FromStr for SourceKind {
    type Err = DocGraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(SourceKind::File),
            other => Err(DocGraphError::Serialization(format!(
                "unknown source kind '{other}'"
            ))),
        }
    }
}

/// Where a node was parsed from. Only `path` changes over a node's lifetime (renames).
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub kind: SourceKind,
    /// Root-relative, forward-slash separated, original case.
    pub path: String,
    /// Milliseconds since the unix epoch.
    pub modified: i64,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub title: String,
    /// Body text with the front matter stripped.
    pub content: String,
    pub tags: Vec<String>,
    /// Link targets as written, in first-seen order. Input to every resolution pass.
    pub raw_links: Vec<String>,
    /// Resolved node ids, or the literal target when it did not resolve.
    pub outgoing_links: Vec<NodeId>,
    pub properties: Properties,
    pub source: SourceRef,
}

impl Node {
    pub fn has_tag(&self, tag: &str) -> bool {
        let wanted = tag.to_lowercase();
        self.tags.iter().any(|t| t.to_lowercase() == wanted)
    }

    /// Text handed to an embedding model for this node.
    pub fn embedding_text(&self) -> String {
        if self.title.is_empty() {
            self.content.clone()
        } else {
            format!("{}\n\n{}", self.title, self.content)
        }
    }
}

/// Deduplicate tags case-insensitively, keeping the first spelling seen.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    tags.into_iter()
        .map(|tag| tag.as_ref().trim().trim_start_matches('#').to_string())
        .filter(|tag| !tag.is_empty() && seen.insert(tag.to_lowercase()))
        .collect()
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub fn system_time_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

impl FromRow<'_, SqliteRow> for Node {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let json_column = |name: &str| -> sqlx::Result<String> { row.try_get::<String, _>(name) };
        let decode = |e: serde_json::Error| sqlx::Error::Decode(Box::new(e));

        let tags: Vec<String> = serde_json::from_str(&json_column("tags")?).map_err(decode)?;
        let raw_links: Vec<String> =
            serde_json::from_str(&json_column("raw_links")?).map_err(decode)?;
        let outgoing_links: Vec<String> =
            serde_json::from_str(&json_column("outgoing_links")?).map_err(decode)?;
        let properties: Properties =
            serde_json::from_str(&json_column("properties")?).map_err(decode)?;
        let kind_str: &str = row.try_get("source_kind")?;
        let kind = SourceKind::from_str(kind_str).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(Node {
            id: row.try_get("id")?,
            title: row.try_get("title")?,
            content: row.try_get("content")?,
            tags,
            raw_links,
            outgoing_links,
            properties,
            source: SourceRef {
                kind,
                path: row.try_get("source_path")?,
                modified: row.try_get("source_modified")?,
            },
        })
    }
}

/// Degree centrality of one node, as persisted after every graph rebuild.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CentralityRecord {
    pub node_id: NodeId,
    pub in_degree: u32,
    pub out_degree: u32,
    pub computed_at: i64,
}

impl CentralityRecord {
    pub fn same_degrees(&self, other: &CentralityRecord) -> bool {
        self.node_id == other.node_id
            && self.in_degree == other.in_degree
            && self.out_degree == other.out_degree
    }
}

impl FromRow<'_, SqliteRow> for CentralityRecord {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(CentralityRecord {
            node_id: row.try_get("node_id")?,
            in_degree: row.try_get("in_degree")?,
            out_degree: row.try_get("out_degree")?,
            computed_at: row.try_get("computed_at")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub node_id: NodeId,
    pub model_id: String,
    pub vector: Vec<f32>,
}

impl EmbeddingRecord {
    /// Little-endian f32 blob, 4 bytes per component.
    pub fn vector_blob(&self) -> Vec<u8> {
        self.vector.iter().flat_map(|c| c.to_le_bytes()).collect()
    }

    pub fn vector_from_blob(blob: &[u8]) -> Result<Vec<f32>, DocGraphError> {
        if blob.len() % 4 != 0 {
            return Err(DocGraphError::Serialization(format!(
                "embedding blob length {} is not a multiple of 4",
                blob.len()
            )));
        }
        Ok(blob
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }
}

impl FromRow<'_, SqliteRow> for EmbeddingRecord {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let blob: Vec<u8> = row.try_get("vector")?;
        Ok(EmbeddingRecord {
            node_id: row.try_get("node_id")?,
            model_id: row.try_get("model_id")?,
            vector: EmbeddingRecord::vector_from_blob(&blob)
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        })
    }
}
