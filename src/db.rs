use futures_core::future::BoxFuture;
use sqlx::{
    error::BoxDynError,
    migrate::{Migration as SqlxMigration, MigrationSource, MigrationType, Migrator},
    sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Execute, Pool, QueryBuilder, Row,
};
use std::{collections::BTreeMap, fs, path::Path, result::Result};

use crate::{
    error::DocGraphError,
    paths::canonical_path,
    properties::{CentralityRecord, EmbeddingRecord, Node, NodeId},
    query::{tag_key, NodeFilter, Pagination, ResultsPage, TagMode},
};

/// Ids bound per statement, well under SQLite's host parameter limit.
///
/// <https://www.sqlite.org/limits.html#max_variable_number>
const ID_CHUNK: usize = 500;

/// Cached location and freshness of one node, as needed by a full scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedSource {
    pub id: NodeId,
    pub path: String,
    pub modified: i64,
}

#[derive(Debug, Clone)]
pub struct DbConnection(pub Pool<Sqlite>);

impl DbConnection {
    pub async fn open(db_path: &Path) -> Result<Self, DocGraphError> {
        Ok(DbConnection(db_init(db_path).await?))
    }

    pub async fn close(&self) {
        self.0.close().await;
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_node(&self, id: &str) -> Result<Option<Node>, DocGraphError> {
        let node = sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.0)
            .await
            .map_err(|e| {
                tracing::error!("[DbConnection.get_node] SQL error for '{}': {}", id, e);
                e
            })?;
        Ok(node)
    }

    /// Nodes for `ids` in request order. Unknown ids are skipped.
    pub async fn get_nodes(&self, ids: &[NodeId]) -> Result<Vec<Node>, DocGraphError> {
        let mut found = BTreeMap::new();
        for chunk in ids.chunks(ID_CHUNK) {
            let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM nodes WHERE id IN (");
            {
                let mut separated = qb.separated(", ");
                for id in chunk {
                    separated.push_bind(id.clone());
                }
            }
            qb.push(")");
            let query = qb.build_query_as::<Node>();
            let sql = query.sql();
            let nodes = query.fetch_all(&self.0).await.map_err(|e| {
                tracing::error!(
                    "[DbConnection.get_nodes] SQL error processing '{}'\n\terror: {}",
                    sql,
                    e
                );
                e
            })?;
            found.extend(nodes.into_iter().map(|node| (node.id.clone(), node)));
        }
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    pub async fn get_node_by_path(&self, path: &str) -> Result<Option<Node>, DocGraphError> {
        Ok(
            sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE source_key = ?")
                .bind(canonical_path(path))
                .fetch_optional(&self.0)
                .await?,
        )
    }

    /// Every cached node in the order it was first cached.
    pub async fn all_nodes(&self) -> Result<Vec<Node>, DocGraphError> {
        Ok(
            sqlx::query_as::<_, Node>("SELECT * FROM nodes ORDER BY rowid")
                .fetch_all(&self.0)
                .await?,
        )
    }

    pub async fn all_node_ids(&self) -> Result<Vec<NodeId>, DocGraphError> {
        let rows = sqlx::query_as::<_, (String,)>("SELECT id FROM nodes ORDER BY id")
            .fetch_all(&self.0)
            .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn count_nodes(&self) -> Result<usize, DocGraphError> {
        let row = sqlx::query("SELECT COUNT(*) FROM nodes")
            .fetch_one(&self.0)
            .await?;
        Ok(row.try_get::<i64, usize>(0)? as usize)
    }

    /// Canonical source path -> cached id and modification time.
    pub async fn get_sources(&self) -> Result<BTreeMap<String, CachedSource>, DocGraphError> {
        let rows = sqlx::query_as::<_, (String, String, String, i64)>(
            "SELECT source_key, id, source_path, source_modified FROM nodes",
        )
        .fetch_all(&self.0)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(key, id, path, modified)| (key, CachedSource { id, path, modified }))
            .collect())
    }

    /// Insert or replace `node`. Any other node cached for the same source location is evicted
    /// (with its derived records) first; the evicted ids are returned.
    #[tracing::instrument(skip_all, fields(id = %node.id))]
    pub async fn upsert_node(&self, node: &Node) -> Result<Vec<NodeId>, DocGraphError> {
        let key = canonical_path(&node.source.path);
        let tag_keys: Vec<String> = node.tags.iter().map(|t| tag_key(t)).collect();
        let mut tx = self.0.begin().await?;

        let displaced = sqlx::query_as::<_, (String,)>(
            "SELECT id FROM nodes WHERE source_key = ? AND id != ?",
        )
        .bind(&key)
        .bind(&node.id)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|(id,)| id)
        .collect::<Vec<_>>();
        for id in displaced.iter() {
            tracing::debug!(
                "[DbConnection] evicting {} which was cached for {}",
                id,
                node.source.path
            );
            for table_sql in [
                "DELETE FROM nodes WHERE id = ?",
                "DELETE FROM embeddings WHERE node_id = ?",
                "DELETE FROM centrality WHERE node_id = ?",
            ] {
                sqlx::query(table_sql).bind(id).execute(&mut *tx).await?;
            }
        }

        sqlx::query(
            "INSERT INTO nodes (id, title, content, tags, tag_keys, raw_links, outgoing_links, \
             properties, source_kind, source_path, source_key, source_modified) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
             title = excluded.title, content = excluded.content, tags = excluded.tags, \
             tag_keys = excluded.tag_keys, raw_links = excluded.raw_links, \
             outgoing_links = excluded.outgoing_links, properties = excluded.properties, \
             source_kind = excluded.source_kind, source_path = excluded.source_path, \
             source_key = excluded.source_key, source_modified = excluded.source_modified",
        )
        .bind(&node.id)
        .bind(&node.title)
        .bind(&node.content)
        .bind(serde_json::to_string(&node.tags)?)
        .bind(serde_json::to_string(&tag_keys)?)
        .bind(serde_json::to_string(&node.raw_links)?)
        .bind(serde_json::to_string(&node.outgoing_links)?)
        .bind(serde_json::to_string(&node.properties)?)
        .bind(node.source.kind.to_string())
        .bind(&node.source.path)
        .bind(&key)
        .bind(node.source.modified)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            tracing::error!("[DbConnection.upsert_node] SQL error for {}: {}", node.id, e);
            e
        })?;

        tx.commit().await?;
        Ok(displaced)
    }

    /// Remove a node and its derived records. Returns whether a node row existed.
    pub async fn delete_node(&self, id: &str) -> Result<bool, DocGraphError> {
        let mut tx = self.0.begin().await?;
        let removed = sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM embeddings WHERE node_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM centrality WHERE node_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(removed > 0)
    }

    /// Persist new resolved link lists in one transaction.
    pub async fn update_outgoing_links(
        &self,
        updates: &[(NodeId, Vec<NodeId>)],
    ) -> Result<(), DocGraphError> {
        if updates.is_empty() {
            return Ok(());
        }
        let mut tx = self.0.begin().await?;
        for (id, links) in updates {
            sqlx::query("UPDATE nodes SET outgoing_links = ? WHERE id = ?")
                .bind(serde_json::to_string(links)?)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Nodes carrying all (or any) of `tags`, compared case-insensitively, ordered by path.
    #[tracing::instrument(skip(self))]
    pub async fn search_by_tags(
        &self,
        tags: &[String],
        mode: TagMode,
    ) -> Result<Vec<Node>, DocGraphError> {
        let mut keys: Vec<String> = tags
            .iter()
            .map(|t| tag_key(t))
            .filter(|t| !t.is_empty())
            .collect();
        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM nodes WHERE ");
        match mode {
            TagMode::All => qb.push(
                "(SELECT COUNT(DISTINCT t.value) FROM json_each(nodes.tag_keys) AS t \
                 WHERE t.value IN (",
            ),
            TagMode::Any => {
                qb.push("EXISTS (SELECT 1 FROM json_each(nodes.tag_keys) AS t WHERE t.value IN (")
            }
        };
        {
            let mut separated = qb.separated(", ");
            for key in keys.iter() {
                separated.push_bind(key.clone());
            }
        }
        match mode {
            TagMode::All => {
                qb.push(")) = ");
                qb.push_bind(keys.len() as i64);
            }
            TagMode::Any => {
                qb.push("))");
            }
        }
        qb.push(" ORDER BY source_key");

        let query = qb.build_query_as::<Node>();
        let sql = query.sql();
        Ok(query.fetch_all(&self.0).await.map_err(|e| {
            tracing::error!(
                "[DbConnection.search_by_tags] SQL error processing '{}'\n\terror: {}",
                sql,
                e
            );
            e
        })?)
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_nodes(
        &self,
        filter: &NodeFilter,
        page: Pagination,
    ) -> Result<ResultsPage<Vec<Node>>, DocGraphError> {
        let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM nodes");
        filter.push_where(&mut count_qb);
        let count = count_qb
            .build()
            .fetch_one(&self.0)
            .await?
            .try_get::<i64, usize>(0)? as usize;

        let start = page.offset();
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM nodes");
        filter.push_where(&mut qb);
        qb.push(" ORDER BY source_key LIMIT ");
        qb.push_bind(page.limit() as i64);
        qb.push(" OFFSET ");
        qb.push_bind(start as i64);
        let results = qb.build_query_as::<Node>().fetch_all(&self.0).await?;

        Ok(ResultsPage {
            count,
            start,
            results,
        })
    }

    pub async fn get_centrality(&self, id: &str) -> Result<Option<CentralityRecord>, DocGraphError> {
        Ok(sqlx::query_as::<_, CentralityRecord>(
            "SELECT * FROM centrality WHERE node_id = ?",
        )
        .bind(id)
        .fetch_optional(&self.0)
        .await?)
    }

    pub async fn all_centrality(&self) -> Result<BTreeMap<NodeId, CentralityRecord>, DocGraphError> {
        let rows = sqlx::query_as::<_, CentralityRecord>("SELECT * FROM centrality")
            .fetch_all(&self.0)
            .await?;
        Ok(rows.into_iter().map(|r| (r.node_id.clone(), r)).collect())
    }

    /// Write changed centrality rows and drop rows for `removed` nodes in one transaction.
    pub async fn write_centrality(
        &self,
        changed: &[CentralityRecord],
        removed: &[NodeId],
    ) -> Result<(), DocGraphError> {
        if changed.is_empty() && removed.is_empty() {
            return Ok(());
        }
        let mut tx = self.0.begin().await?;
        for record in changed {
            sqlx::query(
                "INSERT INTO centrality (node_id, in_degree, out_degree, computed_at) \
                 VALUES (?, ?, ?, ?) ON CONFLICT(node_id) DO UPDATE SET \
                 in_degree = excluded.in_degree, out_degree = excluded.out_degree, \
                 computed_at = excluded.computed_at",
            )
            .bind(&record.node_id)
            .bind(record.in_degree)
            .bind(record.out_degree)
            .bind(record.computed_at)
            .execute(&mut *tx)
            .await?;
        }
        for id in removed {
            sqlx::query("DELETE FROM centrality WHERE node_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_embedding(&self, id: &str) -> Result<Option<EmbeddingRecord>, DocGraphError> {
        Ok(sqlx::query_as::<_, EmbeddingRecord>(
            "SELECT * FROM embeddings WHERE node_id = ?",
        )
        .bind(id)
        .fetch_optional(&self.0)
        .await?)
    }

    pub async fn all_embeddings(&self) -> Result<Vec<EmbeddingRecord>, DocGraphError> {
        Ok(
            sqlx::query_as::<_, EmbeddingRecord>("SELECT * FROM embeddings ORDER BY node_id")
                .fetch_all(&self.0)
                .await?,
        )
    }

    pub async fn put_embedding(&self, record: &EmbeddingRecord) -> Result<(), DocGraphError> {
        sqlx::query(
            "INSERT INTO embeddings (node_id, model_id, dimensions, vector) VALUES (?, ?, ?, ?) \
             ON CONFLICT(node_id) DO UPDATE SET model_id = excluded.model_id, \
             dimensions = excluded.dimensions, vector = excluded.vector",
        )
        .bind(&record.node_id)
        .bind(&record.model_id)
        .bind(record.vector.len() as i64)
        .bind(record.vector_blob())
        .execute(&self.0)
        .await?;
        Ok(())
    }

    pub async fn delete_embedding(&self, id: &str) -> Result<bool, DocGraphError> {
        let removed = sqlx::query("DELETE FROM embeddings WHERE node_id = ?")
            .bind(id)
            .execute(&self.0)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }
}

/// A migration definition.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
    pub kind: MigrationType,
}

#[derive(Debug, Clone)]
struct MigrationList(Vec<Migration>);

impl MigrationSource<'static> for MigrationList {
    fn resolve(self) -> BoxFuture<'static, Result<Vec<SqlxMigration>, BoxDynError>> {
        Box::pin(async move {
            let mut migrations = Vec::new();
            for migration in self.0 {
                if matches!(migration.kind, MigrationType::ReversibleUp) {
                    migrations.push(SqlxMigration::new(
                        migration.version,
                        migration.description.into(),
                        migration.kind,
                        migration.sql.into(),
                        false,
                    ));
                }
            }
            Ok(migrations)
        })
    }
}

fn migrations() -> MigrationList {
    MigrationList(vec![Migration {
        version: 1,
        description: "create_initial_tables",
        sql: "\
        CREATE TABLE nodes (\
            id TEXT PRIMARY KEY NOT NULL, \
            title TEXT NOT NULL, \
            content TEXT NOT NULL, \
            tags TEXT NOT NULL DEFAULT '[]', \
            tag_keys TEXT NOT NULL DEFAULT '[]', \
            raw_links TEXT NOT NULL DEFAULT '[]', \
            outgoing_links TEXT NOT NULL DEFAULT '[]', \
            properties TEXT NOT NULL DEFAULT '{}', \
            source_kind TEXT NOT NULL, \
            source_path TEXT NOT NULL, \
            source_key TEXT NOT NULL UNIQUE, \
            source_modified INTEGER NOT NULL); \
        CREATE TABLE centrality (\
            node_id TEXT PRIMARY KEY NOT NULL, \
            in_degree INTEGER NOT NULL, \
            out_degree INTEGER NOT NULL, \
            computed_at INTEGER NOT NULL); \
        CREATE TABLE embeddings (\
            node_id TEXT PRIMARY KEY NOT NULL, \
            model_id TEXT NOT NULL, \
            dimensions INTEGER NOT NULL, \
            vector BLOB NOT NULL);",
        kind: MigrationType::ReversibleUp,
    }])
}

pub async fn db_init(db_path: &Path) -> Result<Pool<Sqlite>, DocGraphError> {
    tracing::debug!("Initializing cache db from file: {:?}", db_path);
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .journal_mode(SqliteJournalMode::Wal)
        .read_only(false)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    let migrator = Migrator::new(migrations()).await?;
    migrator.run(&pool).await?;

    let node_count = sqlx::query("SELECT COUNT(*) FROM nodes;")
        .fetch_one(&pool)
        .await?;
    let embedding_count = sqlx::query("SELECT COUNT(*) FROM embeddings;")
        .fetch_one(&pool)
        .await?;
    tracing::info!(
        "DB Connection initialized.\n \
         \tCached node count:\t{:?} \n \
         \tCached embedding count:\t{:?}",
        node_count.try_get::<i64, usize>(0)?,
        embedding_count.try_get::<i64, usize>(0)?
    );

    Ok(pool)
}
