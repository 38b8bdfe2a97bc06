//! Cache synchronization.
//!
//! Both entry points share one shape: process source units one at a time (a failing unit is
//! logged and skipped), then run a single whole-graph pass that resolves links, rebuilds the
//! [`GraphIndex`] and persists centrality, then embed whatever changed.
//!
//! - [`DocumentStore::sync`] walks the whole root and compares modification times with the
//!   cache.
//! - [`DocumentStore::sync_changes`] applies a coalesced [`ChangeBatch`] from the watcher.
//!
//! An `unlink` removes the node right away (for a directory, every node beneath it) but keeps a
//! [`PendingRename`] snapshot for `rename_ttl`. An `add` that parses to the same stable id inside
//! that window restores the node's embedding and counts as a rename instead of a delete and
//! create. A full sync leaves live snapshots alone, so it can complete a rename too.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use walkdir::WalkDir;

use crate::{
    error::DocGraphError,
    event::{ChangeBatch, SyncReport},
    graph::GraphIndex,
    identity::{is_stable_id, mint_id, resolve_identity},
    paths::{base_name, canonical_path, relative_path},
    properties::{
        now_millis, system_time_millis, EmbeddingRecord, Node, NodeId, SourceKind, SourceRef,
    },
    resolver::LinkResolver,
    store::DocumentStore,
    vector::Embedder,
};

/// Snapshot of a node removed by an `unlink`, kept in case the file reappears elsewhere.
#[derive(Debug, Clone)]
pub struct PendingRename {
    pub id: NodeId,
    pub old_path: String,
    pub timestamp: Instant,
    pub node: Node,
    pub embedding: Option<EmbeddingRecord>,
}

impl PendingRename {
    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.timestamp.elapsed() > ttl
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScannedUnit {
    pub rel: String,
    pub abs: PathBuf,
    pub modified: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UnitOutcome {
    Unchanged(NodeId),
    Upserted { id: NodeId, embed: bool },
    Skipped,
}

pub(crate) async fn file_modified(path: &Path) -> Result<i64, DocGraphError> {
    let metadata = tokio::fs::metadata(path).await?;
    Ok(system_time_millis(metadata.modified()?))
}

impl DocumentStore {
    /// Bring the cache in line with everything under the source root.
    #[tracing::instrument(skip(self))]
    pub async fn sync(&mut self) -> Result<SyncReport, DocGraphError> {
        self.purge_expired_renames();
        let mut report = SyncReport::default();
        let mut to_embed = Vec::new();

        let cached = self.db.get_sources().await?;
        let mut seen = BTreeSet::new();
        for unit in self.scan_units() {
            let key = canonical_path(&unit.rel);
            if !seen.insert(key.clone()) {
                tracing::warn!(
                    "[DocumentStore] {} differs only in case from another document, skipping",
                    unit.rel
                );
                report.skipped += 1;
                continue;
            }
            if cached
                .get(&key)
                .is_some_and(|c| c.path == unit.rel && c.modified >= unit.modified)
            {
                continue;
            }
            let outcome = self.process_unit(&unit.abs, &unit.rel, &mut report).await;
            self.record_outcome(&unit.rel, outcome, &mut report, &mut to_embed)?;
        }

        for (key, source) in self.db.get_sources().await? {
            if seen.contains(&key) {
                continue;
            }
            tracing::info!("[DocumentStore] {} no longer exists, removing", source.path);
            self.remove_cached(&source.id).await?;
            report.deleted += 1;
        }

        self.finalize(&mut report, to_embed).await?;
        tracing::info!("[DocumentStore] sync finished: {:?}", report);
        Ok(report)
    }

    /// Apply one coalesced watcher batch, in order.
    #[tracing::instrument(skip_all, fields(changes = batch.len()))]
    pub async fn sync_changes(&mut self, batch: ChangeBatch) -> Result<SyncReport, DocGraphError> {
        self.purge_expired_renames();
        let mut report = SyncReport::default();
        let mut to_embed = Vec::new();

        for change in batch {
            let Some(rel) = self.relative_to_root(&change.path) else {
                tracing::warn!(
                    "[DocumentStore] ignoring change outside the source root: {:?}",
                    change.path
                );
                report.skipped += 1;
                continue;
            };
            let metadata = tokio::fs::metadata(&change.path).await.ok();
            if metadata.as_ref().is_some_and(|m| m.is_dir()) {
                tracing::debug!("[DocumentStore] {} directory {}", change.event, rel);
                for unit in self.scan_dir(&change.path) {
                    let outcome = self.refresh_unit(&unit.abs, &unit.rel, &mut report).await;
                    self.record_outcome(&unit.rel, outcome, &mut report, &mut to_embed)?;
                }
                continue;
            }
            if !metadata.is_some_and(|m| m.is_file()) {
                self.unlink_unit(&rel, &mut report).await?;
                continue;
            }
            tracing::debug!("[DocumentStore] {} {}", change.event, rel);
            let outcome = self.refresh_unit(&change.path, &rel, &mut report).await;
            if outcome == Ok(UnitOutcome::Skipped) {
                continue;
            }
            self.record_outcome(&rel, outcome, &mut report, &mut to_embed)?;
        }

        self.finalize(&mut report, to_embed).await?;
        tracing::info!("[DocumentStore] batch applied: {:?}", report);
        Ok(report)
    }

    fn record_outcome(
        &self,
        rel: &str,
        outcome: Result<UnitOutcome, DocGraphError>,
        report: &mut SyncReport,
        to_embed: &mut Vec<NodeId>,
    ) -> Result<(), DocGraphError> {
        match outcome {
            Ok(UnitOutcome::Upserted { id, embed }) => {
                if embed {
                    to_embed.push(id);
                }
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) if e.is_per_unit() => {
                tracing::warn!("[DocumentStore] skipping {}: {}", rel, e);
                report.skipped += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn scan_units(&self) -> Vec<ScannedUnit> {
        self.scan_dir(&self.config.root)
    }

    /// Registered source units under `dir`, which is the root or a directory inside it.
    pub(crate) fn scan_dir(&self, dir: &Path) -> Vec<ScannedUnit> {
        let walker = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0
                    || !entry.file_type().is_dir()
                    || !self
                        .config
                        .is_ignored_dir(&entry.file_name().to_string_lossy())
            });

        let mut units = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("[DocumentStore] scan error: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || entry.file_name().to_string_lossy().starts_with('.')
            {
                continue;
            }
            let Some(rel) = self.relative_to_root(entry.path()) else {
                tracing::warn!("[DocumentStore] {:?} is outside the source root", entry.path());
                continue;
            };
            if !self.codecs.handles(&rel) {
                continue;
            }
            let modified = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
                Some(time) => system_time_millis(time),
                None => {
                    tracing::warn!("[DocumentStore] no modification time for {}, skipping", rel);
                    continue;
                }
            };
            units.push(ScannedUnit {
                rel,
                abs: entry.path().to_path_buf(),
                modified,
            });
        }
        tracing::debug!("[DocumentStore] scan found {} source units", units.len());
        units
    }

    pub(crate) fn relative_to_root(&self, path: &Path) -> Option<String> {
        relative_path(&self.config.root, path)
            .ok()
            .or_else(|| {
                self.canonical_root
                    .as_ref()
                    .and_then(|root| relative_path(root, path).ok())
            })
            .filter(|rel| !rel.is_empty())
    }

    async fn is_up_to_date(&self, rel: &str, abs: &Path) -> Result<bool, DocGraphError> {
        let Some(cached) = self.db.get_node_by_path(rel).await? else {
            return Ok(false);
        };
        let modified = file_modified(abs).await?;
        Ok(cached.source.path == rel && cached.source.modified >= modified)
    }

    /// Re-parse a unit named by a watcher event unless the cache already holds this version.
    async fn refresh_unit(
        &mut self,
        abs: &Path,
        rel: &str,
        report: &mut SyncReport,
    ) -> Result<UnitOutcome, DocGraphError> {
        if self.is_up_to_date(rel, abs).await? {
            return Ok(UnitOutcome::Skipped);
        }
        self.process_unit(abs, rel, report).await
    }

    /// Parse one source unit and upsert its node. Mints and writes back a stable id when the
    /// unit lacks one and `write_ids` is on.
    pub(crate) async fn process_unit(
        &mut self,
        abs: &Path,
        rel: &str,
        report: &mut SyncReport,
    ) -> Result<UnitOutcome, DocGraphError> {
        let codec = self
            .codecs
            .for_path(rel)
            .ok_or_else(|| DocGraphError::Codec(format!("no codec registered for {rel}")))?;
        let bytes = tokio::fs::read(abs).await?;
        let mut modified = file_modified(abs).await?;
        let parsed = codec.parse(&bytes);
        report.parsed += 1;

        let key = canonical_path(rel);
        let identity = resolve_identity(&parsed, &key);
        let mut id = identity.id.clone();
        let mut needs_mint = identity.needs_mint;

        if !needs_mint {
            if let Some(owner) = self.db.get_node(&id).await? {
                let owner_on_disk = tokio::fs::metadata(self.config.root.join(&owner.source.path))
                    .await
                    .is_ok_and(|m| m.is_file());
                if canonical_path(&owner.source.path) != key && owner_on_disk {
                    tracing::warn!(
                        "[DocumentStore] {} declares id {} which already belongs to {}",
                        rel,
                        id,
                        owner.source.path
                    );
                    needs_mint = true;
                }
            }
        }

        if needs_mint {
            if self.config.write_ids {
                let at_path = self.db.get_node_by_path(rel).await?;
                let reused = at_path
                    .filter(|node| is_stable_id(&node.id) && node.id != id)
                    .map(|node| node.id);
                let minted = match &reused {
                    Some(reused) => reused.clone(),
                    None => mint_id()?,
                };
                let mut with_id = parsed.clone();
                with_id.id = Some(minted.clone());
                let written = match codec.serialize(&with_id) {
                    Ok(text) => self.write_source(abs, &text).await,
                    Err(e) => Err(e),
                };
                match written {
                    Ok(post_write) => {
                        id = minted;
                        modified = post_write;
                        tracing::info!("[DocumentStore] assigned id {} to {}", id, rel);
                    }
                    Err(e) => {
                        // Index under the location until a later write can carry a stable id.
                        id = reused.unwrap_or_else(|| key.clone());
                        tracing::warn!(
                            "[DocumentStore] could not write an id into {}, indexing it as {}: {}",
                            rel,
                            id,
                            e
                        );
                    }
                }
            } else if !identity.needs_mint {
                tracing::warn!(
                    "[DocumentStore] skipping {}: duplicate id and write_ids is disabled",
                    rel
                );
                report.skipped += 1;
                return Ok(UnitOutcome::Skipped);
            }
        }

        let mut restored = None;
        if let Some(pending) = self.pending_renames.remove(&id) {
            if pending.is_expired(self.config.rename_ttl()) {
                tracing::debug!(
                    "[DocumentStore] rename window for {} ({}) has passed",
                    id,
                    pending.old_path
                );
            } else {
                restored = Some(pending);
            }
        }
        let previous = match self.db.get_node(&id).await? {
            Some(node) => Some(node),
            None => restored.as_ref().map(|pending| pending.node.clone()),
        };

        let node = Node {
            id: id.clone(),
            title: parsed
                .title
                .clone()
                .filter(|title| !title.trim().is_empty())
                .unwrap_or_else(|| base_name(rel).to_string()),
            content: parsed.content,
            tags: parsed.tags,
            raw_links: parsed.raw_links,
            outgoing_links: previous
                .as_ref()
                .map(|p| p.outgoing_links.clone())
                .unwrap_or_default(),
            properties: parsed.properties,
            source: SourceRef {
                kind: SourceKind::File,
                path: rel.to_string(),
                modified,
            },
        };

        if restored.is_none() && previous.as_ref() == Some(&node) {
            return Ok(UnitOutcome::Unchanged(id));
        }

        for displaced in self.db.upsert_node(&node).await? {
            tracing::debug!("[DocumentStore] {} replaced {} at {}", id, displaced, rel);
            self.vectors.remove(&displaced);
            report.deleted += 1;
        }
        report.upserted += 1;

        if let Some(pending) = restored {
            tracing::info!(
                "[DocumentStore] {} renamed {} -> {}",
                id,
                pending.old_path,
                rel
            );
            report.renamed += 1;
            if let Some(embedding) = pending.embedding {
                self.restore_embedding(embedding).await?;
            }
        } else if let Some(prev) = previous
            .as_ref()
            .filter(|p| canonical_path(&p.source.path) != key)
        {
            tracing::info!(
                "[DocumentStore] {} moved {} -> {}",
                id,
                prev.source.path,
                rel
            );
            report.renamed += 1;
        }

        let embed = self.embedder.is_some()
            && previous
                .as_ref()
                .is_none_or(|p| p.content != node.content || p.title != node.title);
        Ok(UnitOutcome::Upserted { id, embed })
    }

    /// Drop the node at `rel`, or every node beneath it when `rel` was a directory, keeping a
    /// [`PendingRename`] snapshot of each.
    async fn unlink_unit(&mut self, rel: &str, report: &mut SyncReport) -> Result<(), DocGraphError> {
        let key = canonical_path(rel);
        let sources = self.db.get_sources().await?;
        let ids = match sources.get(&key) {
            Some(source) => vec![source.id.clone()],
            None => {
                let prefix = format!("{key}/");
                sources
                    .range(prefix.clone()..)
                    .take_while(|(source_key, _)| source_key.starts_with(&prefix))
                    .map(|(_, source)| source.id.clone())
                    .collect::<Vec<_>>()
            }
        };
        if ids.is_empty() {
            tracing::debug!("[DocumentStore] unlink for uncached {}", rel);
            return Ok(());
        }
        for id in ids {
            let Some(node) = self.db.get_node(&id).await? else {
                continue;
            };
            let embedding = self.db.get_embedding(&node.id).await?;
            self.remove_cached(&node.id).await?;
            report.deleted += 1;
            tracing::debug!(
                "[DocumentStore] {} unlinked, holding {} for a possible rename",
                node.source.path,
                node.id
            );
            self.pending_renames.insert(
                node.id.clone(),
                PendingRename {
                    id: node.id.clone(),
                    old_path: node.source.path.clone(),
                    timestamp: Instant::now(),
                    node,
                    embedding,
                },
            );
        }
        Ok(())
    }

    async fn restore_embedding(&mut self, embedding: EmbeddingRecord) -> Result<(), DocGraphError> {
        if let Err(e) = self
            .vectors
            .check_insert(&embedding.node_id, &embedding.vector)
        {
            tracing::warn!(
                "[DocumentStore] dropping embedding of renamed node {}: {}",
                embedding.node_id,
                e
            );
            return Ok(());
        }
        self.db.put_embedding(&embedding).await?;
        self.vectors.insert(embedding)
    }

    pub(crate) fn purge_expired_renames(&mut self) {
        let ttl = self.config.rename_ttl();
        self.pending_renames.retain(|id, pending| {
            let keep = !pending.is_expired(ttl);
            if !keep {
                tracing::debug!(
                    "[DocumentStore] no rename for {} ({}) within {:?}, treating as deleted",
                    id,
                    pending.old_path,
                    ttl
                );
            }
            keep
        });
    }

    /// Whole-graph pass: resolve links, rebuild the graph, persist centrality, embed `to_embed`.
    pub(crate) async fn finalize(
        &mut self,
        report: &mut SyncReport,
        to_embed: Vec<NodeId>,
    ) -> Result<(), DocGraphError> {
        let mut nodes = self.db.all_nodes().await?;
        let resolution = LinkResolver::new(&nodes).resolve_all(&nodes);
        self.db.update_outgoing_links(&resolution.updates).await?;
        report.links_updated += resolution.updates.len();
        report.ambiguous_links += resolution.ambiguities.len();

        let mut updates: BTreeMap<NodeId, Vec<NodeId>> = resolution.updates.into_iter().collect();
        for node in nodes.iter_mut() {
            if let Some(links) = updates.remove(&node.id) {
                node.outgoing_links = links;
            }
        }

        report.centrality_updated += self.rebuild_graph(&nodes).await?;
        self.embed_nodes(&nodes, to_embed, report).await;
        Ok(())
    }

    /// Replace the graph and write centrality rows whose degrees changed. Returns the number of
    /// rows written or removed.
    pub(crate) async fn rebuild_graph(&mut self, nodes: &[Node]) -> Result<usize, DocGraphError> {
        let fatal = |e: DocGraphError| DocGraphError::Graph(format!("persisting centrality: {e}"));
        let graph = GraphIndex::build(nodes)?;
        let fresh = graph.centrality(now_millis());
        let existing = self.db.all_centrality().await.map_err(fatal)?;

        let changed = fresh
            .iter()
            .filter(|record| {
                existing
                    .get(&record.node_id)
                    .is_none_or(|old| !old.same_degrees(record))
            })
            .cloned()
            .collect::<Vec<_>>();
        let live = fresh
            .iter()
            .map(|record| record.node_id.as_str())
            .collect::<BTreeSet<_>>();
        let removed = existing
            .keys()
            .filter(|id| !live.contains(id.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        self.db
            .write_centrality(&changed, &removed)
            .await
            .map_err(fatal)?;

        self.graph = graph;
        Ok(changed.len() + removed.len())
    }

    async fn embed_nodes(&mut self, nodes: &[Node], ids: Vec<NodeId>, report: &mut SyncReport) {
        let Some(embedder) = self.embedder.clone() else {
            return;
        };
        let by_id = nodes
            .iter()
            .map(|node| (node.id.as_str(), node))
            .collect::<BTreeMap<_, _>>();
        let mut done = BTreeSet::new();
        for id in ids {
            if !done.insert(id.clone()) {
                continue;
            }
            let Some(node) = by_id.get(id.as_str()) else {
                continue;
            };
            match self.embed_node(embedder.as_ref(), node).await {
                Ok(()) => report.embedded += 1,
                Err(e) => tracing::warn!("[DocumentStore] embedding {} failed, skipping: {}", id, e),
            }
        }
    }

    pub(crate) async fn embed_node(
        &mut self,
        embedder: &dyn Embedder,
        node: &Node,
    ) -> Result<(), DocGraphError> {
        let vector = embedder.embed(&node.embedding_text()).await?;
        self.put_embedding(EmbeddingRecord {
            node_id: node.id.clone(),
            model_id: embedder.model_id().to_string(),
            vector,
        })
        .await
    }
}
