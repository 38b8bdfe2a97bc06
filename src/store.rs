//! The document store: the one entry point that ties the cache, the link graph, the vector index
//! and (optionally) the file watcher together.
//!
//! Every mutating operation takes `&mut self`, so a store shared between the watcher and other
//! callers goes behind one async mutex ([`SharedStore`]). That serializes syncs, watcher batches
//! and CRUD calls; a query never observes a half-applied batch.
//!
//! ```no_run
//! use docgraph_core::{config::StoreConfig, store::DocumentStore};
//!
//! # async fn run() -> Result<(), docgraph_core::DocGraphError> {
//! let mut store = DocumentStore::open(StoreConfig::load("./vault")?).await?;
//! let report = store.sync().await?;
//! println!("{} documents parsed", report.parsed);
//! store.shutdown().await;
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "service")]
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

#[cfg(feature = "service")]
use crate::watch::{BatchCallback, DocWatcher};
use crate::{
    codec::{CodecMap, DocCodec, ParsedDocument},
    config::StoreConfig,
    db::DbConnection,
    error::DocGraphError,
    event::SyncReport,
    graph::GraphIndex,
    identity::{canonical_id, is_stable_id, mint_id},
    paths::{canonical_link_target, canonical_path, extension_of, relative_path, resolve_in_root},
    properties::{normalize_tags, CentralityRecord, EmbeddingRecord, Node, NodeId, Properties},
    query::{Direction, HubMetric, NodeFilter, Pagination, ResolveStrategy, ResultsPage, TagMode},
    resolver::{LinkResolver, Resolution},
    sync::{file_modified, PendingRename, UnitOutcome},
    vector::{Embedder, VectorIndex, VectorMatch},
};

pub type SharedStore = Arc<tokio::sync::Mutex<DocumentStore>>;

/// Input to [`DocumentStore::create_node`].
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNode {
    /// Root-relative location. The default extension is appended when none is given.
    pub path: String,
    /// A stable id to use instead of minting one.
    pub id: Option<NodeId>,
    pub title: Option<String>,
    pub content: String,
    pub tags: Vec<String>,
    pub properties: Properties,
}

/// Partial update for [`DocumentStore::update_node`]. `None` leaves a field as it is.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub title: Option<String>,
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub properties: Option<Properties>,
}

/// Resets the watcher's pause flag when dropped.
struct PauseGuard(Option<Arc<AtomicBool>>);

impl PauseGuard {
    fn engage(flag: Option<Arc<AtomicBool>>) -> Self {
        if let Some(flag) = &flag {
            flag.store(true, Ordering::Relaxed);
        }
        PauseGuard(flag)
    }
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        if let Some(flag) = &self.0 {
            flag.store(false, Ordering::Relaxed);
        }
    }
}

pub struct DocumentStore {
    pub(crate) config: StoreConfig,
    pub(crate) canonical_root: Option<PathBuf>,
    pub(crate) codecs: CodecMap,
    pub(crate) db: DbConnection,
    pub(crate) graph: GraphIndex,
    pub(crate) vectors: VectorIndex,
    pub(crate) embedder: Option<Arc<dyn Embedder>>,
    pub(crate) pending_renames: BTreeMap<NodeId, PendingRename>,
    #[cfg(feature = "service")]
    watcher: Mutex<Option<DocWatcher>>,
    closed: bool,
}

impl DocumentStore {
    /// Open (creating if needed) the cache for `config.root`. The graph and vector index are
    /// loaded from the cache; call [`DocumentStore::sync`] to pick up changes made while closed.
    #[tracing::instrument(skip_all, fields(root = ?config.root))]
    pub async fn open(config: StoreConfig) -> Result<DocumentStore, DocGraphError> {
        config.validate()?;
        if !config.root.is_dir() {
            return Err(DocGraphError::NotFound(format!(
                "source root {:?} is not a directory",
                config.root
            )));
        }
        let codecs = CodecMap::create(&config.extensions)?;
        let db = DbConnection::open(&config.db_path()).await?;

        let mut vectors = VectorIndex::default();
        let rejected = vectors.load(db.all_embeddings().await?);
        if rejected > 0 {
            tracing::warn!(
                "[DocumentStore] {} cached embeddings are unusable and were not loaded",
                rejected
            );
        }
        let graph = GraphIndex::build(&db.all_nodes().await?)?;
        let canonical_root = fs::canonicalize(&config.root)
            .ok()
            .filter(|canonical| canonical != &config.root);

        tracing::info!(
            "[DocumentStore] opened {:?}: {} nodes, {} embeddings",
            config.root,
            graph.node_count(),
            vectors.len()
        );
        Ok(DocumentStore {
            config,
            canonical_root,
            codecs,
            db,
            graph,
            vectors,
            embedder: None,
            pending_renames: BTreeMap::new(),
            #[cfg(feature = "service")]
            watcher: Mutex::new(None),
            closed: false,
        })
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn set_embedder(&mut self, embedder: Option<Arc<dyn Embedder>>) {
        self.embedder = embedder;
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn codecs(&self) -> &CodecMap {
        &self.codecs
    }

    /// Register a codec for more extensions. Takes effect for the next sync; a running watcher
    /// keeps the extension set it was started with.
    pub fn register_codec<S: AsRef<str>>(
        &self,
        extensions: &[S],
        codec: Arc<dyn DocCodec>,
    ) -> Result<(), DocGraphError> {
        self.codecs.register(extensions, codec)
    }

    pub fn db(&self) -> &DbConnection {
        &self.db
    }

    pub fn graph(&self) -> &GraphIndex {
        &self.graph
    }

    pub fn vectors(&self) -> &VectorIndex {
        &self.vectors
    }

    pub fn pending_renames(&self) -> impl Iterator<Item = &PendingRename> {
        self.pending_renames.values()
    }

    fn pause_watcher(&self) -> PauseGuard {
        #[cfg(feature = "service")]
        let flag = self.watcher.lock().as_ref().map(|w| w.pause_flag());
        #[cfg(not(feature = "service"))]
        let flag = None;
        PauseGuard::engage(flag)
    }

    /// Write a source unit with the watcher paused. Returns the new modification time.
    pub(crate) async fn write_source(&self, abs: &Path, text: &str) -> Result<i64, DocGraphError> {
        let _pause = self.pause_watcher();
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(abs, text).await?;
        file_modified(abs).await
    }

    pub(crate) async fn remove_cached(&mut self, id: &str) -> Result<bool, DocGraphError> {
        self.vectors.remove(id);
        self.db.delete_node(id).await
    }

    fn codec_for(&self, rel: &str) -> Result<Arc<dyn DocCodec>, DocGraphError> {
        self.codecs
            .for_path(rel)
            .ok_or_else(|| DocGraphError::Codec(format!("no codec registered for {rel}")))
    }

    async fn require_node(&self, id: &str) -> Result<Node, DocGraphError> {
        self.db
            .get_node(id)
            .await?
            .ok_or_else(|| DocGraphError::NotFound(format!("node {id}")))
    }

    /// Create a source unit and its node. Fails if the id or the file already exists.
    #[tracing::instrument(skip_all, fields(path = %new.path))]
    pub async fn create_node(&mut self, new: NewNode) -> Result<Node, DocGraphError> {
        let mut location = new.path.trim().to_string();
        if extension_of(&location).is_none() {
            location = format!("{location}.{}", self.config.default_extension);
        }
        let abs = resolve_in_root(&self.config.root, &location)?;
        let rel = relative_path(&self.config.root, &abs)?;
        let codec = self.codec_for(&rel)?;
        if tokio::fs::try_exists(&abs).await? || self.db.get_node_by_path(&rel).await?.is_some() {
            return Err(DocGraphError::AlreadyExists(rel));
        }

        let id = match new.id {
            Some(declared) => Some(canonical_id(&declared).ok_or_else(|| {
                DocGraphError::Serialization(format!("'{declared}' is not a stable id"))
            })?),
            None if self.config.write_ids => Some(mint_id()?),
            None => None,
        };
        if let Some(id) = &id {
            if self.pending_renames.contains_key(id) || self.db.get_node(id).await?.is_some() {
                return Err(DocGraphError::AlreadyExists(id.clone()));
            }
        }

        let doc = ParsedDocument {
            id,
            title: new.title,
            tags: normalize_tags(new.tags),
            properties: new.properties,
            content: new.content,
            raw_links: Vec::new(),
        };
        self.write_source(&abs, &codec.serialize(&doc)?).await?;

        let mut report = SyncReport::default();
        let (id, embed) = match self.process_unit(&abs, &rel, &mut report).await? {
            UnitOutcome::Upserted { id, embed } => (id, embed),
            other => {
                return Err(DocGraphError::Cache(format!(
                    "new document {rel} was not cached ({other:?})"
                )))
            }
        };
        self.finalize(&mut report, if embed { vec![id.clone()] } else { vec![] })
            .await?;
        tracing::info!("[DocumentStore] created {} at {}", id, rel);
        self.require_node(&id).await
    }

    /// Rewrite a node's source unit with `update` applied. Links are re-resolved only when the
    /// content changed.
    #[tracing::instrument(skip(self, update))]
    pub async fn update_node(&mut self, id: &str, update: NodeUpdate) -> Result<Node, DocGraphError> {
        let node = self.require_node(id).await?;
        let abs = resolve_in_root(&self.config.root, &node.source.path)?;
        let codec = self.codec_for(&node.source.path)?;

        let mut doc = codec.parse(&tokio::fs::read(&abs).await?);
        if is_stable_id(&node.id) {
            doc.id = Some(node.id.clone());
        }
        let content_changed = update
            .content
            .as_ref()
            .is_some_and(|content| *content != doc.content);
        if let Some(title) = update.title {
            doc.title = Some(title);
        }
        if let Some(content) = update.content {
            doc.content = content;
        }
        if let Some(tags) = update.tags {
            doc.tags = normalize_tags(tags);
        }
        if let Some(properties) = update.properties {
            doc.properties = properties;
        }
        self.write_source(&abs, &codec.serialize(&doc)?).await?;

        let mut report = SyncReport::default();
        let outcome = self
            .process_unit(&abs, &node.source.path, &mut report)
            .await?;
        let (new_id, embed) = match outcome {
            UnitOutcome::Upserted { id, embed } => (id, embed),
            UnitOutcome::Unchanged(id) => (id, false),
            UnitOutcome::Skipped => {
                return Err(DocGraphError::Cache(format!(
                    "updated document {} was not cached",
                    node.source.path
                )))
            }
        };
        let to_embed = if embed { vec![new_id.clone()] } else { vec![] };
        if content_changed || new_id != node.id {
            self.finalize(&mut report, to_embed).await?;
        } else if let (Some(embedder), true) = (self.embedder.clone(), embed) {
            let updated = self.require_node(&new_id).await?;
            if let Err(e) = self.embed_node(embedder.as_ref(), &updated).await {
                tracing::warn!("[DocumentStore] embedding {} failed, skipping: {}", new_id, e);
            }
        }
        self.require_node(&new_id).await
    }

    /// Delete a node's source unit, the node and its embedding, then rebuild the graph.
    #[tracing::instrument(skip(self))]
    pub async fn delete_node(&mut self, id: &str) -> Result<(), DocGraphError> {
        let node = self.require_node(id).await?;
        let abs = resolve_in_root(&self.config.root, &node.source.path)?;
        {
            let _pause = self.pause_watcher();
            match tokio::fs::remove_file(&abs).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(
                        "[DocumentStore] {} was already gone from disk",
                        node.source.path
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.remove_cached(id).await?;
        self.pending_renames.remove(id);
        let mut report = SyncReport::default();
        self.finalize(&mut report, Vec::new()).await?;
        tracing::info!("[DocumentStore] deleted {} ({})", id, node.source.path);
        Ok(())
    }

    pub async fn get_node(&self, id: &str) -> Result<Option<Node>, DocGraphError> {
        self.db.get_node(id).await
    }

    pub async fn get_nodes(&self, ids: &[NodeId]) -> Result<Vec<Node>, DocGraphError> {
        self.db.get_nodes(ids).await
    }

    pub async fn get_all_node_ids(&self) -> Result<Vec<NodeId>, DocGraphError> {
        self.db.all_node_ids().await
    }

    pub async fn search_by_tags(
        &self,
        tags: &[String],
        mode: TagMode,
    ) -> Result<Vec<Node>, DocGraphError> {
        self.db.search_by_tags(tags, mode).await
    }

    pub async fn list_nodes(
        &self,
        filter: &NodeFilter,
        pagination: Pagination,
    ) -> Result<ResultsPage<Vec<Node>>, DocGraphError> {
        self.db.list_nodes(filter, pagination).await
    }

    /// Look up human-facing references. The result lines up with `names`; unmatched names are
    /// `None`.
    pub async fn resolve_nodes(
        &self,
        names: &[String],
        strategy: ResolveStrategy,
    ) -> Result<Vec<Option<Node>>, DocGraphError> {
        let nodes = self.db.all_nodes().await?;
        let mut by_title: BTreeMap<String, &Node> = BTreeMap::new();
        for node in nodes.iter() {
            by_title
                .entry(node.title.to_lowercase())
                .and_modify(|current| {
                    if node.id < current.id {
                        *current = node;
                    }
                })
                .or_insert(node);
        }
        let by_id = nodes
            .iter()
            .map(|node| (node.id.as_str(), node))
            .collect::<BTreeMap<_, _>>();
        let by_key = nodes
            .iter()
            .map(|node| (canonical_path(&node.source.path), node))
            .collect::<BTreeMap<_, _>>();
        let resolver = match strategy {
            ResolveStrategy::Exact => None,
            ResolveStrategy::Lenient => Some(LinkResolver::new(&nodes)),
        };

        Ok(names
            .iter()
            .map(|name| {
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                by_title
                    .get(&name.to_lowercase())
                    .copied()
                    .or_else(|| by_id.get(name).copied())
                    .or_else(|| canonical_id(name).and_then(|id| by_id.get(id.as_str()).copied()))
                    .or_else(|| by_key.get(&canonical_path(name)).copied())
                    .or_else(|| {
                        by_key
                            .get(&canonical_link_target(name, &self.config.default_extension))
                            .copied()
                    })
                    .or_else(|| {
                        let resolver = resolver.as_ref()?;
                        match resolver.resolve_target(name) {
                            Resolution::Node(id) | Resolution::Ambiguous { chosen: id, .. } => {
                                by_id.get(id.as_str()).copied()
                            }
                            Resolution::Literal => None,
                        }
                    })
                    .cloned()
            })
            .collect())
    }

    fn require_vertex(&self, id: &str) -> Result<(), DocGraphError> {
        if !self.graph.contains(id) {
            return Err(DocGraphError::NotFound(format!("node {id}")));
        }
        Ok(())
    }

    pub async fn get_neighbors(
        &self,
        id: &str,
        direction: Direction,
        limit: Option<usize>,
    ) -> Result<Vec<Node>, DocGraphError> {
        self.require_vertex(id)?;
        let ids = self.graph.neighbors(id, direction, limit);
        self.db.get_nodes(&ids).await
    }

    /// Shortest link path from `from` to `to`, or None when `to` is unreachable.
    pub fn find_path(&self, from: &str, to: &str) -> Result<Option<Vec<NodeId>>, DocGraphError> {
        self.require_vertex(from)?;
        self.require_vertex(to)?;
        Ok(self.graph.shortest_path(from, to))
    }

    pub async fn get_hubs(
        &self,
        limit: usize,
        metric: HubMetric,
    ) -> Result<Vec<(Node, usize)>, DocGraphError> {
        let hubs = self.graph.hubs(limit, metric);
        let ids = hubs.iter().map(|(id, _)| id.clone()).collect::<Vec<_>>();
        let mut nodes = self
            .db
            .get_nodes(&ids)
            .await?
            .into_iter()
            .map(|node| (node.id.clone(), node))
            .collect::<BTreeMap<_, _>>();
        Ok(hubs
            .into_iter()
            .filter_map(|(id, degree)| nodes.remove(&id).map(|node| (node, degree)))
            .collect())
    }

    pub async fn get_centrality(&self, id: &str) -> Result<Option<CentralityRecord>, DocGraphError> {
        self.db.get_centrality(id).await
    }

    pub(crate) async fn put_embedding(&mut self, record: EmbeddingRecord) -> Result<(), DocGraphError> {
        self.vectors.check_insert(&record.node_id, &record.vector)?;
        self.db.put_embedding(&record).await?;
        self.vectors.insert(record)
    }

    /// Store a vector for an existing node, replacing any previous one.
    #[tracing::instrument(skip(self, vector), fields(dimensions = vector.len()))]
    pub async fn store_embedding(
        &mut self,
        id: &str,
        model_id: &str,
        vector: Vec<f32>,
    ) -> Result<(), DocGraphError> {
        self.require_node(id).await?;
        self.put_embedding(EmbeddingRecord {
            node_id: id.to_string(),
            model_id: model_id.to_string(),
            vector,
        })
        .await
    }

    pub fn search_by_vector(
        &self,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorMatch>, DocGraphError> {
        self.vectors.search(query, limit)
    }

    /// Embed `text` with the attached embedder and search with the result.
    pub async fn search_by_text(
        &self,
        text: &str,
        limit: usize,
    ) -> Result<Vec<VectorMatch>, DocGraphError> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| DocGraphError::Config("no embedder attached to the store".to_string()))?;
        let query = embedder.embed(text).await?;
        self.vectors.search(&query, limit)
    }

    /// Start watching the source root. Batches go to `callback`; see
    /// [`DocumentStore::watch_and_sync`] for the common case of feeding them back into the store.
    #[cfg(feature = "service")]
    pub fn start_watching(&mut self, callback: BatchCallback) -> Result<(), DocGraphError> {
        let mut watcher = self.watcher.lock();
        if watcher.as_ref().is_some_and(|w| w.is_running()) {
            return Err(DocGraphError::Watch(format!(
                "already watching {:?}",
                self.config.root
            )));
        }
        *watcher = Some(DocWatcher::start(
            &self.config,
            self.codecs.extensions(),
            callback,
        )?);
        Ok(())
    }

    /// Watch the root and apply every batch to `shared` through [`DocumentStore::sync_changes`].
    /// The watcher only holds a weak reference, so dropping the last [`SharedStore`] ends it.
    #[cfg(feature = "service")]
    pub async fn watch_and_sync(shared: &SharedStore) -> Result<(), DocGraphError> {
        let weak = Arc::downgrade(shared);
        let callback: BatchCallback = Arc::new(move |batch| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(shared) = weak.upgrade() else {
                    tracing::debug!("[DocumentStore] store dropped, ignoring batch");
                    return Ok(());
                };
                let mut store = shared.lock().await;
                store.sync_changes(batch).await?;
                Ok(())
            })
        });
        shared.lock().await.start_watching(callback)
    }

    /// Deliver pending watcher changes without waiting for the debounce window.
    #[cfg(feature = "service")]
    pub fn flush_watcher(&self) {
        if let Some(watcher) = self.watcher.lock().as_ref() {
            watcher.flush();
        }
    }

    #[cfg(feature = "service")]
    pub fn is_watching(&self) -> bool {
        self.watcher.lock().as_ref().is_some_and(|w| w.is_running())
    }

    #[cfg(feature = "service")]
    pub fn stop_watching(&mut self) {
        if let Some(mut watcher) = self.watcher.lock().take() {
            watcher.stop();
        }
    }

    /// Stop watching and close the cache. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        #[cfg(feature = "service")]
        self.stop_watching();
        if !self.closed {
            self.closed = true;
            self.db.close().await;
            tracing::info!("[DocumentStore] shut down {:?}", self.config.root);
        }
    }
}
