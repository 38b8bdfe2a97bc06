//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use docgraph_core::{
    config::StoreConfig,
    error::DocGraphError,
    query::ResolveStrategy,
    store::DocumentStore,
    vector::Embedder,
    Node,
};
use futures_core::future::BoxFuture;
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};
use tempfile::TempDir;
use tracing_subscriber::{layer::Context, Layer};

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times, subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Counts WARN events emitted from one module of the crate.
#[allow(dead_code)]
#[derive(Clone)]
pub struct WarnCounter {
    target: &'static str,
    count: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl WarnCounter {
    pub fn new(target: &'static str) -> Self {
        WarnCounter {
            target,
            count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl<S: tracing::Subscriber> Layer<S> for WarnCounter {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() == tracing::Level::WARN && meta.target() == self.target {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Write `text` to `<root>/<rel>`, creating parent directories.
#[allow(dead_code)]
pub fn write_doc(root: &Path, rel: &str, text: &str) -> PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, text).unwrap();
    path
}

/// Push a file's modification time into the future so the next sync sees it as newer than the
/// cached value regardless of filesystem timestamp granularity.
#[allow(dead_code)]
pub fn touch_later(path: &Path, secs: u64) {
    let later = SystemTime::now() + Duration::from_secs(secs);
    filetime::set_file_mtime(path, filetime::FileTime::from_system_time(later)).unwrap();
}

/// Create a small vault:
///
/// - `notes/alpha.md`, titled "Alpha", tagged `Project` and `a`
/// - `beta.md`, titled "Beta", tagged `project`
/// - `gamma.md` (no header), linking to Alpha, Beta and a missing note
///
/// Returns the vault root (`<temp_dir>/vault`).
#[allow(dead_code)]
pub fn create_test_vault(temp_dir: &TempDir) -> PathBuf {
    let root = temp_dir.path().join("vault");
    std::fs::create_dir(&root).unwrap();

    write_doc(
        &root,
        "notes/alpha.md",
        r#"---
title: Alpha
tags: [Project, a]
status: draft
---
# Alpha

The first note. It links to [[Beta]].
"#,
    );
    write_doc(
        &root,
        "beta.md",
        r#"---
title: Beta
tags: project
---
Second note.
"#,
    );
    write_doc(
        &root,
        "gamma.md",
        "See [[Alpha]], [[Beta|the second one]] and [[Nonexistent]].\n\n`[[Ignored]]`\n",
    );
    root
}

/// Defaults for `root`, with short watcher timings.
#[allow(dead_code)]
pub fn test_config(root: &Path) -> StoreConfig {
    let mut config = StoreConfig::new(root);
    config.debounce_ms = 50;
    config
}

#[allow(dead_code)]
pub async fn open_store(root: &Path) -> DocumentStore {
    DocumentStore::open(test_config(root)).await.unwrap()
}

/// Look up a node by title, failing the test when it is missing.
#[allow(dead_code)]
pub async fn node_titled(store: &DocumentStore, title: &str) -> Node {
    store
        .resolve_nodes(&[title.to_string()], ResolveStrategy::Exact)
        .await
        .unwrap()
        .pop()
        .flatten()
        .unwrap_or_else(|| panic!("no node titled {title}"))
}

/// Deterministic three-dimensional embedder: counts of the letters a, b and c.
#[allow(dead_code)]
pub struct LetterEmbedder;

impl Embedder for LetterEmbedder {
    fn model_id(&self) -> &str {
        "letters-v1"
    }

    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, DocGraphError>> {
        Box::pin(async move {
            let count = |c: char| text.chars().filter(|x| x.eq_ignore_ascii_case(&c)).count() as f32;
            Ok(vec![count('a'), count('b'), count('c')])
        })
    }
}

/// Fails for any text mentioning "poison".
#[allow(dead_code)]
pub struct PickyEmbedder;

impl Embedder for PickyEmbedder {
    fn model_id(&self) -> &str {
        "picky"
    }

    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, DocGraphError>> {
        Box::pin(async move {
            if text.contains("poison") {
                return Err(DocGraphError::Io("embedding service unavailable".to_string()));
            }
            Ok(vec![1.0, text.len() as f32])
        })
    }
}
