//! File watching.
//!
//! ## Architecture
//!
//! ```text
//! notify (OS thread) --filter--> unbounded channel --> batcher task (tokio)
//!                                                       |  Coalescer: path -> net event
//!                                                       |  debounce deadline, reset per event
//!                                                       v
//!                                                 callback(ChangeBatch)
//! ```
//!
//! The notify handler only filters and forwards. All coalescing state lives in the batcher task,
//! which is the single owner of the [`Coalescer`]. When the debounce deadline passes (or
//! [`DocWatcher::flush`] is called) the pending batch is handed to the callback on its own tokio
//! task; a callback error or panic is logged and the watcher keeps running.
//!
//! A directory that is created, moved or removed is reported under its own key (see
//! [`WatchFilter::dir_key_for`]); the consumer expands it to the source units beneath it.
//!
//! While paused (see [`DocWatcher::pause`]) incoming events are dropped at the notify handler,
//! so the store can write ids back into files without re-triggering itself.

use futures_core::future::BoxFuture;
use notify::{
    event::{ModifyKind, RenameMode},
    EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
    time::{sleep_until, Instant},
};

use crate::{
    config::StoreConfig,
    error::DocGraphError,
    event::{ChangeBatch, FileEvent, PathChange},
    paths::{canonical_path, extension_of, os_path_to_string},
};

/// Receives each coalesced batch. Errors are logged, never propagated into the watcher.
pub type BatchCallback =
    Arc<dyn Fn(ChangeBatch) -> BoxFuture<'static, Result<(), DocGraphError>> + Send + Sync>;

/// Per-path net events awaiting delivery, in first-arrival order.
#[derive(Debug, Default, Clone)]
pub struct Coalescer {
    order: Vec<String>,
    pending: HashMap<String, PathChange>,
}

impl Coalescer {
    pub fn push(&mut self, change: PathChange) {
        match self.pending.get_mut(&change.key) {
            Some(existing) => match existing.event.coalesce(change.event) {
                Some(event) => {
                    existing.event = event;
                    existing.path = change.path;
                }
                None => {
                    tracing::debug!(
                        "[DocWatcher] {} was created and removed within one window",
                        change.key
                    );
                    self.pending.remove(&change.key);
                    self.order.retain(|key| key != &change.key);
                }
            },
            None => {
                self.order.push(change.key.clone());
                self.pending.insert(change.key.clone(), change);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn get(&self, key: &str) -> Option<FileEvent> {
        self.pending.get(key).map(|change| change.event)
    }

    pub fn drain(&mut self) -> ChangeBatch {
        let mut pending = std::mem::take(&mut self.pending);
        std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|key| pending.remove(&key))
            .collect()
    }
}

/// Decides which OS paths are source units worth reporting and computes their coalescing key.
#[derive(Debug, Clone)]
pub struct WatchFilter {
    roots: Vec<PathBuf>,
    extensions: Vec<String>,
    ignored_dirs: Vec<String>,
}

impl WatchFilter {
    pub fn new(config: &StoreConfig, extensions: Vec<String>) -> Self {
        let mut roots = vec![config.root.clone()];
        if let Ok(canonical) = fs::canonicalize(&config.root) {
            if canonical != config.root {
                roots.push(canonical);
            }
        }
        WatchFilter {
            roots,
            extensions: extensions.iter().map(|ext| ext.to_lowercase()).collect(),
            ignored_dirs: config.ignored_dirs.clone(),
        }
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let relative = self
            .roots
            .iter()
            .find_map(|root| path.strip_prefix(root).ok())?;
        Some(os_path_to_string(relative))
    }

    fn in_ignored_dir<'a, I: IntoIterator<Item = &'a str>>(&self, dirs: I) -> bool {
        dirs.into_iter()
            .any(|segment| self.ignored_dirs.iter().any(|dir| dir == segment))
    }

    /// Canonical root-relative key for `path`, or None if it should not be reported.
    pub fn key_for(&self, path: &Path) -> Option<String> {
        let relative = self.relative(path)?;
        let mut segments = relative.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>();
        let file_name = segments.pop()?;
        if file_name.starts_with('.') || self.in_ignored_dir(segments) {
            return None;
        }
        let ext = extension_of(&relative)?.to_lowercase();
        if !self.extensions.contains(&ext) {
            return None;
        }
        Some(canonical_path(&relative))
    }

    /// Key for a directory that appeared or went away. Files inside a moved directory get no
    /// events of their own, so the directory is reported and expanded by the consumer.
    ///
    /// A vanished path can no longer be inspected; one without any extension is taken to be a
    /// directory.
    pub fn dir_key_for(&self, path: &Path, event: FileEvent) -> Option<String> {
        let relative = self.relative(path)?;
        let segments = relative.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>();
        if segments.is_empty() || self.in_ignored_dir(segments) {
            return None;
        }
        let is_dir = match event {
            FileEvent::Add => path.is_dir(),
            FileEvent::Unlink => extension_of(&relative).is_none() && !path.exists(),
            FileEvent::Change => false,
        };
        is_dir.then(|| canonical_path(&relative))
    }
}

/// Translate one notify event into raw per-path events.
fn raw_events(event: &notify::Event) -> Vec<(PathBuf, FileEvent)> {
    match &event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .map(|p| (p.clone(), FileEvent::Add))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| (p.clone(), FileEvent::Unlink))
            .collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => event
                .paths
                .iter()
                .map(|p| (p.clone(), FileEvent::Unlink))
                .collect(),
            RenameMode::To => event
                .paths
                .iter()
                .map(|p| (p.clone(), FileEvent::Add))
                .collect(),
            RenameMode::Both => {
                let mut raw = Vec::with_capacity(2);
                if let Some(from) = event.paths.first() {
                    raw.push((from.clone(), FileEvent::Unlink));
                }
                if let Some(to) = event.paths.get(1) {
                    raw.push((to.clone(), FileEvent::Add));
                }
                raw
            }
            RenameMode::Any | RenameMode::Other => event
                .paths
                .iter()
                .map(|p| {
                    let kind = if p.exists() {
                        FileEvent::Add
                    } else {
                        FileEvent::Unlink
                    };
                    (p.clone(), kind)
                })
                .collect(),
        },
        EventKind::Modify(_) => event
            .paths
            .iter()
            .map(|p| (p.clone(), FileEvent::Change))
            .collect(),
        _ => Vec::new(),
    }
}

#[derive(Debug)]
enum WatchMsg {
    Change(PathChange),
    Flush,
}

async fn deliver(coalescer: &mut Coalescer, callback: &BatchCallback) {
    let batch = coalescer.drain();
    if batch.is_empty() {
        return;
    }
    tracing::info!("[DocWatcher] delivering batch of {} changes", batch.len());
    match tokio::spawn((callback)(batch)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("[DocWatcher] batch callback failed: {}", e),
        Err(e) => tracing::error!("[DocWatcher] batch callback panicked: {}", e),
    }
}

async fn run_batcher(
    mut rx: UnboundedReceiver<WatchMsg>,
    mut shutdown: oneshot::Receiver<()>,
    debounce: Duration,
    callback: BatchCallback,
) {
    let mut coalescer = Coalescer::default();
    let mut deadline: Option<Instant> = None;
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            msg = rx.recv() => match msg {
                Some(WatchMsg::Change(change)) => {
                    coalescer.push(change);
                    deadline = if coalescer.is_empty() {
                        None
                    } else {
                        Some(Instant::now() + debounce)
                    };
                }
                Some(WatchMsg::Flush) => {
                    deadline = None;
                    deliver(&mut coalescer, &callback).await;
                }
                None => break,
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                deliver(&mut coalescer, &callback).await;
            }
        }
    }
    if !coalescer.is_empty() {
        tracing::debug!(
            "[DocWatcher] stopped with {} undelivered changes",
            coalescer.len()
        );
    }
}

/// A running file watcher. Dropping it stops watching.
pub struct DocWatcher {
    watcher: Option<RecommendedWatcher>,
    shutdown: Option<oneshot::Sender<()>>,
    batcher: Option<JoinHandle<()>>,
    tx: UnboundedSender<WatchMsg>,
    paused: Arc<AtomicBool>,
    root: PathBuf,
}

impl DocWatcher {
    /// Watch `config.root` recursively for files with one of `extensions`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: &StoreConfig,
        extensions: Vec<String>,
        callback: BatchCallback,
    ) -> Result<DocWatcher, DocGraphError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| DocGraphError::Watch(format!("no tokio runtime available: {e}")))?;
        let (tx, rx) = unbounded_channel::<WatchMsg>();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let paused = Arc::new(AtomicBool::new(false));

        let filter = WatchFilter::new(config, extensions);
        let handler_tx = tx.clone();
        let handler_paused = paused.clone();
        let mut watcher = notify::recommended_watcher(
            move |result: notify::Result<notify::Event>| {
                let event = match result {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!("[DocWatcher] notify error: {}", e);
                        return;
                    }
                };
                if handler_paused.load(Ordering::Relaxed) {
                    tracing::debug!("[DocWatcher] Paused, ignoring {:?}", event.kind);
                    return;
                }
                for (path, kind) in raw_events(&event) {
                    let Some(key) = filter
                        .key_for(&path)
                        .or_else(|| filter.dir_key_for(&path, kind))
                    else {
                        continue;
                    };
                    tracing::trace!("[DocWatcher] {} {}", kind, key);
                    let change = PathChange {
                        path,
                        key,
                        event: kind,
                    };
                    // A closed channel only means the batcher already shut down.
                    let _ = handler_tx.send(WatchMsg::Change(change));
                }
            },
        )?;
        watcher.watch(&config.root, RecursiveMode::Recursive)?;
        tracing::info!("[DocWatcher] watching {:?}", config.root);

        let batcher = runtime.spawn(run_batcher(rx, shutdown_rx, config.debounce(), callback));
        Ok(DocWatcher {
            watcher: Some(watcher),
            shutdown: Some(shutdown_tx),
            batcher: Some(batcher),
            tx,
            paused,
            root: config.root.clone(),
        })
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Shared pause flag, for callers that need to suppress events around their own writes.
    pub fn pause_flag(&self) -> Arc<AtomicBool> {
        self.paused.clone()
    }

    /// Deliver the pending batch now instead of waiting out the debounce window.
    pub fn flush(&self) {
        let _ = self.tx.send(WatchMsg::Flush);
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    /// Stop the OS watch and the batcher. A callback already in flight runs to completion on its
    /// own task; pending undelivered changes are dropped. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            if let Err(e) = watcher.unwatch(&self.root) {
                tracing::debug!("[DocWatcher] unwatch {:?}: {}", self.root, e);
            }
            tracing::info!("[DocWatcher] stopped watching {:?}", self.root);
        }
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.batcher.take();
    }
}

impl Drop for DocWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
