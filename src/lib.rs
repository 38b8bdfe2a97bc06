//! # docgraph-core
//!
//! A document store engine for a folder of markdown notes. It keeps four views of the same
//! documents consistent with each other:
//!
//! 1. the source files on disk, which stay the source of truth,
//! 2. a SQLite cache of parsed nodes,
//! 3. an in-memory link graph with degree centrality,
//! 4. an in-memory vector index for similarity search.
//!
//! ## Overview
//!
//! Every document gets a stable identifier written into its YAML front matter the first time it
//! is seen, so renames keep references intact. `[[wikilinks]]` are resolved by id, title and
//! filename into graph edges. A full [`store::DocumentStore::sync`]
//! reconciles the cache with the disk; with the `service` feature a file watcher feeds
//! debounced, coalesced change batches into [`store::DocumentStore::sync_changes`].
//!
//! ## Architecture
//!
//! - **[`codec`]**: `DocCodec` trait and the markdown codec (front matter, links, tags)
//! - **[`identity`]**: stable id detection and minting
//! - **[`db`]**: SQLite cache (`DbConnection`) and its migrations
//! - **[`resolver`]**: link target resolution and ambiguity reporting
//! - **[`graph`]**: petgraph-backed link graph, neighbors, paths, hubs, centrality
//! - **[`vector`]**: embeddings, distance metrics and nearest-neighbor search
//! - **[`sync`]**: full and incremental synchronization, rename detection
//! - **[`store`]**: the public facade tying everything together
//! - **`watch`**: debounced file watching (feature `service`)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docgraph_core::{config::StoreConfig, query::TagMode, store::DocumentStore};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut store = DocumentStore::open(StoreConfig::load("./vault")?).await?;
//!     store.sync().await?;
//!
//!     for node in store.search_by_tags(&["project".to_string()], TagMode::All).await? {
//!         println!("{}: {} -> {:?}", node.id, node.title, node.outgoing_links);
//!     }
//!
//!     store.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ### Watching a vault
//!
//! ```rust,no_run
//! # #[cfg(feature = "service")]
//! # async fn watch() -> Result<(), docgraph_core::DocGraphError> {
//! use docgraph_core::{config::StoreConfig, store::DocumentStore};
//!
//! let shared = DocumentStore::open(StoreConfig::new("./vault")).await?.into_shared();
//! shared.lock().await.sync().await?;
//! DocumentStore::watch_and_sync(&shared).await?;
//! // ... edits under ./vault now reach the cache after the debounce window.
//! shared.lock().await.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod graph;
pub mod identity;
pub mod paths;
pub mod properties;
pub mod query;
pub mod resolver;
pub mod store;
pub mod sync;
pub mod vector;

#[cfg(feature = "service")]
pub mod watch;

pub use error::*;
pub use properties::{Node, NodeId};
pub use store::{DocumentStore, NewNode, NodeUpdate, SharedStore};
