//! Source-unit parsing.
//!
//! A [`DocCodec`] turns the raw bytes of one source unit into a [`ParsedDocument`] and back. The
//! [`CodecMap`] dispatches on file extension; the synchronization engine only ever talks to a
//! codec through it.
//!
//! ## Built-in Codecs
//!
//! - **Markdown** (`.md` by default, any configured extension) - via [`md::MdCodec`]
//!
//! Register custom codecs via [`CodecMap::register`]. Registration is all-or-nothing: if any
//! extension in the request is malformed, none of them are registered.
//!
//! ```rust
//! use docgraph_core::{codec::{CodecMap, md::MdCodec}};
//! use std::sync::Arc;
//!
//! let codecs = CodecMap::default();
//! codecs.register(&["mdx", "txt"], Arc::new(MdCodec::new())).unwrap();
//! assert!(codecs.get("TXT").is_some());
//! ```

use parking_lot::RwLock;
use std::{collections::BTreeMap, result::Result, sync::Arc};

use crate::{
    error::DocGraphError,
    paths::{extension_of, is_extension},
    properties::Properties,
};

pub mod md;

/// The transient result of parsing one source unit. Never persisted as-is.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedDocument {
    /// Declared identity, exactly as written in the header.
    pub id: Option<String>,
    pub title: Option<String>,
    pub tags: Vec<String>,
    pub properties: Properties,
    /// Body text, header stripped.
    pub content: String,
    /// Link targets as written, deduplicated in first-seen order.
    pub raw_links: Vec<String>,
}

pub trait DocCodec: Send + Sync {
    /// Must not fail: a malformed header degrades to "no header, whole input is content".
    fn parse(&self, bytes: &[u8]) -> ParsedDocument;

    /// Render a document back into source form. The identity field is always written first.
    fn serialize(&self, doc: &ParsedDocument) -> Result<String, DocGraphError>;
}

/// Extension -> codec dispatch table.
#[derive(Clone, Default)]
pub struct CodecMap(Arc<RwLock<BTreeMap<String, Arc<dyn DocCodec>>>>);

impl CodecMap {
    /// A map with the markdown codec registered for each of `extensions`.
    pub fn create<S: AsRef<str>>(extensions: &[S]) -> Result<Self, DocGraphError> {
        let codecs = CodecMap::default();
        let md: Arc<dyn DocCodec> = Arc::new(md::MdCodec::new());
        codecs.register(extensions, md)?;
        Ok(codecs)
    }

    /// Register `codec` for every extension in `extensions`, replacing previous registrations.
    ///
    /// The whole request is validated before the table is touched.
    pub fn register<S: AsRef<str>>(
        &self,
        extensions: &[S],
        codec: Arc<dyn DocCodec>,
    ) -> Result<(), DocGraphError> {
        if extensions.is_empty() {
            return Err(DocGraphError::Codec(
                "codec registration requires at least one extension".to_string(),
            ));
        }
        let mut normalized = Vec::with_capacity(extensions.len());
        for ext in extensions {
            let ext = ext.as_ref().trim_start_matches('.').to_lowercase();
            if !is_extension(&ext) {
                return Err(DocGraphError::Codec(format!(
                    "'{ext}' is not a valid document extension"
                )));
            }
            if normalized.contains(&ext) {
                return Err(DocGraphError::Codec(format!(
                    "extension '{ext}' listed twice in one registration"
                )));
            }
            normalized.push(ext);
        }

        let mut writer = self.0.write();
        for ext in normalized {
            tracing::debug!("[CodecMap] registering codec for .{ext}");
            writer.insert(ext, codec.clone());
        }
        Ok(())
    }

    pub fn get(&self, ext: &str) -> Option<Arc<dyn DocCodec>> {
        self.0.read().get(&ext.to_lowercase()).cloned()
    }

    /// The codec responsible for `path`, if its extension is registered.
    pub fn for_path(&self, path: &str) -> Option<Arc<dyn DocCodec>> {
        extension_of(path).and_then(|ext| self.get(ext))
    }

    pub fn extensions(&self) -> Vec<String> {
        self.0.read().keys().cloned().collect()
    }

    pub fn handles(&self, path: &str) -> bool {
        self.for_path(path).is_some()
    }
}
