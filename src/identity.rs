//! Stable node identity.
//!
//! A node's id is the identifier declared in its header when that identifier has the stable-id
//! shape (a UUID). Otherwise the canonical source path stands in for it and the caller is told
//! to mint a fresh id and write it back. Renaming a file never changes its id, so references by
//! title or id keep working without touching any other document.

use uuid::Uuid;

use crate::{codec::ParsedDocument, error::DocGraphError, properties::NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: NodeId,
    /// True when `id` is only the source location and a stable id should be minted.
    pub needs_mint: bool,
}

pub fn is_stable_id(candidate: &str) -> bool {
    Uuid::try_parse(candidate).is_ok()
}

/// A time-ordered (v6) UUID with a random node part, lower-case hyphenated.
pub fn mint_id() -> Result<NodeId, DocGraphError> {
    let mut node = [0u8; 6];
    getrandom::getrandom(&mut node)?;
    Ok(Uuid::now_v6(&node)
        .hyphenated()
        .encode_lower(&mut Uuid::encode_buffer())
        .to_string())
}

/// Canonicalize a declared id: any UUID spelling becomes lower-case hyphenated.
pub fn canonical_id(candidate: &str) -> Option<NodeId> {
    Uuid::try_parse(candidate.trim())
        .ok()
        .map(|uuid| uuid.hyphenated().to_string())
}

pub fn resolve_identity(parsed: &ParsedDocument, canonical_path: &str) -> Identity {
    match parsed.id.as_deref().and_then(canonical_id) {
        Some(id) => Identity {
            id,
            needs_mint: false,
        },
        None => {
            if let Some(declared) = &parsed.id {
                tracing::debug!(
                    "[identity] declared id '{}' at {} is not a stable id",
                    declared,
                    canonical_path
                );
            }
            Identity {
                id: canonical_path.to_string(),
                needs_mint: true,
            }
        }
    }
}
