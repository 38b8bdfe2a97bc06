//! Vector similarity index.
//!
//! An in-memory projection of the `embeddings` table. Writes go to the cache first and are then
//! mirrored here by the store. Search is brute force: every stored vector is scored against the
//! query, which is fine for a single vault but grows linearly with it.

use futures_core::future::BoxFuture;
use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use crate::{
    error::DocGraphError,
    properties::{EmbeddingRecord, NodeId},
};

/// Turns text into a fixed-dimension vector.
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;

    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Result<Vec<f32>, DocGraphError>>;
}

pub trait DistanceMetric: Send + Sync + Debug {
    /// Smaller is closer. `a` and `b` always have equal length.
    fn distance(&self, a: &[f32], b: &[f32]) -> f32;
}

/// `1 - cosine similarity`, in `[0, 2]`. A zero-magnitude operand is maximally distant.
#[derive(Debug, Default, Clone, Copy)]
pub struct CosineDistance;

impl DistanceMetric for CosineDistance {
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        let mut dot = 0f64;
        let mut norm_a = 0f64;
        let mut norm_b = 0f64;
        for (x, y) in a.iter().zip(b.iter()) {
            let (x, y) = (*x as f64, *y as f64);
            dot += x * y;
            norm_a += x * x;
            norm_b += y * y;
        }
        if norm_a == 0.0 || norm_b == 0.0 {
            return 2.0;
        }
        let similarity = (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0);
        (1.0 - similarity) as f32
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub node_id: NodeId,
    pub distance: f32,
}

pub fn validate_vector(vector: &[f32]) -> Result<(), DocGraphError> {
    if vector.is_empty() {
        return Err(DocGraphError::InvalidVector("vector is empty".to_string()));
    }
    if let Some(pos) = vector.iter().position(|c| !c.is_finite()) {
        return Err(DocGraphError::InvalidVector(format!(
            "component {pos} is not finite"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    records: BTreeMap<NodeId, EmbeddingRecord>,
    metric: Arc<dyn DistanceMetric>,
}

impl Default for VectorIndex {
    fn default() -> Self {
        VectorIndex::new(Arc::new(CosineDistance))
    }
}

impl VectorIndex {
    pub fn new(metric: Arc<dyn DistanceMetric>) -> Self {
        VectorIndex {
            records: BTreeMap::new(),
            metric,
        }
    }

    /// Replace the index contents with `records`. Records that would break the index invariants
    /// are left out; the number left out is returned.
    pub fn load<I: IntoIterator<Item = EmbeddingRecord>>(&mut self, records: I) -> usize {
        self.records.clear();
        let mut rejected = 0;
        for record in records {
            if let Err(e) = self.insert(record) {
                tracing::warn!("[VectorIndex] skipping cached embedding: {}", e);
                rejected += 1;
            }
        }
        rejected
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The dimensionality shared by every stored vector other than `except`'s.
    fn dimension_excluding(&self, except: Option<&str>) -> Option<usize> {
        self.records
            .values()
            .find(|record| Some(record.node_id.as_str()) != except)
            .map(|record| record.vector.len())
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension_excluding(None)
    }

    /// Reject vectors that are empty, non-finite, or of a different dimensionality than the
    /// vectors stored for other nodes.
    pub fn check_insert(&self, node_id: &str, vector: &[f32]) -> Result<(), DocGraphError> {
        validate_vector(vector)?;
        match self.dimension_excluding(Some(node_id)) {
            Some(expected) if expected != vector.len() => Err(DocGraphError::DimensionMismatch {
                expected,
                found: vector.len(),
            }),
            _ => Ok(()),
        }
    }

    pub fn insert(&mut self, record: EmbeddingRecord) -> Result<(), DocGraphError> {
        self.check_insert(&record.node_id, &record.vector)?;
        self.records.insert(record.node_id.clone(), record);
        Ok(())
    }

    pub fn get(&self, node_id: &str) -> Option<&EmbeddingRecord> {
        self.records.get(node_id)
    }

    pub fn remove(&mut self, node_id: &str) -> Option<EmbeddingRecord> {
        self.records.remove(node_id)
    }

    /// The `limit` stored vectors closest to `query`, nearest first.
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<VectorMatch>, DocGraphError> {
        validate_vector(query)?;
        let Some(expected) = self.dimension() else {
            return Ok(Vec::new());
        };
        if expected != query.len() {
            return Err(DocGraphError::DimensionMismatch {
                expected,
                found: query.len(),
            });
        }

        let mut scored = self
            .records
            .values()
            .map(|record| VectorMatch {
                node_id: record.node_id.clone(),
                distance: self.metric.distance(query, &record.vector),
            })
            .collect::<Vec<_>>();
        scored.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        scored.truncate(limit);
        Ok(scored)
    }
}
