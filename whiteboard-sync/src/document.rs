//! The canonical stroke sequence and its single-writer guard.
//!
//! `Document` is the plain ordered list. `DocumentStore` owns the only
//! instance behind one async mutex; every mutation and every snapshot goes
//! through that lock, so a reader never observes a half-applied change.

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::protocol::Stroke;

/// Document errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("Document is full ({limit} strokes)")]
    CapacityExceeded { limit: usize },
}

/// Ordered, append/undo/clear-mutable stroke list.
#[derive(Debug, Default)]
pub struct Document {
    strokes: Vec<Stroke>,
    /// Optional safety valve; `None` = unbounded
    max_strokes: Option<usize>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_strokes: Option<usize>) -> Self {
        Self {
            strokes: Vec::new(),
            max_strokes,
        }
    }

    /// Append a stroke, returning its index.
    pub fn append(&mut self, stroke: Stroke) -> Result<usize, DocumentError> {
        if let Some(limit) = self.max_strokes {
            if self.strokes.len() >= limit {
                return Err(DocumentError::CapacityExceeded { limit });
            }
        }
        self.strokes.push(stroke);
        Ok(self.strokes.len() - 1)
    }

    /// Remove the last stroke. `None` on an empty board is not an error.
    pub fn pop_last(&mut self) -> Option<Stroke> {
        self.strokes.pop()
    }

    /// Drop every stroke, returning how many were removed.
    pub fn clear(&mut self) -> usize {
        let removed = self.strokes.len();
        self.strokes.clear();
        removed
    }

    pub fn snapshot(&self) -> Vec<Stroke> {
        self.strokes.clone()
    }

    pub fn strokes(&self) -> &[Stroke] {
        &self.strokes
    }

    pub fn len(&self) -> usize {
        self.strokes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strokes.is_empty()
    }

    pub fn max_strokes(&self) -> Option<usize> {
        self.max_strokes
    }
}

/// Single authority over the process-wide [`Document`].
pub struct DocumentStore {
    inner: Mutex<Document>,
}

impl DocumentStore {
    pub fn new(max_strokes: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Document::with_limit(max_strokes)),
        }
    }

    /// Hold the document exclusively.
    ///
    /// Callers that must publish the result of a mutation keep the guard
    /// until the outbound frames are queued.
    pub async fn lock(&self) -> MutexGuard<'_, Document> {
        self.inner.lock().await
    }

    pub async fn append(&self, stroke: Stroke) -> Result<usize, DocumentError> {
        self.inner.lock().await.append(stroke)
    }

    pub async fn pop_last(&self) -> Option<Stroke> {
        self.inner.lock().await.pop_last()
    }

    pub async fn clear(&self) -> usize {
        self.inner.lock().await.clear()
    }

    pub async fn snapshot(&self) -> Vec<Stroke> {
        self.inner.lock().await.snapshot()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new(None)
    }
}
