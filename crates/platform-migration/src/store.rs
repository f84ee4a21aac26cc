//! Resource store boundary
//!
//! The engine reads and writes platform documents through [`ResourceStore`].
//! Writes use compare-and-swap on `resource_version`: an update carrying a
//! stale version fails with [`StoreError::Conflict`].

use crate::error::StoreError;
use crate::types::{Document, ResourceRef};
use async_trait::async_trait;
use dashmap::DashMap;

/// Cluster resource store
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch the current document
    async fn get(&self, resource: &ResourceRef) -> Result<Document, StoreError>;

    /// Write a document previously read from the store
    ///
    /// Returns the stored document with its new resource version.
    ///
    /// # Errors
    /// `StoreError::Conflict` when the document changed since it was read.
    async fn update(&self, document: Document) -> Result<Document, StoreError>;
}

/// In-memory store with optimistic concurrency
#[derive(Debug, Default)]
pub struct InMemoryResourceStore {
    documents: DashMap<ResourceRef, Document>,
}

impl InMemoryResourceStore {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create store seeded with documents
    #[must_use]
    pub fn with_documents(documents: impl IntoIterator<Item = Document>) -> Self {
        let store = Self::new();
        for document in documents {
            store.insert(document);
        }
        store
    }

    /// Insert or replace a document, bumping its resource version
    pub fn insert(&self, mut document: Document) -> Document {
        let next = self
            .documents
            .get(&document.reference)
            .map_or(1, |existing| existing.resource_version + 1);
        document.resource_version = next;
        self.documents
            .insert(document.reference.clone(), document.clone());
        document
    }

    /// Read without going through the async boundary
    #[must_use]
    pub fn snapshot(&self, resource: &ResourceRef) -> Option<Document> {
        self.documents.get(resource).map(|d| d.clone())
    }

    /// All documents, sorted by coordinates
    #[must_use]
    pub fn documents(&self) -> Vec<Document> {
        let mut all: Vec<Document> = self.documents.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.reference.cmp(&b.reference));
        all
    }

    /// References in a namespace (all namespaces when `None`)
    #[must_use]
    pub fn list(&self, namespace: Option<&str>) -> Vec<ResourceRef> {
        let mut refs: Vec<ResourceRef> = self
            .documents
            .iter()
            .map(|e| e.key().clone())
            .filter(|r| namespace.map_or(true, |ns| r.namespace == ns))
            .collect();
        refs.sort();
        refs
    }

    /// Number of stored documents
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Check if store is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    async fn get(&self, resource: &ResourceRef) -> Result<Document, StoreError> {
        self.snapshot(resource)
            .ok_or_else(|| StoreError::NotFound(resource.clone()))
    }

    async fn update(&self, mut document: Document) -> Result<Document, StoreError> {
        let mut entry = self
            .documents
            .get_mut(&document.reference)
            .ok_or_else(|| StoreError::NotFound(document.reference.clone()))?;

        if entry.resource_version != document.resource_version {
            return Err(StoreError::Conflict {
                resource: document.reference.clone(),
                expected: document.resource_version,
                actual: entry.resource_version,
            });
        }

        document.resource_version += 1;
        *entry = document.clone();
        Ok(document)
    }
}
