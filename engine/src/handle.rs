//! Replicated document handle - one document per sync session.

use crate::{error::Result, new_client_id, ClientId, Document, Error, MapRef, TableId, Transaction};
use std::sync::Arc;

/// Lifecycle wrapper around the [`Document`] of one session.
///
/// The handle starts empty. [`DocumentHandle::init`] creates the document
/// only when an async runtime is available; otherwise the handle stays empty
/// and every accessor returns `None` instead of failing.
#[derive(Debug, Default)]
pub struct DocumentHandle {
    doc: Option<Arc<Document>>,
}

impl DocumentHandle {
    /// Create an empty handle.
    pub fn new() -> Self {
        Self { doc: None }
    }

    /// Create the document if it does not exist yet.
    ///
    /// Returns the live document, or `None` when no runtime is available.
    pub fn init(&mut self) -> Option<Arc<Document>> {
        self.try_init().ok()
    }

    /// Like [`DocumentHandle::init`], reporting why no document exists.
    pub fn try_init(&mut self) -> Result<Arc<Document>> {
        self.init_with_client(new_client_id())
    }

    /// Like [`DocumentHandle::try_init`] with a caller-chosen client id.
    pub fn init_with_client(&mut self, client_id: ClientId) -> Result<Arc<Document>> {
        if let Some(doc) = &self.doc {
            return Ok(Arc::clone(doc));
        }
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::debug!("no async runtime, document not created");
            return Err(Error::EnvironmentUnavailable);
        }

        let doc = Arc::new(Document::new(client_id));
        tracing::debug!(client_id, "document created");
        self.doc = Some(Arc::clone(&doc));
        Ok(doc)
    }

    /// The live document, if any.
    pub fn document(&self) -> Option<&Arc<Document>> {
        self.doc.as_ref()
    }

    /// The replicated map of a table.
    pub fn map(&self, table: TableId) -> Option<MapRef> {
        self.doc.as_ref().map(|doc| doc.map(table.as_str()))
    }

    /// Run `f` as one local transaction. `None` when there is no live document.
    pub fn transact<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> R) -> Option<R> {
        self.doc.as_ref().and_then(|doc| doc.transact(f).ok())
    }

    /// Destroy the document. Idempotent.
    pub fn destroy(&mut self) {
        if let Some(doc) = self.doc.take() {
            doc.destroy();
            tracing::debug!(client_id = doc.client_id(), "document destroyed");
        }
    }
}

impl Drop for DocumentHandle {
    fn drop(&mut self) {
        self.destroy();
    }
}
