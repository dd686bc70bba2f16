//! Persistent demo index.

pub mod sqlite;

use anyhow::Result;

use crate::model::types::DemoMetadata;

/// What the sync pass needs from the demo index.
pub trait MetadataStore {
    /// Insert a batch of demos in one transaction, returning their ids in
    /// input order. On error nothing from the batch is committed.
    fn insert_batch(&mut self, demos: &[DemoMetadata]) -> Result<Vec<String>>;

    /// Every stored demo, newest capture time first.
    fn list_demos(&self) -> Result<Vec<DemoMetadata>>;
}
