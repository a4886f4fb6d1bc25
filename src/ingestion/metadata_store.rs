//! Offset & version metadata store (read-through / write-through).
//!
//! Wraps the storage engine's metadata partition with typed accessors for
//! the two persisted records: per-partition [`OffsetRecord`]s and the
//! per-version [`StoreVersionState`].
//!
//! The store version state gets a single-entry cache: reads are lock-free
//! through an `RwLock<Option<Arc<..>>>` snapshot, writers are serialized by a
//! refresh mutex so two racing mutators cannot interleave read-modify-write
//! cycles. Offset records are not cached here; each partition's consumption
//! state owns its in-memory copy and this store is only touched on subscribe,
//! sync, and drop.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::Result;
use crate::ingestion::offsets::{
    OffsetRecord, STORE_VERSION_STATE_KEY, StoreVersionState, offset_record_key,
};
use crate::ingestion::traits::StorageEngine;

/// Typed facade over the metadata partition.
pub struct MetadataStore {
    storage: Arc<dyn StorageEngine>,
    /// Version topic this store serves; used only for log context.
    version_topic: String,
    cached_version_state: RwLock<Option<Arc<StoreVersionState>>>,
    /// Serializes read-modify-write cycles on the version state.
    refresh_lock: Mutex<()>,
}

impl MetadataStore {
    pub fn new(storage: Arc<dyn StorageEngine>, version_topic: impl Into<String>) -> Self {
        Self {
            storage,
            version_topic: version_topic.into(),
            cached_version_state: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    // ========================================================================
    // Offset records
    // ========================================================================

    /// Load a partition's checkpoint, or a fresh record when none persisted.
    pub async fn load_offset_record(&self, partition: u32) -> Result<OffsetRecord> {
        let key = offset_record_key(partition);
        match self.storage.get_metadata(&key).await? {
            Some(bytes) => {
                let record = OffsetRecord::from_bytes(&bytes)?;
                info!(
                    topic = %self.version_topic,
                    partition,
                    checkpoint = %record.to_simplified_string(),
                    "Restored offset record"
                );
                Ok(record)
            }
            None => {
                debug!(topic = %self.version_topic, partition, "No offset record; starting fresh");
                Ok(OffsetRecord::new())
            }
        }
    }

    /// Write a partition's checkpoint through to the metadata partition.
    pub async fn persist_offset_record(&self, partition: u32, record: &OffsetRecord) -> Result<()> {
        let key = offset_record_key(partition);
        self.storage.put_metadata(&key, &record.to_bytes()?).await
    }

    /// Remove a partition's checkpoint (partition drop).
    pub async fn clear_offset_record(&self, partition: u32) -> Result<()> {
        self.storage
            .delete_metadata(&offset_record_key(partition))
            .await
    }

    // ========================================================================
    // Store version state
    // ========================================================================

    /// Current store version state, read through the single-entry cache.
    pub async fn store_version_state(&self) -> Result<Option<Arc<StoreVersionState>>> {
        if let Some(cached) = self.cached_version_state.read().await.clone() {
            return Ok(Some(cached));
        }
        let _guard = self.refresh_lock.lock().await;
        // A racing refresher may have filled the cache while we waited.
        if let Some(cached) = self.cached_version_state.read().await.clone() {
            return Ok(Some(cached));
        }
        match self.storage.get_metadata(STORE_VERSION_STATE_KEY).await? {
            Some(bytes) => {
                let state = Arc::new(StoreVersionState::from_bytes(&bytes)?);
                *self.cached_version_state.write().await = Some(state.clone());
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Write the store version state through and refresh the cache.
    pub async fn put_store_version_state(&self, state: StoreVersionState) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        self.storage
            .put_metadata(STORE_VERSION_STATE_KEY, &state.to_bytes()?)
            .await?;
        *self.cached_version_state.write().await = Some(Arc::new(state));
        Ok(())
    }

    /// Apply a mutation to the store version state, creating it first via
    /// `init` when absent, and persist the result.
    pub async fn update_store_version_state<F>(
        &self,
        init: Option<StoreVersionState>,
        mutate: F,
    ) -> Result<Arc<StoreVersionState>>
    where
        F: FnOnce(&mut StoreVersionState),
    {
        let _guard = self.refresh_lock.lock().await;
        let mut state = match self.storage.get_metadata(STORE_VERSION_STATE_KEY).await? {
            Some(bytes) => StoreVersionState::from_bytes(&bytes)?,
            None => match init {
                Some(state) => state,
                None => {
                    return Err(crate::error::IngestionError::Storage(format!(
                        "store version state missing for {}",
                        self.version_topic
                    )));
                }
            },
        };
        mutate(&mut state);
        self.storage
            .put_metadata(STORE_VERSION_STATE_KEY, &state.to_bytes()?)
            .await?;
        let state = Arc::new(state);
        *self.cached_version_state.write().await = Some(state.clone());
        Ok(state)
    }

    /// Drop the store version state (version retirement).
    pub async fn clear_store_version_state(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        self.storage
            .delete_metadata(STORE_VERSION_STATE_KEY)
            .await?;
        *self.cached_version_state.write().await = None;
        Ok(())
    }
}
