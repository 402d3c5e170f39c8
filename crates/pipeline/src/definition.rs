//! Pipeline definitions and the store seam they are read from.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vantage_core::error::CoreError;
use vantage_core::quality::QualityRule;
use vantage_core::transform::TransformStep;
use vantage_core::types::EntityId;

use crate::sink::WriteMode;
use crate::source::SourceSpec;

/// Hard ceiling applied when a definition declares no row limit.
pub const DEFAULT_ROW_LIMIT: u64 = 100_000;

/// Everything the executor needs to run one pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDefinition {
    pub pipeline_id: EntityId,
    pub name: String,
    pub source: SourceSpec,
    #[serde(default)]
    pub steps: Vec<TransformStep>,
    #[serde(default)]
    pub rules: Vec<QualityRule>,
    pub mode: WriteMode,
    /// Maximum rows extracted; `None` falls back to the executor's
    /// configured default.
    #[serde(default)]
    pub row_limit: Option<u64>,
    /// Row-level cast failures skip the row instead of aborting.
    #[serde(default)]
    pub lenient_casts: bool,
}

impl PipelineDefinition {
    pub fn new(pipeline_id: EntityId, name: impl Into<String>) -> Self {
        Self {
            pipeline_id,
            name: name.into(),
            source: SourceSpec::default(),
            steps: Vec::new(),
            rules: Vec::new(),
            mode: WriteMode::Append,
            row_limit: None,
            lenient_casts: false,
        }
    }

    pub fn effective_row_limit(&self, default: u64) -> u64 {
        self.row_limit.unwrap_or(default)
    }
}

/// Where the executor reads definitions from.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn get(&self, pipeline_id: EntityId) -> Result<PipelineDefinition, CoreError>;
}

/// Definition store backed by a HashMap.
#[derive(Default)]
pub struct MemoryPipelineStore {
    definitions: RwLock<HashMap<EntityId, PipelineDefinition>>,
}

impl MemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, definition: PipelineDefinition) {
        self.definitions
            .write()
            .expect("store lock poisoned")
            .insert(definition.pipeline_id, definition);
    }
}

#[async_trait]
impl PipelineStore for MemoryPipelineStore {
    async fn get(&self, pipeline_id: EntityId) -> Result<PipelineDefinition, CoreError> {
        self.definitions
            .read()
            .expect("store lock poisoned")
            .get(&pipeline_id)
            .cloned()
            .ok_or(CoreError::NotFound {
                entity: "pipeline",
                id: pipeline_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_returns_not_found_for_unknown_pipeline() {
        let store = MemoryPipelineStore::new();
        let err = store.get(uuid::Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { entity: "pipeline", .. }));
    }

    #[tokio::test]
    async fn store_roundtrips_definitions() {
        let store = MemoryPipelineStore::new();
        let id = uuid::Uuid::now_v7();
        store.insert(PipelineDefinition::new(id, "daily sales"));
        let def = store.get(id).await.unwrap();
        assert_eq!(def.name, "daily sales");
        assert_eq!(def.effective_row_limit(DEFAULT_ROW_LIMIT), DEFAULT_ROW_LIMIT);
    }

    #[test]
    fn declared_row_limit_beats_the_default() {
        let mut def = PipelineDefinition::new(uuid::Uuid::now_v7(), "p");
        def.row_limit = Some(50);
        assert_eq!(def.effective_row_limit(DEFAULT_ROW_LIMIT), 50);
    }
}
