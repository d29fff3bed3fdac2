//! Event log ingestion
//!
//! - [`coercion`]: per-column type conversion
//! - [`steps`]: step trait and name registry
//! - [`extract`], [`transform`], [`load`]: the built-in steps
//! - [`ledger`]: which log files were already ingested
//! - [`pipeline`]: per-file step chain and batch handling
//! - [`polling`]: the recurring job that feeds the pipeline

use std::sync::Arc;

use crate::config::FlatFileConfig;
use crate::db::DocumentStore;
use crate::sfdc::EventLogApi;

pub mod coercion;
pub mod extract;
pub mod ledger;
pub mod load;
pub mod pipeline;
pub mod polling;
pub mod steps;
pub mod transform;

pub use ledger::IngestionLedger;
pub use pipeline::{BatchReport, DescriptorFailure, LogPipeline, PipelineError};
pub use polling::PollingJob;
pub use steps::{PipelineStep, StepCategory, StepData, StepError, StepRegistry};

/// Registry holding every built-in step under its configuration name
pub fn default_registry(
    api: Arc<dyn EventLogApi>,
    store: Arc<dyn DocumentStore>,
    flat_file: FlatFileConfig,
) -> StepRegistry {
    let document_store: Arc<dyn PipelineStep> = Arc::new(load::DocumentStoreLoader::new(store));

    let mut registry = StepRegistry::new();
    registry
        .register(
            StepCategory::Extractor,
            extract::CsvExtractor::NAME,
            Arc::new(extract::CsvExtractor),
        )
        .register(
            StepCategory::Transformer,
            transform::TypeMapTransformer::NAME,
            Arc::new(transform::TypeMapTransformer),
        )
        .register(
            StepCategory::Loader,
            load::DocumentStoreLoader::NAME,
            document_store.clone(),
        )
        .register(
            StepCategory::Loader,
            load::DocumentStoreLoader::ALIAS,
            document_store,
        )
        .register(
            StepCategory::Loader,
            load::FlatFileLoader::NAME,
            Arc::new(load::FlatFileLoader::new(api, flat_file)),
        );

    registry
}
