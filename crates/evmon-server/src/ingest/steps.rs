//! Pipeline steps and the name based step registry

use async_trait::async_trait;
use evmon_common::types::{EventLogFile, EventRecord, RawEventRecord};
use evmon_common::CommonError;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::coercion::CoercionError;
use crate::db::DbError;
use crate::sfdc::SfdcError;

#[derive(Error, Debug)]
pub enum StepError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] SfdcError),

    #[error("Extraction failed: {0}")]
    Extract(#[from] csv::Error),

    #[error("Transform failed: {0}")]
    Coercion(#[from] CoercionError),

    #[error("Load failed: {0}")]
    Load(#[from] DbError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid descriptor: {0}")]
    Descriptor(#[from] CommonError),

    #[error("Invalid path template '{0}'")]
    Template(String),

    #[error("Step '{step}' expected {expected} input but received {found}")]
    UnexpectedInput {
        step: String,
        expected: &'static str,
        found: &'static str,
    },
}

impl StepError {
    pub fn unexpected_input(step: &str, expected: &'static str, found: &StepData) -> Self {
        Self::UnexpectedInput {
            step: step.to_string(),
            expected,
            found: found.kind(),
        }
    }
}

/// Value threaded from one step to the next
#[derive(Debug, Clone)]
pub enum StepData {
    /// Nothing produced yet; the input of the leading fetch step
    Descriptor,
    /// Raw log file content
    Raw(String),
    /// Extracted rows
    Rows(Vec<RawEventRecord>),
    /// Typed rows
    Records(Vec<EventRecord>),
}

impl StepData {
    pub fn kind(&self) -> &'static str {
        match self {
            StepData::Descriptor => "descriptor",
            StepData::Raw(_) => "raw",
            StepData::Rows(_) => "rows",
            StepData::Records(_) => "records",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepCategory {
    Extractor,
    Transformer,
    Loader,
}

impl StepCategory {
    /// Execution order after the fetch step
    pub const ORDER: [StepCategory; 3] = [
        StepCategory::Extractor,
        StepCategory::Transformer,
        StepCategory::Loader,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepCategory::Extractor => "extractor",
            StepCategory::Transformer => "transformer",
            StepCategory::Loader => "loader",
        }
    }
}

impl fmt::Display for StepCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of extract, transform or load work
#[async_trait]
pub trait PipelineStep: Send + Sync {
    fn name(&self) -> &str;

    /// Produce the next value from the previous one, with the descriptor for context
    async fn run(&self, file: &EventLogFile, input: StepData) -> Result<StepData, StepError>;
}

/// Lookup table from configured step names to implementations
#[derive(Default, Clone)]
pub struct StepRegistry {
    steps: HashMap<StepCategory, HashMap<String, Arc<dyn PipelineStep>>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        category: StepCategory,
        name: impl Into<String>,
        step: Arc<dyn PipelineStep>,
    ) -> &mut Self {
        self.steps.entry(category).or_default().insert(name.into(), step);
        self
    }

    pub fn get(&self, category: StepCategory, name: &str) -> Option<Arc<dyn PipelineStep>> {
        self.steps.get(&category).and_then(|steps| steps.get(name)).cloned()
    }

    /// Resolve `names` in order, skipping and reporting the ones not registered
    pub fn resolve(&self, category: StepCategory, names: &[String]) -> Vec<Arc<dyn PipelineStep>> {
        names
            .iter()
            .filter_map(|name| {
                let step = self.get(category, name);
                if step.is_none() {
                    tracing::warn!(
                        category = %category,
                        step = %name,
                        "Unknown pipeline step, skipping"
                    );
                }
                step
            })
            .collect()
    }
}
