//! Transformation steps

use async_trait::async_trait;
use evmon_common::types::EventLogFile;

use super::coercion::coerce_records;
use super::steps::{PipelineStep, StepData, StepError};

/// Converts extracted rows to typed records using the descriptor's field types
pub struct TypeMapTransformer;

impl TypeMapTransformer {
    pub const NAME: &'static str = "typeMap";
}

#[async_trait]
impl PipelineStep for TypeMapTransformer {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self, file: &EventLogFile, input: StepData) -> Result<StepData, StepError> {
        let rows = match input {
            StepData::Rows(rows) => rows,
            other => return Err(StepError::unexpected_input(Self::NAME, "rows", &other)),
        };

        Ok(StepData::Records(coerce_records(file, rows)?))
    }
}
