use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::ApiClient;
use crate::client::transport::Transport;
use crate::error::{StatusError, require_id};

/// Outcome of one mashup test run on the flow backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestExecution {
    pub computation_group_id: String,
    #[serde(default)]
    pub results: Value,
}

pub struct MashupService<'a, T> {
    client: &'a ApiClient<T>,
}

impl<'a, T: Transport> MashupService<'a, T> {
    pub fn new(client: &'a ApiClient<T>) -> Self {
        Self { client }
    }

    pub fn test_path(mashup_id: &str) -> String {
        format!("/mashups/{mashup_id}/test")
    }

    /// Run a mashup against `input` and return its computation group.
    pub async fn execute_test(
        &self,
        mashup_id: &str,
        input: &Value,
    ) -> Result<TestExecution, StatusError> {
        require_id("mashup id", mashup_id)?;
        let path = Self::test_path(mashup_id);
        let execution: TestExecution = self.client.post_json(&path, input).await?;
        tracing::debug!(
            mashup_id,
            computation_group_id = %execution.computation_group_id,
            "mashup test executed"
        );
        Ok(execution)
    }
}
