// Client side of the HTTP control plane

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::http::{Command, CONTROL_PATH};
use super::NodeController;
use crate::config::LoadRequest;
use crate::error::IssiTesterError;

/// Node Controller reached over HTTP. Every failure, including a non-2xx
/// answer, is a `CommunicationError`; nothing is retried.
pub struct RemoteNodeController {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

impl RemoteNodeController {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, IssiTesterError> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IssiTesterError::CommunicationError {
                node: name.clone(),
                status: 0,
                body: e.to_string(),
            })?;
        Ok(Self {
            name,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn comm_error(&self, status: u16, body: impl Into<String>) -> IssiTesterError {
        IssiTesterError::CommunicationError {
            node: self.name.clone(),
            status,
            body: body.into(),
        }
    }

    async fn send(
        &self,
        command: Command,
        params: Vec<(String, String)>,
    ) -> Result<String, IssiTesterError> {
        let url = format!("{}{}", self.base_url, CONTROL_PATH);
        let mut query = vec![("command".to_string(), command.as_str().to_string())];
        query.extend(params);
        let request = if command.is_query() {
            self.client.get(&url)
        } else {
            self.client.post(&url)
        };
        debug!(node = %self.name, command = command.as_str(), "control request");
        let response = request
            .query(&query)
            .send()
            .await
            .map_err(|e| self.comm_error(0, e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.comm_error(status.as_u16(), e.to_string()))?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(self.comm_error(status.as_u16(), body))
        }
    }

    async fn send_flag(&self, command: Command) -> Result<bool, IssiTesterError> {
        let body = self.send(command, Vec::new()).await?;
        body.trim()
            .parse()
            .map_err(|_| self.comm_error(200, format!("expected true or false, got '{}'", body)))
    }
}

#[async_trait]
impl NodeController for RemoteNodeController {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load_test(&self, request: &LoadRequest) -> Result<(), IssiTesterError> {
        self.send(Command::Load, request.to_params()).await.map(|_| ())
    }

    async fn run_test(&self) -> Result<(), IssiTesterError> {
        self.send(Command::Run, Vec::new()).await.map(|_| ())
    }

    async fn is_test_completed(&self) -> Result<bool, IssiTesterError> {
        self.send_flag(Command::IsTestCompleted).await
    }

    async fn tear_down_current_test(&self) -> Result<(), IssiTesterError> {
        self.send(Command::TearDown, Vec::new()).await.map(|_| ())
    }

    async fn signal_test_completion(&self) -> Result<(), IssiTesterError> {
        self.send(Command::TestCompleted, Vec::new()).await.map(|_| ())
    }

    async fn signal_next_scenario(&self, scenario_id: &str) -> Result<(), IssiTesterError> {
        self.send(
            Command::ExecuteNextScenario,
            vec![("scenario".to_string(), scenario_id.to_string())],
        )
        .await
        .map(|_| ())
    }

    async fn get_test_results(&self) -> Result<bool, IssiTesterError> {
        self.send_flag(Command::GetTestResults).await
    }

    async fn get_error_flag(&self) -> Result<bool, IssiTesterError> {
        self.send_flag(Command::GetErrorFlag).await
    }

    async fn get_error_log(&self) -> Result<String, IssiTesterError> {
        self.send(Command::GetErrorLog, Vec::new()).await
    }

    async fn get_signaling_log(&self) -> Result<String, IssiTesterError> {
        self.send(Command::GetSipTrace, Vec::new()).await
    }

    async fn get_ptt_trace(&self) -> Result<String, IssiTesterError> {
        self.send(Command::GetPttTrace, Vec::new()).await
    }

    async fn get_status_info(&self) -> Result<String, IssiTesterError> {
        self.send(Command::GetRfssStatusInfo, Vec::new()).await
    }
}
