// HTTP control plane for one node
//
// `/control?command=<name>&<key>=<value>...` accepts both GET and POST.
// Successful commands answer 200 with a text body; failures answer 4xx/5xx
// with the error text as body.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::NodeController;
use crate::config::LoadRequest;
use crate::error::IssiTesterError;

pub const CONTROL_PATH: &str = "/control";

/// Control-plane commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Load,
    Run,
    TearDown,
    GetErrorFlag,
    GetErrorLog,
    GetTestResults,
    ExecuteNextScenario,
    GetRfssStatusInfo,
    GetSipTrace,
    GetPttTrace,
    IsTestCompleted,
    TestCompleted,
}

impl Command {
    pub const ALL: [Command; 12] = [
        Command::Load,
        Command::Run,
        Command::TearDown,
        Command::GetErrorFlag,
        Command::GetErrorLog,
        Command::GetTestResults,
        Command::ExecuteNextScenario,
        Command::GetRfssStatusInfo,
        Command::GetSipTrace,
        Command::GetPttTrace,
        Command::IsTestCompleted,
        Command::TestCompleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Load => "load",
            Command::Run => "run",
            Command::TearDown => "tear-down",
            Command::GetErrorFlag => "get-error-flag",
            Command::GetErrorLog => "get-error-log",
            Command::GetTestResults => "get-test-results",
            Command::ExecuteNextScenario => "execute-next-scenario",
            Command::GetRfssStatusInfo => "get-rfss-status-info",
            Command::GetSipTrace => "get-sip-trace",
            Command::GetPttTrace => "get-ptt-trace",
            Command::IsTestCompleted => "is-test-completed",
            Command::TestCompleted => "test-completed",
        }
    }

    pub fn parse(name: &str) -> Option<Command> {
        Command::ALL.into_iter().find(|c| c.as_str() == name)
    }

    /// Commands that only read state, safe to retry over GET
    pub fn is_query(&self) -> bool {
        matches!(
            self,
            Command::GetErrorFlag
                | Command::GetErrorLog
                | Command::GetTestResults
                | Command::GetRfssStatusInfo
                | Command::GetSipTrace
                | Command::GetPttTrace
                | Command::IsTestCompleted
        )
    }
}

/// HTTP status for a controller error
pub fn status_for(error: &IssiTesterError) -> StatusCode {
    match error {
        IssiTesterError::TestInProgress | IssiTesterError::NoTestLoaded => StatusCode::CONFLICT,
        IssiTesterError::UnknownScenario(_) => StatusCode::NOT_FOUND,
        e if e.is_configuration_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(error: IssiTesterError) -> Response {
    (status_for(&error), error.to_string()).into_response()
}

fn flag(value: bool) -> String {
    value.to_string()
}

pub fn router(controller: Arc<dyn NodeController>) -> Router {
    Router::new()
        .route(CONTROL_PATH, get(control).post(control))
        .with_state(controller)
}

/// Serve the control plane on an already bound listener until the task is
/// dropped or the listener fails.
pub async fn serve(
    listener: TcpListener,
    controller: Arc<dyn NodeController>,
) -> Result<(), IssiTesterError> {
    if let Ok(addr) = listener.local_addr() {
        info!(node = %controller.name(), %addr, "control plane listening");
    }
    axum::serve(listener, router(controller)).await?;
    Ok(())
}

async fn control(
    State(controller): State<Arc<dyn NodeController>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let Some(name) = params.get("command") else {
        return (StatusCode::BAD_REQUEST, "missing command parameter").into_response();
    };
    let Some(command) = Command::parse(name) else {
        return (StatusCode::BAD_REQUEST, format!("unknown command '{}'", name)).into_response();
    };
    debug!(node = %controller.name(), command = command.as_str(), "control request");
    match execute(controller.as_ref(), command, &params).await {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => {
            warn!(node = %controller.name(), command = command.as_str(), error = %e, "control command failed");
            failure(e)
        }
    }
}

async fn execute(
    controller: &dyn NodeController,
    command: Command,
    params: &HashMap<String, String>,
) -> Result<String, IssiTesterError> {
    let ok = || "OK".to_string();
    match command {
        Command::Load => {
            let request = LoadRequest::from_params(params)?;
            controller.load_test(&request).await.map(|_| ok())
        }
        Command::Run => controller.run_test().await.map(|_| ok()),
        Command::TearDown => controller.tear_down_current_test().await.map(|_| ok()),
        Command::GetErrorFlag => controller.get_error_flag().await.map(flag),
        Command::GetErrorLog => controller.get_error_log().await,
        Command::GetTestResults => controller.get_test_results().await.map(flag),
        Command::ExecuteNextScenario => {
            let scenario = params.get("scenario").ok_or_else(|| {
                IssiTesterError::ConfigError("execute-next-scenario needs a scenario parameter".into())
            })?;
            controller.signal_next_scenario(scenario).await.map(|_| ok())
        }
        Command::GetRfssStatusInfo => controller.get_status_info().await,
        Command::GetSipTrace => controller.get_signaling_log().await,
        Command::GetPttTrace => controller.get_ptt_trace().await,
        Command::IsTestCompleted => controller.is_test_completed().await.map(flag),
        Command::TestCompleted => controller.signal_test_completion().await.map(|_| ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_names_roundtrip() {
        for command in Command::ALL {
            assert_eq!(Command::parse(command.as_str()), Some(command));
        }
        assert_eq!(Command::parse("reboot"), None);
    }

    #[test]
    fn test_query_commands() {
        assert!(Command::GetSipTrace.is_query());
        assert!(Command::IsTestCompleted.is_query());
        assert!(!Command::Load.is_query());
        assert!(!Command::ExecuteNextScenario.is_query());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&IssiTesterError::TestInProgress), StatusCode::CONFLICT);
        assert_eq!(status_for(&IssiTesterError::NoTestLoaded), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&IssiTesterError::UnknownScenario("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&IssiTesterError::DuplicateScenario("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&IssiTesterError::CallControl("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
