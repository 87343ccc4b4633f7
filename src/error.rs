#[derive(Debug, thiserror::Error)]
pub enum IssiTesterError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Duplicate scenario id: {0}")]
    DuplicateScenario(String),
    #[error("Scenario {0} specifies both cancel-after and terminate-after")]
    ConflictingCallTimers(String),
    #[error("Scenario {scenario} depends on unknown precondition {precondition}")]
    UnknownPrecondition { scenario: String, precondition: String },
    #[error("Scenario {0} has preconditions but is not time triggered")]
    NonTimeDependentTrigger(String),
    #[error("Dependency cycle through scenario {0}")]
    DependencyCycle(String),
    #[error("Unknown actor: {0}")]
    UnknownActor(String),
    #[error("Unknown node: {0}")]
    UnknownNode(String),
    #[error("Unknown group: {0}")]
    UnknownGroup(String),
    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),
    #[error("Scenarios {0} and {1} cannot be ordered: both must be time triggered")]
    IncomparableScenarios(String, String),
    #[error("Test in progress")]
    TestInProgress,
    #[error("No test loaded")]
    NoTestLoaded,
    #[error("Scenario {scenario} failed: {reason}")]
    ScenarioFailed { scenario: String, reason: String },
    #[error("Call control error: {0}")]
    CallControl(String),
    #[error("Communication error with {node} (status {status}): {body}")]
    CommunicationError {
        node: String,
        status: u16,
        body: String,
    },
    #[error("Network error: {0}")]
    NetworkError(#[from] std::io::Error),
    #[error("SIP parse error: {0}")]
    ParseError(String),
}

impl IssiTesterError {
    /// True for faults of the control plane or transport, as opposed to
    /// configuration problems or protocol test failures.
    pub fn is_communication_error(&self) -> bool {
        matches!(
            self,
            IssiTesterError::CommunicationError { .. } | IssiTesterError::NetworkError(_)
        )
    }

    /// True for errors that abort a script at load time.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            IssiTesterError::ConfigError(_)
                | IssiTesterError::DuplicateScenario(_)
                | IssiTesterError::ConflictingCallTimers(_)
                | IssiTesterError::UnknownPrecondition { .. }
                | IssiTesterError::NonTimeDependentTrigger(_)
                | IssiTesterError::DependencyCycle(_)
                | IssiTesterError::UnknownActor(_)
                | IssiTesterError::UnknownNode(_)
                | IssiTesterError::UnknownGroup(_)
        )
    }
}
