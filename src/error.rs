//! Error types for the ladder service
//!
//! All fallible functions return `anyhow::Result`; the variants below are the
//! typed causes the service inspects to decide between rejecting a command,
//! aborting an operation and surfacing a failure loudly.

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Custom error types for specific ladder scenarios
#[derive(Debug, thiserror::Error)]
pub enum LadderError {
    // Validation: the command is rejected with a reason, never fatal.
    #[error("Invalid platform: {platform}")]
    InvalidPlatform { platform: String },

    #[error("Player {player_id} is not registered on {platform}")]
    NotRegistered { player_id: String, platform: String },

    #[error("Player {player_id} is already registered on {platform}")]
    AlreadyRegistered { player_id: String, platform: String },

    #[error("Player {player_id} is already queued on {platform}")]
    AlreadyQueued { player_id: String, platform: String },

    #[error("Player {player_id} is not queued on {platform}")]
    NotQueued { player_id: String, platform: String },

    #[error("Player {player_id} already has an active match")]
    AlreadyInMatch { player_id: String },

    #[error("Player {player_id} has no active match")]
    NotInMatch { player_id: String },

    #[error("Invalid score: {reason}")]
    InvalidScore { reason: String },

    #[error("Match {match_id} can no longer be cancelled")]
    CancelNotAllowed { match_id: String },

    #[error("Match {match_id} has no reported score to confirm")]
    NotConfirming { match_id: String },

    // Consistency: an internal invariant was violated, the operation is aborted.
    #[error("Consistency violation: {message}")]
    ConsistencyViolation { message: String },

    // External dependencies.
    #[error("Storage failure: {message}")]
    StorageFailure { message: String },

    #[error("AMQP connection failed: {message}")]
    AmqpConnectionFailed { message: String },

    #[error("Notification failed: {message}")]
    NotificationFailed { message: String },

    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    // Algorithmic: never swallowed locally.
    #[error("Rating calculation failed: {reason}")]
    RatingCalculationFailed { reason: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}

impl LadderError {
    /// True for errors caused by the caller's input, which are reported back
    /// as a rejected command instead of being treated as faults.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LadderError::InvalidPlatform { .. }
                | LadderError::NotRegistered { .. }
                | LadderError::AlreadyRegistered { .. }
                | LadderError::AlreadyQueued { .. }
                | LadderError::NotQueued { .. }
                | LadderError::AlreadyInMatch { .. }
                | LadderError::NotInMatch { .. }
                | LadderError::InvalidScore { .. }
                | LadderError::CancelNotAllowed { .. }
                | LadderError::NotConfirming { .. }
        )
    }
}

/// True when the error must stop the service instead of being retried
pub fn is_fatal(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<LadderError>(),
            Some(LadderError::RatingCalculationFailed { .. })
        )
    })
}

/// Extract the validation cause of an error chain, if there is one
pub fn as_validation(error: &anyhow::Error) -> Option<&LadderError> {
    error
        .downcast_ref::<LadderError>()
        .filter(|ladder_error| ladder_error.is_validation())
}
