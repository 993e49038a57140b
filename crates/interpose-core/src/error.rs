//! Error types for rule mutations and coordinator requests.

use thiserror::Error;

/// Failure reported by the privileged rule channel.
///
/// Inspection failures never surface as this type from
/// [`RuleController::probe`](crate::RuleController::probe); they are logged and
/// read as "inactive".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Privileged access is unavailable (no `su`, grant refused, not root).
    #[error("privileged access denied: {0}")]
    PermissionDenied(String),

    /// The privileged session completed with a non-zero exit status.
    #[error("command failed with exit code {exit_code}: {stderr}")]
    CommandFailed {
        /// Exit status of the privileged session.
        exit_code: i32,
        /// Captured error output.
        stderr: String,
    },

    /// The rule table did not hold exactly the redirect pair after an apply.
    /// The partial set has already been rolled back.
    #[error("redirect rule set incomplete after apply (found {found} of 2 rules)")]
    IncompleteRuleSet {
        /// Number of redirect rules found when verifying.
        found: usize,
    },

    /// Talking to the privileged process itself failed.
    #[error("privileged channel error: {0}")]
    Channel(String),
}

impl CommandError {
    /// Returns a stable machine-readable name for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::PermissionDenied(_) => "permission_denied",
            CommandError::CommandFailed { .. } => "command_failed",
            CommandError::IncompleteRuleSet { .. } => "incomplete_rule_set",
            CommandError::Channel(_) => "channel_error",
        }
    }
}

/// Failure delivered to the surface awaiting a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The rule mutation failed; proxy state is unchanged.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// The requested target cannot be turned into a redirect rule.
    #[error("invalid target address: {0}")]
    InvalidTarget(String),

    /// The coordinator shut down before the request ran.
    #[error("request cancelled: coordinator is shutting down")]
    Cancelled,
}

impl RequestError {
    /// Returns a stable machine-readable name for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            RequestError::Command(e) => e.kind(),
            RequestError::InvalidTarget(_) => "invalid_target",
            RequestError::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(
            CommandError::PermissionDenied("su".into()).kind(),
            "permission_denied"
        );
        assert_eq!(
            CommandError::CommandFailed {
                exit_code: 1,
                stderr: String::new()
            }
            .kind(),
            "command_failed"
        );
        assert_eq!(RequestError::Cancelled.kind(), "cancelled");
        assert_eq!(
            RequestError::InvalidTarget("x".into()).kind(),
            "invalid_target"
        );
    }

    #[test]
    fn test_request_error_passes_command_kind_through() {
        let err: RequestError = CommandError::PermissionDenied("denied".into()).into();
        assert_eq!(err.kind(), "permission_denied");
        assert_eq!(err.to_string(), "privileged access denied: denied");
    }

    #[test]
    fn test_command_failed_display() {
        let err = CommandError::CommandFailed {
            exit_code: 2,
            stderr: "iptables: No chain/target/match by that name.".into(),
        };
        assert_eq!(
            err.to_string(),
            "command failed with exit code 2: iptables: No chain/target/match by that name."
        );
    }
}
