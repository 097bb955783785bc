//! Error types for the gateway.

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Authentication error: {message}")]
    Auth { message: String },

    #[error("No valid token available")]
    NoValidCredential,

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("{message}")]
    Validation { message: String },

    #[error(
        "provider \"{provider}\" is not allowed for client model \"{client_model}\" (allowed: {})",
        .allowed.join(", ")
    )]
    RouteNotAllowed {
        provider: String,
        client_model: String,
        allowed: Vec<String>,
    },

    #[error("Upstream error: {message}")]
    Upstream { message: String },

    #[error("Conversion error: {message}")]
    Conversion { message: String },

    #[error("Streaming unsupported")]
    StreamingUnsupported,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth {
            message: msg.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream {
            message: msg.into(),
        }
    }

    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::Conversion {
            message: msg.into(),
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// HTTP status this error maps to when rendered for a client.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Auth { .. } | Self::AccountNotFound(_) | Self::NoValidCredential => 401,
            Self::Validation { .. } => 400,
            Self::RouteNotAllowed { .. } => 422,
            Self::Upstream { .. } | Self::Http(_) => 502,
            Self::Conversion { .. }
            | Self::StreamingUnsupported
            | Self::Config { .. }
            | Self::Io(_)
            | Self::Json(_)
            | Self::Toml(_)
            | Self::Other(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_not_allowed_message() {
        let err = GatewayError::RouteNotAllowed {
            provider: "codex".to_string(),
            client_model: "claude-x".to_string(),
            allowed: vec!["google".to_string(), "openrouter".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "provider \"codex\" is not allowed for client model \"claude-x\" (allowed: google, openrouter)"
        );
        assert_eq!(err.status_code(), 422);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(GatewayError::auth("x").status_code(), 401);
        assert_eq!(GatewayError::AccountNotFound("a".into()).status_code(), 401);
        assert_eq!(GatewayError::NoValidCredential.status_code(), 401);
        assert_eq!(GatewayError::validation("bad").status_code(), 400);
        assert_eq!(GatewayError::upstream("down").status_code(), 502);
        assert_eq!(GatewayError::conversion("oops").status_code(), 500);
        assert_eq!(GatewayError::StreamingUnsupported.status_code(), 500);
    }
}
