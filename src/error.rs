use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("missing Authorization header")]
    AuthMissing,
    #[error("invalid Authorization header format")]
    AuthMalformed,
    #[error("invalid API key")]
    AuthUnknownKey,
    #[error("API key is revoked")]
    AuthRevoked,
    #[error("budget blocked: {reason}")]
    BudgetBlocked { reason: String },
    #[error("budget throttled: {reason}")]
    BudgetThrottled { reason: String },
    #[error("rate limit exceeded for {scope}")]
    RateLimited { scope: String },
    #[error("kill switch active: {reason}")]
    Killswitch { reason: String },
    #[error("loop detected: {reason}")]
    LoopDetected { reason: String },
    #[error("no models match the route constraints")]
    NoCapableModel,
    #[error("no allowed models are available")]
    NoAllowedModel,
    #[error("provider error {status}: {body}")]
    ProviderHttp { status: u16, body: String },
    #[error("provider timeout: {0}")]
    ProviderTimeout(String),
    #[error("provider connection failed: {0}")]
    ProviderConnect(String),
    #[error("all candidate models failed")]
    ChainExhausted,
    #[error("output does not match the required schema: {}", errors.join("; "))]
    SchemaInvalid { errors: Vec<String> },
    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
    #[error("secret unseal failed: {0}")]
    UnsealFailed(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
}

impl GatewayError {
    /// HTTP status the error surfaces as on the client-facing edge.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::NoCapableModel | Self::NoAllowedModel => {
                StatusCode::BAD_REQUEST
            }
            Self::AuthMissing | Self::AuthMalformed | Self::AuthUnknownKey | Self::AuthRevoked => {
                StatusCode::UNAUTHORIZED
            }
            Self::BudgetBlocked { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::BudgetThrottled { .. }
            | Self::RateLimited { .. }
            | Self::Killswitch { .. }
            | Self::LoopDetected { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ProviderHttp { .. }
            | Self::ProviderConnect(_)
            | Self::ChainExhausted
            | Self::SchemaInvalid { .. }
            | Self::InvalidResponse(_) => StatusCode::BAD_GATEWAY,
            Self::ProviderTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            Self::UnsealFailed(_)
            | Self::Persistence(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OpenAI-style error `type` field.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) | Self::NoCapableModel | Self::NoAllowedModel => {
                "invalid_request"
            }
            Self::AuthMissing | Self::AuthMalformed | Self::AuthUnknownKey | Self::AuthRevoked => {
                "unauthorized"
            }
            Self::BudgetBlocked { .. } => "forbidden_budget",
            Self::BudgetThrottled { .. } | Self::RateLimited { .. } | Self::LoopDetected { .. } => {
                "rate_limited"
            }
            Self::Killswitch { .. } => "killswitch",
            Self::ProviderHttp { .. }
            | Self::ProviderTimeout(_)
            | Self::ProviderConnect(_)
            | Self::ChainExhausted
            | Self::SchemaInvalid { .. }
            | Self::InvalidResponse(_) => "provider_error",
            Self::NotImplemented(_) => "not_implemented",
            Self::UnsealFailed(_)
            | Self::Persistence(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Internal(_) => "internal_error",
        }
    }

    /// Machine-readable code, where one exists.
    pub fn code(&self) -> Option<String> {
        match self {
            Self::AuthMissing => Some("auth.missing".to_string()),
            Self::AuthMalformed => Some("auth.malformed".to_string()),
            Self::AuthUnknownKey => Some("auth.invalid_key".to_string()),
            Self::AuthRevoked => Some("auth.revoked".to_string()),
            Self::BudgetBlocked { .. } => Some("budget_blocked".to_string()),
            Self::BudgetThrottled { .. } => Some("budget_throttled".to_string()),
            Self::RateLimited { .. } => Some("rate_limited".to_string()),
            Self::Killswitch { .. } => Some("killswitch".to_string()),
            Self::LoopDetected { .. } => Some("loop_detected".to_string()),
            Self::NoCapableModel => Some("router.no_capable_model".to_string()),
            Self::NoAllowedModel => Some("router.no_allowed_model".to_string()),
            Self::ProviderHttp { status, .. } => Some(format!("provider.http_{status}")),
            Self::ProviderTimeout(_) => Some("provider_timeout".to_string()),
            Self::ProviderConnect(_) => Some("provider_connect".to_string()),
            Self::ChainExhausted => Some("chain_exhausted".to_string()),
            Self::SchemaInvalid { .. } => Some("schema_invalid".to_string()),
            Self::UnsealFailed(_) => Some("secret.unseal_failed".to_string()),
            _ => None,
        }
    }

    /// Transient provider failures advance the fallback loop; everything else
    /// surfaces immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ProviderHttp { status, .. } => *status >= 500 || *status == 429,
            Self::ProviderTimeout(_) | Self::ProviderConnect(_) => true,
            _ => false,
        }
    }

    /// Label recorded as `fallback_reason` when this error advances the chain.
    pub fn fallback_reason(&self) -> Option<&'static str> {
        match self {
            Self::ProviderHttp { status, .. } if *status >= 500 => Some("provider_5xx"),
            Self::ProviderHttp { status: 429, .. } => Some("provider_429"),
            Self::ProviderTimeout(_) => Some("provider_timeout"),
            Self::ProviderConnect(_) => Some("provider_connect"),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
