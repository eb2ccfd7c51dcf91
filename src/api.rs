//! Remote API collaborator: typed endpoints the sync jobs call.
//!
//! [`RemoteClient`] is the seam the job queue is constructed with; production
//! code uses [`HttpRemoteClient`] over plain HTTP, tests substitute an
//! in-process recording implementation.  Calls are blocking; the queue runs
//! them off the async workers.
//!
//! Failure classification lives on [`ApiError`]: `is_transient()` selects the
//! retry-with-backoff path, `is_resource_gone()` (404/403) triggers the
//! compensating local write instead of a retry.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// Transport-level failure: unreachable host, timeout, connection reset.
    Network(String),
    /// The server answered with a failure status code.
    Status { code: u16, description: String },
    /// The response arrived but could not be decoded.
    Malformed(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Network(e) => write!(f, "network error: {e}"),
            ApiError::Status { code, description } => {
                write!(f, "server returned {code}: {description}")
            }
            ApiError::Malformed(e) => write!(f, "malformed response: {e}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    /// Expected to resolve itself given a retry: network-class failures,
    /// server overload, and 5xx responses.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Network(_) => true,
            ApiError::Status { code, .. } => *code == 429 || (500..=599).contains(code),
            ApiError::Malformed(_) => false,
        }
    }

    /// The remote no longer considers the target valid; callers must correct
    /// local state instead of retrying.
    pub fn is_resource_gone(&self) -> bool {
        matches!(self, ApiError::Status { code: 403 | 404, .. })
    }
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantResponse {
    pub user_id: String,
    #[serde(default)]
    pub role: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircleResponse {
    pub circle_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub conversation_id: String,
    pub creator_id: String,
    /// "GROUP" or "CONTACT".
    pub category: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub announcement: Option<String>,
    #[serde(default)]
    pub participants: Vec<ParticipantResponse>,
    #[serde(default)]
    pub circles: Vec<CircleResponse>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub user_id: String,
    #[serde(default)]
    pub identity_number: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub relationship: String,
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetResponse {
    pub asset_id: String,
    pub symbol: String,
    pub name: String,
    #[serde(default)]
    pub icon_url: Option<String>,
    #[serde(default)]
    pub balance: String,
    #[serde(default)]
    pub chain_id: String,
}

// ---------------------------------------------------------------------------
// Client trait + HTTP implementation
// ---------------------------------------------------------------------------

/// The remote endpoints the sync core reconciles against.
pub trait RemoteClient: Send + Sync {
    fn get_conversation(&self, conversation_id: &str) -> Result<ConversationResponse, ApiError>;
    fn fetch_users(&self, user_ids: &[String]) -> Result<Vec<UserResponse>, ApiError>;
    fn get_asset(&self, asset_id: &str) -> Result<AssetResponse, ApiError>;
}

/// Blocking HTTP implementation of [`RemoteClient`].
pub struct HttpRemoteClient {
    base_url: String,
}

impl HttpRemoteClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = format!("{}{path}", self.base_url);
        match ureq::get(&url).call() {
            Ok(response) => response
                .into_json::<T>()
                .map_err(|e| ApiError::Malformed(e.to_string())),
            Err(ureq::Error::Status(code, response)) => Err(ApiError::Status {
                code,
                description: response.status_text().to_string(),
            }),
            Err(e) => Err(ApiError::Network(e.to_string())),
        }
    }
}

impl RemoteClient for HttpRemoteClient {
    fn get_conversation(&self, conversation_id: &str) -> Result<ConversationResponse, ApiError> {
        self.get(&format!("/conversations/{conversation_id}"))
    }

    fn fetch_users(&self, user_ids: &[String]) -> Result<Vec<UserResponse>, ApiError> {
        let url = format!("{}/users/fetch", self.base_url);
        let body = serde_json::to_value(user_ids)
            .map_err(|e| ApiError::Malformed(format!("failed to serialize user ids: {e}")))?;
        match ureq::post(&url).send_json(body) {
            Ok(response) => response
                .into_json::<Vec<UserResponse>>()
                .map_err(|e| ApiError::Malformed(e.to_string())),
            Err(ureq::Error::Status(code, response)) => Err(ApiError::Status {
                code,
                description: response.status_text().to_string(),
            }),
            Err(e) => Err(ApiError::Network(e.to_string())),
        }
    }

    fn get_asset(&self, asset_id: &str) -> Result<AssetResponse, ApiError> {
        self.get(&format!("/assets/{asset_id}"))
    }
}
