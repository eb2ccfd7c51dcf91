//! Units of synchronization work.
//!
//! A [`Job`] is a named, idempotent step that reconciles one slice of local
//! state with the remote service.  Jobs are a closed set of variants; the
//! queue's worker loop dispatches on the variant, and [`Job::id`] gives the
//! stable identity string used for deduplication: two jobs built for the
//! same logical target always share an id.
//!
//! `run` is blocking (network + disk) and returns the follow-up jobs to fan
//! out on success; the executing worker re-enqueues them.  Errors are
//! classified by the queue: only transient ones retry.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::api::{ApiError, ConversationResponse, RemoteClient, UserResponse};
use crate::events::EntityEvent;
use crate::logging;
use crate::mlog;
use crate::storage::{
    AssetRow, ConversationRow, ConversationStatus, ParticipantRow, ParticipantStatus, Storage,
    StorageError, UserRow, CATEGORY_CONTACT, CATEGORY_GROUP,
};

/// Synthetic sender of server-generated system messages; never a real
/// conversation target.
pub const SYSTEM_USER_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Profiles are fetched in batches of at most this many ids per call.
const USER_FETCH_BATCH: usize = 50;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum JobError {
    Api(ApiError),
    Storage(StorageError),
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::Api(e) => write!(f, "api error: {e}"),
            JobError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for JobError {}

impl From<ApiError> for JobError {
    fn from(e: ApiError) -> Self {
        JobError::Api(e)
    }
}

impl From<StorageError> for JobError {
    fn from(e: StorageError) -> Self {
        JobError::Storage(e)
    }
}

impl JobError {
    /// Whether the queue should retry with backoff.  Storage failures are
    /// environment/programming errors and never retry.
    pub fn is_transient(&self) -> bool {
        match self {
            JobError::Api(e) => e.is_transient(),
            JobError::Storage(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

/// Collaborators injected into every job execution.
pub struct JobContext {
    pub storage: Arc<Storage>,
    pub client: Arc<dyn RemoteClient>,
    pub events: broadcast::Sender<EntityEvent>,
    /// The local user's id; refreshing it as a conversation is meaningless.
    pub account_id: String,
}

impl JobContext {
    pub fn new(
        storage: Arc<Storage>,
        client: Arc<dyn RemoteClient>,
        events: broadcast::Sender<EntityEvent>,
        account_id: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            client,
            events,
            account_id: account_id.into(),
        }
    }

    fn publish(&self, event: EntityEvent) {
        // No subscribers is fine; events are advisory.
        let _ = self.events.send(event);
    }
}

// ---------------------------------------------------------------------------
// Job variants
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Reconcile one conversation with the server's view.
    RefreshConversation { conversation_id: String },
    /// Fetch and upsert user profiles.
    RefreshUser { user_ids: Vec<String> },
    /// Fetch and upsert one asset.
    RefreshAsset { asset_id: String },
}

impl Job {
    /// Stable identity string, deterministic in the job's logical target.
    pub fn id(&self) -> String {
        match self {
            Job::RefreshConversation { conversation_id } => {
                format!("refresh-conversation-{conversation_id}")
            }
            Job::RefreshUser { user_ids } => format!("refresh-user-{}", user_ids.join("-")),
            Job::RefreshAsset { asset_id } => format!("refresh-asset-{asset_id}"),
        }
    }

    /// Execute the job.  Returns follow-up jobs to fan out on success.
    pub fn run(&self, ctx: &JobContext) -> Result<Vec<Job>, JobError> {
        match self {
            Job::RefreshConversation { conversation_id } => {
                refresh_conversation(ctx, conversation_id)
            }
            Job::RefreshUser { user_ids } => refresh_users(ctx, user_ids),
            Job::RefreshAsset { asset_id } => refresh_asset(ctx, asset_id),
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation refresh
// ---------------------------------------------------------------------------

fn refresh_conversation(ctx: &JobContext, conversation_id: &str) -> Result<Vec<Job>, JobError> {
    if conversation_id.is_empty()
        || conversation_id == SYSTEM_USER_ID
        || conversation_id == ctx.account_id
    {
        return Ok(Vec::new());
    }
    // Already synchronized (or exited): the remote call would be redundant.
    // The check is not atomic with the fetch, but the fetch is idempotent, so
    // a racing duplicate costs one wasted round-trip at worst.
    if let Some(status) = ctx.storage.conversation_status(conversation_id)? {
        if status != ConversationStatus::Start {
            return Ok(Vec::new());
        }
    }

    match ctx.client.get_conversation(conversation_id) {
        Ok(response) => {
            if response.category.as_deref() == Some(CATEGORY_GROUP) {
                let (row, participants, circles) = conversation_rows(&response);
                ctx.storage
                    .upsert_conversation(&row, &participants, &circles)?;
                ctx.publish(EntityEvent::ConversationUpdated {
                    conversation_id: conversation_id.to_string(),
                });
                Ok(Vec::new())
            } else if response.category.as_deref() == Some(CATEGORY_CONTACT) {
                // Defer the write: the peer's profile is synchronized first,
                // and the contact conversation materializes from it.
                Ok(vec![Job::RefreshUser {
                    user_ids: vec![response.creator_id],
                }])
            } else {
                mlog!(
                    "refresh-conversation: {} has unknown category {:?}",
                    logging::conv(conversation_id),
                    response.category
                );
                Ok(Vec::new())
            }
        }
        Err(e) if e.is_resource_gone() => {
            // The server no longer grants access: converge by exiting locally.
            if ctx.storage.mark_exited(conversation_id)? {
                ctx.publish(EntityEvent::ConversationExited {
                    conversation_id: conversation_id.to_string(),
                });
            }
            mlog!(
                "refresh-conversation: {} gone ({e}), marked exited",
                logging::conv(conversation_id)
            );
            Ok(Vec::new())
        }
        Err(e) => Err(e.into()),
    }
}

fn conversation_rows(
    response: &ConversationResponse,
) -> (ConversationRow, Vec<ParticipantRow>, Vec<String>) {
    let row = ConversationRow {
        conversation_id: response.conversation_id.clone(),
        creator_id: response.creator_id.clone(),
        category: response.category.clone(),
        name: response.name.clone(),
        announcement: response.announcement.clone(),
        status: ConversationStatus::Success.raw(),
        created_at: response.created_at,
    };
    // Server-confirmed membership lands as SUCCESS.
    let participants = response
        .participants
        .iter()
        .map(|p| ParticipantRow {
            conversation_id: response.conversation_id.clone(),
            user_id: p.user_id.clone(),
            role: p.role.clone(),
            status: ParticipantStatus::Success.raw(),
            created_at: p.created_at,
        })
        .collect();
    let circles = response
        .circles
        .iter()
        .map(|c| c.circle_id.clone())
        .collect();
    (row, participants, circles)
}

// ---------------------------------------------------------------------------
// User refresh
// ---------------------------------------------------------------------------

fn refresh_users(ctx: &JobContext, user_ids: &[String]) -> Result<Vec<Job>, JobError> {
    let ids: Vec<String> = user_ids.iter().filter(|id| !id.is_empty()).cloned().collect();
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    for chunk in ids.chunks(USER_FETCH_BATCH) {
        match ctx.client.fetch_users(chunk) {
            Ok(users) => {
                for user in &users {
                    ctx.storage.upsert_user(&user_row(user))?;
                    ctx.publish(EntityEvent::UserUpdated {
                        user_id: user.user_id.clone(),
                    });
                }
            }
            Err(e) if e.is_resource_gone() => {
                // Nothing stale to correct locally; absence of the upsert
                // already matches the server's view.
                mlog!(
                    "refresh-user: server rejected batch of {} ({e})",
                    chunk.len()
                );
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Vec::new())
}

fn user_row(response: &UserResponse) -> UserRow {
    UserRow {
        user_id: response.user_id.clone(),
        identity_number: response.identity_number.clone(),
        full_name: response.full_name.clone(),
        avatar_url: response.avatar_url.clone(),
        relationship: response.relationship.clone(),
        created_at: response.created_at,
    }
}

// ---------------------------------------------------------------------------
// Asset refresh
// ---------------------------------------------------------------------------

fn refresh_asset(ctx: &JobContext, asset_id: &str) -> Result<Vec<Job>, JobError> {
    if asset_id.is_empty() {
        return Ok(Vec::new());
    }

    match ctx.client.get_asset(asset_id) {
        Ok(asset) => {
            ctx.storage.upsert_asset(&AssetRow {
                asset_id: asset.asset_id.clone(),
                symbol: asset.symbol,
                name: asset.name,
                icon_url: asset.icon_url,
                balance: asset.balance,
                chain_id: asset.chain_id,
            })?;
            ctx.publish(EntityEvent::AssetUpdated {
                asset_id: asset.asset_id,
            });
            Ok(Vec::new())
        }
        Err(e) if e.is_resource_gone() => {
            mlog!("refresh-asset: {asset_id} gone ({e})");
            Ok(Vec::new())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_stable_per_target() {
        let a = Job::RefreshConversation {
            conversation_id: "conv-1".to_string(),
        };
        let b = Job::RefreshConversation {
            conversation_id: "conv-1".to_string(),
        };
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id(), "refresh-conversation-conv-1");

        let users = Job::RefreshUser {
            user_ids: vec!["u-1".to_string(), "u-2".to_string()],
        };
        assert_eq!(users.id(), "refresh-user-u-1-u-2");

        let asset = Job::RefreshAsset {
            asset_id: "btc".to_string(),
        };
        assert_eq!(asset.id(), "refresh-asset-btc");
    }

    #[test]
    fn distinct_targets_get_distinct_ids() {
        let a = Job::RefreshConversation {
            conversation_id: "conv-1".to_string(),
        };
        let b = Job::RefreshConversation {
            conversation_id: "conv-2".to_string(),
        };
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn storage_errors_are_never_transient() {
        let err = JobError::Storage(StorageError::Sqlite(
            rusqlite::Error::InvalidQuery,
        ));
        assert!(!err.is_transient());

        let err = JobError::Api(ApiError::Network("unreachable".into()));
        assert!(err.is_transient());
    }
}
