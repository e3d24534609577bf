//! Lifecycle hooks for collaborators (webhook subsystem, registry stream).
//!
//! Hooks fire **after** the mutation is durable and are awaited before the
//! HTTP response is sent. A hook failure propagates to the client as a
//! server error unless the hook swallows it.

use async_trait::async_trait;

/// Payload for a stream-created callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCreated {
    pub path: String,
    pub content_type: String,
    /// Unix millis at creation.
    pub timestamp_ms: u64,
}

/// Payload for a stream-deleted callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDeleted {
    pub path: String,
    pub timestamp_ms: u64,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HookError(pub String);

/// Collaborator contract. Default implementations are no-ops so a hook can
/// subscribe to one side only.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn on_stream_created(&self, _event: StreamCreated) -> Result<(), HookError> {
        Ok(())
    }

    async fn on_stream_deleted(&self, _event: StreamDeleted) -> Result<(), HookError> {
        Ok(())
    }
}
