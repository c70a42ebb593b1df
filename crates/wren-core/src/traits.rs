use async_trait::async_trait;

use crate::error::WrenResult;
use crate::model::{ConflictChoice, ConflictPrompt, SyncSnapshot};

/// The remote snapshot store (e.g. a managed document database), keyed by a
/// budget/household identifier. The engine never talks to the network
/// directly; it goes through this seam, and failures surface as
/// `WrenError::Network`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch the remote counterpart snapshot, or `None` when the budget has
    /// never been pushed.
    async fn fetch(&self, budget_id: &str) -> WrenResult<Option<SyncSnapshot>>;

    /// Replace the remote snapshot (last-writer-wins at document level).
    async fn push(&self, budget_id: &str, snapshot: &SyncSnapshot) -> WrenResult<()>;
}

/// The single conflict-decision callback. The orchestrator blocks the
/// affected sync cycle until this resolves; implementations are either a
/// human-facing prompt or an explicit policy.
#[async_trait]
pub trait ConflictArbiter: Send + Sync {
    async fn on_conflict(&self, prompt: ConflictPrompt) -> WrenResult<ConflictChoice>;
}
