//! Sync envelope (spec §3 `SyncOp`, §6.2).

use crate::clock::ActorId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Registry,
    List,
}

/// `payload` is opaque to the server but MUST be a JSON object on the wire
/// (spec §6.2); locally we keep it as `serde_json::Value` so the repository
/// doesn't need to know the concrete op enum of whichever CRDT owns
/// `resource_id` when shuttling envelopes to/from storage and the network.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SyncOp {
    pub scope: Scope,
    #[serde(rename = "resourceId")]
    pub resource_id: String,
    pub actor: ActorId,
    pub clock: u64,
    pub payload: serde_json::Value,
    #[serde(rename = "serverSeq", skip_serializing_if = "Option::is_none")]
    pub server_seq: Option<u64>,
}

impl SyncOp {
    /// Dedupe key mirroring the server's `(actor, clock, scope, resourceId)`
    /// (spec §6.2).
    pub fn dedupe_key(&self) -> (ActorId, u64, Scope, String) {
        (self.actor.clone(), self.clock, self.scope, self.resource_id.clone())
    }
}
