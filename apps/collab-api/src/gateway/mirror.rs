//! Ordered, best-effort replication of hub state to the shared store.
//!
//! The hub never awaits the store. It queues [`MirrorOp`]s here and a single
//! writer task applies them in order. A full queue drops the op with a warn.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::room::Room;
use crate::store::{ConnectionRecord, SharedStore, StoreError};

#[derive(Debug)]
pub enum MirrorOp {
    SaveConnection(ConnectionRecord),
    DeleteConnection(String),
    SaveRoom(Box<Room>),
    DeleteRoom(String),
    AddUserToRoom { form_id: String, user_id: String },
    RemoveUserFromRoom { form_id: String, user_id: String },
    Cleanup { grace: Duration },
}

impl MirrorOp {
    fn name(&self) -> &'static str {
        match self {
            Self::SaveConnection(_) => "save_connection",
            Self::DeleteConnection(_) => "delete_connection",
            Self::SaveRoom(_) => "save_room",
            Self::DeleteRoom(_) => "delete_room",
            Self::AddUserToRoom { .. } => "add_user_to_room",
            Self::RemoveUserFromRoom { .. } => "remove_user_from_room",
            Self::Cleanup { .. } => "cleanup",
        }
    }
}

#[derive(Clone)]
pub struct Mirror {
    tx: mpsc::Sender<MirrorOp>,
}

impl Mirror {
    /// Spawn the writer task. It exits once every `Mirror` clone is dropped
    /// and the queue has drained.
    pub fn spawn(store: Arc<dyn SharedStore>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(run(store, rx));
        Self { tx }
    }

    pub fn submit(&self, op: MirrorOp) {
        match self.tx.try_send(op) {
            Ok(()) => {}
            Err(TrySendError::Full(op)) => {
                tracing::warn!(op = op.name(), "mirror queue full, dropping store write");
            }
            Err(TrySendError::Closed(op)) => {
                tracing::debug!(op = op.name(), "mirror writer stopped, dropping store write");
            }
        }
    }
}

async fn run(store: Arc<dyn SharedStore>, mut rx: mpsc::Receiver<MirrorOp>) {
    while let Some(op) = rx.recv().await {
        let name = op.name();
        if let Err(err) = apply(store.as_ref(), op).await {
            tracing::warn!(op = name, ?err, "shared store write failed");
        }
    }
    tracing::debug!("mirror writer stopped");
}

async fn apply(store: &dyn SharedStore, op: MirrorOp) -> Result<(), StoreError> {
    match op {
        MirrorOp::SaveConnection(record) => store.save_connection(&record).await,
        MirrorOp::DeleteConnection(id) => store.delete_connection(&id).await,
        MirrorOp::SaveRoom(room) => store.save_room(&room).await,
        MirrorOp::DeleteRoom(form_id) => store.delete_room(&form_id).await,
        MirrorOp::AddUserToRoom { form_id, user_id } => {
            store.add_user_to_room(&form_id, &user_id).await
        }
        MirrorOp::RemoveUserFromRoom { form_id, user_id } => {
            store.remove_user_from_room(&form_id, &user_id).await
        }
        MirrorOp::Cleanup { grace } => {
            let removed = store.cleanup_expired(grace).await?;
            if removed > 0 {
                tracing::info!(removed, "cleaned up expired room snapshots");
            }
            Ok(())
        }
    }
}
