//! Asynchronous write-behind queue in front of the storage gateway.
//!
//! Mutating engine calls enqueue a [`StorageOp`] and return. A single
//! writer task applies the operations in enqueue order. Consecutive item
//! writes are coalesced into one [`PubSubStorage::bulk_items`] call.

use std::sync::{Arc, Mutex};

use jid::Jid;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{NodeRecord, PubSubStorage, StorageError};
use crate::affiliation::NodeAffiliate;
use crate::id::{ItemId, NodeId, ServiceId};
use crate::item::PublishedItem;
use crate::metrics;
use crate::node::{NodeConfig, NodeType};
use crate::subscription::NodeSubscription;

/// A deferred storage write.
#[derive(Debug, Clone)]
pub enum StorageOp {
    CreateNode(NodeRecord),
    UpdateNode(NodeRecord),
    RemoveNode(NodeId),
    CreateAffiliation(NodeId, NodeAffiliate),
    UpdateAffiliation(NodeId, NodeAffiliate),
    RemoveAffiliation(NodeId, Jid),
    CreateSubscription(NodeSubscription),
    UpdateSubscription(NodeSubscription),
    RemoveSubscription(NodeSubscription),
    SaveItem(PublishedItem),
    RemoveItem(ItemId),
    PurgeNode(NodeId),
    CreateDefaultConfig(ServiceId, NodeType, NodeConfig),
    UpdateDefaultConfig(ServiceId, NodeType, NodeConfig),
}

impl StorageOp {
    /// Short operation name for logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            StorageOp::CreateNode(_) => "create_node",
            StorageOp::UpdateNode(_) => "update_node",
            StorageOp::RemoveNode(_) => "remove_node",
            StorageOp::CreateAffiliation(..) => "create_affiliation",
            StorageOp::UpdateAffiliation(..) => "update_affiliation",
            StorageOp::RemoveAffiliation(..) => "remove_affiliation",
            StorageOp::CreateSubscription(_) => "create_subscription",
            StorageOp::UpdateSubscription(_) => "update_subscription",
            StorageOp::RemoveSubscription(_) => "remove_subscription",
            StorageOp::SaveItem(_) => "save_item",
            StorageOp::RemoveItem(_) => "remove_item",
            StorageOp::PurgeNode(_) => "purge_node",
            StorageOp::CreateDefaultConfig(..) => "create_default_config",
            StorageOp::UpdateDefaultConfig(..) => "update_default_config",
        }
    }
}

enum Command {
    Op(StorageOp),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the persistence writer task.
pub struct PersistenceQueue {
    tx: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceQueue {
    /// Spawn the writer task. Must be called within a Tokio runtime.
    pub fn start(storage: Arc<dyn PubSubStorage>, batch_limit: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_writer(storage, rx, batch_limit.max(1)));
        debug!(batch_limit, "Started pubsub persistence writer");
        Self {
            tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue a write. Never blocks.
    pub fn enqueue(&self, op: StorageOp) {
        let name = op.name();
        if self.tx.send(Command::Op(op)).is_err() {
            warn!(op = name, "Persistence writer stopped, dropping storage operation");
            metrics::record_persistence_failure(name);
        }
    }

    /// Wait until every write queued before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Apply every queued write, then stop the writer task.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }

        let task = self.task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Persistence writer task ended abnormally");
            }
        }
        info!("Pubsub persistence writer stopped");
    }
}

impl std::fmt::Debug for PersistenceQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceQueue")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Pending item writes, coalesced per item id. A later write of an id
/// replaces an earlier one.
#[derive(Default)]
struct ItemBatch {
    add: Vec<PublishedItem>,
    delete: Vec<ItemId>,
}

impl ItemBatch {
    fn save(&mut self, item: PublishedItem) {
        self.forget(&item.id);
        self.add.push(item);
    }

    fn remove(&mut self, id: ItemId) {
        self.forget(&id);
        self.delete.push(id);
    }

    fn forget(&mut self, id: &ItemId) {
        self.add.retain(|i| i.id != *id);
        self.delete.retain(|d| d != id);
    }

    async fn flush(&mut self, storage: &dyn PubSubStorage) {
        if self.add.is_empty() && self.delete.is_empty() {
            return;
        }

        let add = std::mem::take(&mut self.add);
        let delete = std::mem::take(&mut self.delete);
        if let Err(e) = storage.bulk_items(&add, &delete).await {
            warn!(
                error = %e,
                added = add.len(),
                deleted = delete.len(),
                "Failed to persist item batch"
            );
            metrics::record_persistence_failure("bulk_items");
        }
    }
}

async fn run_writer(
    storage: Arc<dyn PubSubStorage>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    batch_limit: usize,
) {
    let mut batch = ItemBatch::default();

    while let Some(first) = rx.recv().await {
        let mut commands = vec![first];
        while commands.len() < batch_limit {
            match rx.try_recv() {
                Ok(command) => commands.push(command),
                Err(_) => break,
            }
        }

        for command in commands {
            match command {
                Command::Op(StorageOp::SaveItem(item)) => batch.save(item),
                Command::Op(StorageOp::RemoveItem(id)) => batch.remove(id),
                Command::Op(op) => {
                    batch.flush(storage.as_ref()).await;
                    let name = op.name();
                    if let Err(e) = apply(storage.as_ref(), op).await {
                        warn!(op = name, error = %e, "Failed to persist pubsub change");
                        metrics::record_persistence_failure(name);
                    }
                }
                Command::Flush(done) => {
                    batch.flush(storage.as_ref()).await;
                    let _ = done.send(());
                }
                Command::Shutdown(done) => {
                    batch.flush(storage.as_ref()).await;
                    let _ = done.send(());
                    return;
                }
            }
        }

        batch.flush(storage.as_ref()).await;
    }
}

async fn apply(storage: &dyn PubSubStorage, op: StorageOp) -> Result<(), StorageError> {
    match op {
        StorageOp::CreateNode(record) => storage.create_node(&record).await,
        StorageOp::UpdateNode(record) => storage.update_node(&record).await,
        StorageOp::RemoveNode(node) => storage.remove_node(&node).await,
        StorageOp::CreateAffiliation(node, affiliate) => {
            storage.create_affiliation(&node, &affiliate).await
        }
        StorageOp::UpdateAffiliation(node, affiliate) => {
            storage.update_affiliation(&node, &affiliate).await
        }
        StorageOp::RemoveAffiliation(node, jid) => storage.remove_affiliation(&node, &jid).await,
        StorageOp::CreateSubscription(sub) => storage.create_subscription(&sub).await,
        StorageOp::UpdateSubscription(sub) => storage.update_subscription(&sub).await,
        StorageOp::RemoveSubscription(sub) => storage.remove_subscription(&sub).await,
        StorageOp::SaveItem(item) => storage.save_item(&item).await,
        StorageOp::RemoveItem(id) => storage.remove_item(&id).await,
        StorageOp::PurgeNode(node) => storage.purge_node(&node).await,
        StorageOp::CreateDefaultConfig(service, node_type, config) => {
            storage
                .create_default_config(&service, node_type, &config)
                .await
        }
        StorageOp::UpdateDefaultConfig(service, node_type, config) => {
            storage
                .update_default_config(&service, node_type, &config)
                .await
        }
    }
}
