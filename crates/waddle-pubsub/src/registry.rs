//! Registry of pub/sub services.
//!
//! Hosts the domain-level service and one PEP service per user, created
//! on first use. The registry owns the collaborators every service shares:
//! the listener registry, the persistence writer, the stanza sender and the
//! roster lookup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use jid::{BareJid, Jid};
use tracing::{debug, info, instrument};

use crate::config::PubSubConfig;
use crate::dispatch::{ListenerId, ListenerRegistry, PubSubListener};
use crate::error::PubSubError;
use crate::id::{NodeId, ServiceId};
use crate::presence::Show;
use crate::roster::RosterLookup;
use crate::sender::StanzaSender;
use crate::service::{InFlight, PubSubContext, PubSubService, ServiceKind, ServiceSettings};
use crate::storage::{PersistenceQueue, PubSubStorage};

/// All pub/sub services of a server.
pub struct ServiceRegistry {
    config: PubSubConfig,
    ctx: PubSubContext,
    domain: Arc<PubSubService>,
    pep: DashMap<BareJid, Arc<PubSubService>>,
    /// Serializes PEP service loading so each is loaded once.
    pep_loading: tokio::sync::Mutex<()>,
    shutting_down: AtomicBool,
}

impl ServiceRegistry {
    /// Start the persistence writer and load the domain-level service.
    ///
    /// Must be called within a Tokio runtime.
    #[instrument(skip_all, fields(domain = %config.domain))]
    pub async fn start(
        config: PubSubConfig,
        storage: Arc<dyn PubSubStorage>,
        sender: Arc<dyn StanzaSender>,
        roster: Arc<dyn RosterLookup>,
    ) -> Result<Self, PubSubError> {
        config.log_config();

        let address: Jid = config
            .domain
            .parse()
            .map_err(|e| PubSubError::Config(format!("invalid pubsub domain '{}': {}", config.domain, e)))?;

        let persistence = Arc::new(PersistenceQueue::start(
            storage.clone(),
            config.persist_batch_size,
        ));
        let ctx = PubSubContext {
            listeners: Arc::new(ListenerRegistry::new()),
            persistence,
            storage,
            sender,
            roster,
            in_flight: Arc::new(InFlight::new()),
        };

        let domain = Arc::new(PubSubService::new(
            ServiceId::new(config.domain.clone()),
            address,
            ServiceKind::Domain,
            ServiceSettings::from_config(&config),
            ctx.clone(),
        ));
        domain.load().await?;

        info!("Pubsub service registry started");
        Ok(Self {
            config,
            ctx,
            domain,
            pep: DashMap::new(),
            pep_loading: tokio::sync::Mutex::new(()),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    /// The domain-level service.
    pub fn domain_service(&self) -> Arc<PubSubService> {
        self.domain.clone()
    }

    /// The PEP service of a user, loading it on first use.
    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn pep_service(&self, owner: &BareJid) -> Result<Arc<PubSubService>, PubSubError> {
        if let Some(service) = self.pep.get(owner) {
            return Ok(service.value().clone());
        }

        let _loading = self.pep_loading.lock().await;
        if let Some(service) = self.pep.get(owner) {
            return Ok(service.value().clone());
        }
        if self.is_shutting_down() {
            return Err(PubSubError::ShuttingDown);
        }

        let service = Arc::new(PubSubService::new(
            ServiceId::new(owner.to_string()),
            owner.clone().into(),
            ServiceKind::Pep {
                owner: owner.clone(),
            },
            ServiceSettings::pep(owner, &self.config),
            self.ctx.clone(),
        ));
        service.load().await?;
        self.pep.insert(owner.clone(), service.clone());

        debug!(pep_services = self.pep.len(), "Loaded PEP service");
        Ok(service)
    }

    /// A loaded service by id.
    pub fn service(&self, id: &ServiceId) -> Option<Arc<PubSubService>> {
        if self.domain.id() == id {
            return Some(self.domain.clone());
        }
        let owner: BareJid = id.as_str().parse().ok()?;
        self.pep.get(&owner).map(|s| s.value().clone())
    }

    /// The loaded service hosting an existing node.
    pub fn resolve_node(&self, node: &NodeId) -> Result<Arc<PubSubService>, PubSubError> {
        self.service(node.service())
            .filter(|service| service.contains_node(node))
            .ok_or_else(|| PubSubError::NodeNotFound(node.node_id().to_string()))
    }

    pub fn pep_service_count(&self) -> usize {
        self.pep.len()
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.ctx.listeners
    }

    /// Register a process-wide listener for item events of every service.
    pub fn add_listener(&self, listener: Arc<dyn PubSubListener>) -> ListenerId {
        self.ctx.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.ctx.listeners.remove(id)
    }

    /// Forward a presence change to every loaded service. Services ignore
    /// users whose presence they do not track.
    pub async fn presence_changed(&self, full_jid: &Jid, show: Option<Show>) {
        self.domain.presence_changed(full_jid, show).await;

        let peps: Vec<Arc<PubSubService>> = self.pep.iter().map(|s| s.value().clone()).collect();
        for service in peps {
            service.presence_changed(full_jid, show).await;
        }
    }

    /// Wait until every queued storage write has been applied.
    pub async fn flush(&self) {
        self.ctx.persistence.flush().await;
    }

    /// Stop accepting mutations, wait for admitted ones to finish, then
    /// drain the persistence writer.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        {
            let _loading = self.pep_loading.lock().await;
            self.domain.shutdown();
            let peps: Vec<Arc<PubSubService>> =
                self.pep.iter().map(|s| s.value().clone()).collect();
            for service in peps {
                service.shutdown();
            }
        }

        self.ctx.in_flight.drain().await;
        self.ctx.persistence.shutdown().await;
        info!("Pubsub service registry stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("domain", &self.config.domain)
            .field("pep_services", &self.pep.len())
            .finish()
    }
}
