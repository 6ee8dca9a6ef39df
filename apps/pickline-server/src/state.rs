use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics_exporter_prometheus::PrometheusHandle;
use pickline_core::{MutationEngine, OrderId, SessionId, SessionStore};
use tracing::debug;

use crate::collaborators::{CollaboratorError, Collaborators, PackagingSuggestions, SuggestionService};
use crate::pairing::PairingService;
use crate::room::{RoomRegistry, DEFAULT_SESSION_RETENTION};

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SessionStore>,
    pub rooms: RoomRegistry,
    pub pairing: PairingService,
    pub collaborators: Collaborators,
    pub suggestions: SuggestionCache,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        pairing: PairingService,
        collaborators: Collaborators,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self::with_retention(pairing, collaborators, metrics, DEFAULT_SESSION_RETENTION)
    }

    pub fn with_retention(
        pairing: PairingService,
        collaborators: Collaborators,
        metrics: Option<PrometheusHandle>,
        session_retention: Duration,
    ) -> Self {
        let store = Arc::new(SessionStore::new());
        let engine = MutationEngine::new(Arc::clone(&store));
        let rooms = RoomRegistry::new(
            engine,
            Arc::clone(&collaborators.orders),
            session_retention,
        );
        let suggestions = SuggestionCache::new(Arc::clone(&collaborators.suggestions));
        Self {
            store,
            rooms,
            pairing,
            collaborators,
            suggestions,
            metrics,
        }
    }
}

/// Packaging suggestions memoised per session and order. Entries live until
/// the session ends.
#[derive(Clone)]
pub struct SuggestionCache {
    service: Arc<dyn SuggestionService>,
    entries: Arc<DashMap<SessionId, DashMap<OrderId, PackagingSuggestions>>>,
}

impl SuggestionCache {
    pub fn new(service: Arc<dyn SuggestionService>) -> Self {
        Self {
            service,
            entries: Arc::new(DashMap::new()),
        }
    }

    pub fn cached(&self, session_id: SessionId, order_id: OrderId) -> Option<PackagingSuggestions> {
        self.entries
            .get(&session_id)
            .and_then(|orders| orders.get(&order_id).map(|entry| entry.value().clone()))
    }

    pub async fn get_or_fetch(
        &self,
        session_id: SessionId,
        order_id: OrderId,
    ) -> Result<PackagingSuggestions, CollaboratorError> {
        if let Some(hit) = self.cached(session_id, order_id) {
            return Ok(hit);
        }
        let fetched = self.service.suggest(order_id).await?;
        debug!(session = %session_id, order = order_id, "packaging suggestions cached");
        // A concurrent fetch may have landed first; keep whichever is stored.
        let stored = self
            .entries
            .entry(session_id)
            .or_default()
            .entry(order_id)
            .or_insert(fetched)
            .value()
            .clone();
        Ok(stored)
    }

    pub fn evict_session(&self, session_id: SessionId) {
        self.entries.remove(&session_id);
    }

    pub fn sessions(&self) -> usize {
        self.entries.len()
    }
}
