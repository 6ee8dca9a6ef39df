//! Services owned by other systems: the order repository, the packaging
//! suggestion service and photo storage.
//!
//! Each is a trait with an in-memory backend (seedable from a JSON fixture,
//! used by tests and local runs) and an HTTP backend talking JSON to a
//! configured base URL.

pub mod http;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use pickline_core::{ErrorKind, MaterialId, Order, OrderId, SessionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ServerConfig;

pub use http::{HttpOrderRepository, HttpPhotoUploadService, HttpSuggestionService};
pub use memory::{Catalog, InMemoryOrderRepository, InMemoryPhotoUploadService, InMemorySuggestionService, SeedData};

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("{service} request failed: {source}")]
    Http {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{service} returned {status}: {body}")]
    UnexpectedStatus {
        service: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("{service} unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },
    #[error("order {0} is unknown to the order repository")]
    UnknownOrder(OrderId),
    #[error("order {order_id} is already locked by session {session_id}")]
    OrderLocked {
        order_id: OrderId,
        session_id: SessionId,
    },
}

impl CollaboratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CollaboratorError::UnknownOrder(_) => ErrorKind::NotFound,
            CollaboratorError::OrderLocked { .. } => ErrorKind::StateConflict,
            _ => ErrorKind::CollaboratorFailure,
        }
    }
}

/// Packing choices forwarded to the order repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackedOrderRecord {
    pub session_id: SessionId,
    pub order_id: OrderId,
    pub packaging_material_id: Option<MaterialId>,
    pub weight: Option<f64>,
    #[serde(default)]
    pub send_email: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistOutcome {
    #[serde(default)]
    pub low_stock_warning: Option<String>,
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Soft-locks the orders for a new session and returns their seed data in
    /// the requested order.
    async fn lock_orders_for_session(
        &self,
        session_id: SessionId,
        order_ids: &[OrderId],
    ) -> Result<Vec<Order>, CollaboratorError>;

    async fn release_orders(
        &self,
        session_id: SessionId,
        order_ids: &[OrderId],
    ) -> Result<(), CollaboratorError>;

    async fn persist_packed_order(
        &self,
        record: PackedOrderRecord,
    ) -> Result<PersistOutcome, CollaboratorError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackagingMaterial {
    pub id: MaterialId,
    pub name: String,
    #[serde(default)]
    pub dimensions: Option<String>,
    /// Number of item units the material holds.
    pub capacity: u32,
    #[serde(default)]
    pub stock: i64,
    #[serde(default)]
    pub low_stock_threshold: i64,
}

impl PackagingMaterial {
    pub fn is_low_stock(&self) -> bool {
        self.stock <= self.low_stock_threshold
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialSuggestion {
    pub id: MaterialId,
    pub name: String,
    /// 0..=1, higher is a tighter fit.
    pub fit_score: f64,
    #[serde(default)]
    pub dimensions: Option<String>,
    #[serde(default)]
    pub is_low_stock: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackagingSuggestions {
    pub suggestions: Vec<MaterialSuggestion>,
    pub all_materials: Vec<PackagingMaterial>,
    pub total_weight: f64,
    #[serde(default)]
    pub warnings: Vec<String>,
}

#[async_trait]
pub trait SuggestionService: Send + Sync {
    async fn suggest(&self, order_id: OrderId) -> Result<PackagingSuggestions, CollaboratorError>;
}

#[derive(Debug, Clone)]
pub struct PhotoUpload {
    pub session_id: SessionId,
    pub session_token: String,
    pub order_id: OrderId,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

#[async_trait]
pub trait PhotoUploadService: Send + Sync {
    /// Stores the image and returns its public URL.
    async fn upload(&self, upload: PhotoUpload) -> Result<String, CollaboratorError>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub orders: Arc<dyn OrderRepository>,
    pub suggestions: Arc<dyn SuggestionService>,
    pub photos: Arc<dyn PhotoUploadService>,
}

impl Collaborators {
    /// Everything backed by one in-memory catalog.
    pub fn in_memory(catalog: Arc<Catalog>) -> Self {
        Self {
            orders: Arc::new(InMemoryOrderRepository::new(Arc::clone(&catalog))),
            suggestions: Arc::new(InMemorySuggestionService::new(Arc::clone(&catalog))),
            photos: Arc::new(InMemoryPhotoUploadService::new("memory://photos")),
        }
    }

    /// HTTP backends where a base URL is configured, the seeded in-memory
    /// catalog everywhere else.
    pub fn build(config: &ServerConfig) -> anyhow::Result<Self> {
        let catalog = match &config.seed_file {
            Some(path) => Arc::new(Catalog::from_seed(SeedData::load(path)?)),
            None => Arc::new(Catalog::default()),
        };
        let mut collaborators = Self::in_memory(catalog);
        let http = reqwest::Client::builder()
            .timeout(config.collaborator_timeout)
            .build()?;

        if let Some(url) = &config.order_api_url {
            info!(base_url = %url, "using HTTP order repository");
            collaborators.orders = Arc::new(HttpOrderRepository::new(http.clone(), url));
        }
        if let Some(url) = &config.suggestion_api_url {
            info!(base_url = %url, "using HTTP suggestion service");
            collaborators.suggestions = Arc::new(HttpSuggestionService::new(http.clone(), url));
        }
        if let Some(url) = &config.photo_api_url {
            info!(base_url = %url, "using HTTP photo upload service");
            collaborators.photos = Arc::new(HttpPhotoUploadService::new(http, url));
        }
        if config.order_api_url.is_none() && config.seed_file.is_none() {
            warn!("no order repository configured and no seed file; sessions cannot be started");
        }
        Ok(collaborators)
    }
}
