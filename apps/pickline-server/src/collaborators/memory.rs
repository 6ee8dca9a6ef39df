use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use pickline_core::{MaterialId, Order, OrderId, SessionId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    CollaboratorError, MaterialSuggestion, OrderRepository, PackagingMaterial,
    PackagingSuggestions, PackedOrderRecord, PersistOutcome, PhotoUpload, PhotoUploadService,
    SuggestionService,
};

const MAX_SUGGESTIONS: usize = 3;

/// Fixture format accepted by `PICKLINE_SEED_FILE`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedData {
    #[serde(default)]
    pub orders: Vec<Order>,
    #[serde(default)]
    pub materials: Vec<PackagingMaterial>,
    /// Shipping weight per order in kilograms.
    #[serde(default)]
    pub order_weights: HashMap<OrderId, f64>,
}

impl SeedData {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read seed file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid seed file {}", path.display()))
    }
}

/// Orders, materials and order locks shared by the in-memory backends.
#[derive(Default)]
pub struct Catalog {
    orders: DashMap<OrderId, Order>,
    materials: DashMap<MaterialId, PackagingMaterial>,
    order_weights: DashMap<OrderId, f64>,
    locks: Mutex<HashMap<OrderId, SessionId>>,
}

impl Catalog {
    pub fn from_seed(seed: SeedData) -> Self {
        let catalog = Self::default();
        for order in seed.orders {
            catalog.orders.insert(order.id, order);
        }
        for material in seed.materials {
            catalog.materials.insert(material.id, material);
        }
        for (order_id, weight) in seed.order_weights {
            catalog.order_weights.insert(order_id, weight);
        }
        catalog
    }

    pub fn order(&self, order_id: OrderId) -> Option<Order> {
        self.orders.get(&order_id).map(|entry| entry.value().clone())
    }

    pub fn material(&self, material_id: MaterialId) -> Option<PackagingMaterial> {
        self.materials.get(&material_id).map(|entry| entry.value().clone())
    }

    pub fn locked_by(&self, order_id: OrderId) -> Option<SessionId> {
        self.locks.lock().get(&order_id).copied()
    }

    fn sorted_materials(&self) -> Vec<PackagingMaterial> {
        let mut materials: Vec<_> = self
            .materials
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        materials.sort_by_key(|material| material.id);
        materials
    }
}

pub struct InMemoryOrderRepository {
    catalog: Arc<Catalog>,
    persisted: Mutex<Vec<PackedOrderRecord>>,
    releases: Mutex<Vec<Vec<OrderId>>>,
    fail_persist: AtomicBool,
    fail_release: AtomicBool,
}

impl InMemoryOrderRepository {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            persisted: Mutex::new(Vec::new()),
            releases: Mutex::new(Vec::new()),
            fail_persist: AtomicBool::new(false),
            fail_release: AtomicBool::new(false),
        }
    }

    pub fn persisted(&self) -> Vec<PackedOrderRecord> {
        self.persisted.lock().clone()
    }

    /// Every successful `release_orders` call, in order.
    pub fn release_calls(&self) -> Vec<Vec<OrderId>> {
        self.releases.lock().clone()
    }

    /// Makes subsequent `persist_packed_order` calls fail until reset.
    pub fn fail_persist(&self, fail: bool) {
        self.fail_persist.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent `release_orders` calls fail until reset.
    pub fn fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn lock_orders_for_session(
        &self,
        session_id: SessionId,
        order_ids: &[OrderId],
    ) -> Result<Vec<Order>, CollaboratorError> {
        let mut locks = self.catalog.locks.lock();
        let mut orders = Vec::with_capacity(order_ids.len());
        for order_id in order_ids {
            let order = self
                .catalog
                .order(*order_id)
                .ok_or(CollaboratorError::UnknownOrder(*order_id))?;
            if let Some(holder) = locks.get(order_id) {
                if *holder != session_id {
                    return Err(CollaboratorError::OrderLocked {
                        order_id: *order_id,
                        session_id: *holder,
                    });
                }
            }
            orders.push(order);
        }
        for order_id in order_ids {
            locks.insert(*order_id, session_id);
        }
        Ok(orders)
    }

    async fn release_orders(
        &self,
        session_id: SessionId,
        order_ids: &[OrderId],
    ) -> Result<(), CollaboratorError> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable {
                service: "order repository",
                message: "release rejected".into(),
            });
        }
        let mut locks = self.catalog.locks.lock();
        for order_id in order_ids {
            if locks.get(order_id) == Some(&session_id) {
                locks.remove(order_id);
            }
        }
        self.releases.lock().push(order_ids.to_vec());
        Ok(())
    }

    async fn persist_packed_order(
        &self,
        record: PackedOrderRecord,
    ) -> Result<PersistOutcome, CollaboratorError> {
        if self.fail_persist.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable {
                service: "order repository",
                message: "write rejected".into(),
            });
        }

        {
            let mut order = self
                .catalog
                .orders
                .get_mut(&record.order_id)
                .ok_or(CollaboratorError::UnknownOrder(record.order_id))?;
            order.packing_completed_at = Some(Utc::now());
            order.packaging_material_id = record.packaging_material_id;
            order.package_weight = record.weight;
        }

        let low_stock_warning = record.packaging_material_id.and_then(|material_id| {
            let mut material = self.catalog.materials.get_mut(&material_id)?;
            material.stock -= 1;
            material.is_low_stock().then(|| {
                format!(
                    "Low stock: {} ({} remaining)",
                    material.name,
                    material.stock.max(0)
                )
            })
        });

        self.persisted.lock().push(record);
        Ok(PersistOutcome { low_stock_warning })
    }
}

pub struct InMemorySuggestionService {
    catalog: Arc<Catalog>,
    calls: AtomicUsize,
}

impl InMemorySuggestionService {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SuggestionService for InMemorySuggestionService {
    async fn suggest(&self, order_id: OrderId) -> Result<PackagingSuggestions, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let order = self
            .catalog
            .order(order_id)
            .ok_or(CollaboratorError::UnknownOrder(order_id))?;
        let units = order.total_quantity();
        let all_materials = self.catalog.sorted_materials();

        let mut suggestions: Vec<MaterialSuggestion> = all_materials
            .iter()
            .filter(|material| units > 0 && u64::from(material.capacity) >= units)
            .map(|material| MaterialSuggestion {
                id: material.id,
                name: material.name.clone(),
                fit_score: units as f64 / f64::from(material.capacity),
                dimensions: material.dimensions.clone(),
                is_low_stock: material.is_low_stock(),
            })
            .collect();
        suggestions.sort_by(|a, b| b.fit_score.total_cmp(&a.fit_score));
        suggestions.truncate(MAX_SUGGESTIONS);

        let mut warnings = Vec::new();
        if suggestions.is_empty() {
            warnings.push(format!("No packaging material holds {units} units"));
        }
        warnings.extend(
            suggestions
                .iter()
                .filter(|s| s.is_low_stock)
                .map(|s| format!("{} is running low", s.name)),
        );

        let total_weight = self
            .catalog
            .order_weights
            .get(&order_id)
            .map(|entry| *entry.value())
            .unwrap_or(0.0);

        Ok(PackagingSuggestions {
            suggestions,
            all_materials,
            total_weight,
            warnings,
        })
    }
}

pub struct InMemoryPhotoUploadService {
    base_url: String,
    stored: DashMap<String, usize>,
}

impl InMemoryPhotoUploadService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            stored: DashMap::new(),
        }
    }

    pub fn stored(&self) -> usize {
        self.stored.len()
    }
}

#[async_trait]
impl PhotoUploadService for InMemoryPhotoUploadService {
    async fn upload(&self, upload: PhotoUpload) -> Result<String, CollaboratorError> {
        let url = format!(
            "{}/{}/{}-{}.jpg",
            self.base_url.trim_end_matches('/'),
            upload.session_id,
            upload.order_id,
            Uuid::new_v4().simple()
        );
        self.stored.insert(url.clone(), upload.bytes.len());
        Ok(url)
    }
}
