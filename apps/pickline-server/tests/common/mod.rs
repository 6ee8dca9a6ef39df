#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use pickline_core::{Item, Order, ServerMessage, Session, SessionId};
use pickline_server::collaborators::{
    Catalog, Collaborators, InMemoryOrderRepository, InMemoryPhotoUploadService,
    InMemorySuggestionService, PackagingMaterial, SeedData,
};
use pickline_server::pairing::{InMemoryPairingStore, PairingService};
use pickline_server::AppState;
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct Fixture {
    pub state: AppState,
    pub orders: Arc<InMemoryOrderRepository>,
    pub suggestions: Arc<InMemorySuggestionService>,
    pub photos: Arc<InMemoryPhotoUploadService>,
    pub pairing_store: Arc<InMemoryPairingStore>,
}

/// Order 1 holds two units of item 11 and one of item 12, order 2 one unit of
/// item 21 and order 3 three units of item 31. Material 7 is one box away from
/// its low-stock threshold.
pub fn seed() -> SeedData {
    SeedData {
        orders: vec![
            Order::new(
                1,
                "SO-1001",
                "Harbor Supply",
                vec![
                    Item::new(11, "SKU-11", "Cable ties", 2),
                    Item::new(12, "SKU-12", "Label roll", 1),
                ],
            ),
            Order::new(2, "SO-1002", "Northwind", vec![Item::new(21, "SKU-21", "Tape gun", 1)]),
            Order::new(3, "SO-1003", "Contoso", vec![Item::new(31, "SKU-31", "Bubble wrap", 3)]),
        ],
        materials: vec![
            PackagingMaterial {
                id: 7,
                name: "Small box".into(),
                dimensions: Some("20x15x10".into()),
                capacity: 4,
                stock: 3,
                low_stock_threshold: 2,
            },
            PackagingMaterial {
                id: 8,
                name: "Large box".into(),
                dimensions: Some("40x30x20".into()),
                capacity: 12,
                stock: 50,
                low_stock_threshold: 5,
            },
        ],
        order_weights: [(1, 1.2), (2, 0.4), (3, 2.5)].into_iter().collect(),
    }
}

pub fn fixture() -> Fixture {
    let catalog = Arc::new(Catalog::from_seed(seed()));
    let orders = Arc::new(InMemoryOrderRepository::new(Arc::clone(&catalog)));
    let suggestions = Arc::new(InMemorySuggestionService::new(Arc::clone(&catalog)));
    let photos = Arc::new(InMemoryPhotoUploadService::new("https://cdn.test/photos"));
    let collaborators = Collaborators {
        orders: orders.clone(),
        suggestions: suggestions.clone(),
        photos: photos.clone(),
    };
    let pairing_store = Arc::new(InMemoryPairingStore::new());
    let pairing = PairingService::new(
        pairing_store.clone(),
        Duration::from_secs(300),
        "https://wms.test".into(),
    );
    Fixture {
        state: AppState::new(pairing, collaborators, None),
        orders,
        suggestions,
        photos,
        pairing_store,
    }
}

impl Fixture {
    /// Session over orders 1, 2 and 3 inserted straight into the store.
    pub fn session(&self) -> SessionId {
        let session_id = Uuid::new_v4();
        let orders = seed().orders;
        self.state.store.insert(Session::new(session_id, orders));
        session_id
    }
}

pub type Inbox = mpsc::UnboundedReceiver<ServerMessage>;

pub fn connection() -> (Uuid, mpsc::UnboundedSender<ServerMessage>, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Uuid::new_v4(), tx, rx)
}

pub async fn next_frame(inbox: &mut Inbox) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(2), inbox.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("outbound channel closed")
}

pub fn assert_quiet(inbox: &mut Inbox) {
    if let Ok(frame) = inbox.try_recv() {
        panic!("unexpected frame {frame:?}");
    }
}
