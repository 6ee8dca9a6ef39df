//! Property tests for the session store, mutation engine and client view.

use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use uuid::Uuid;

use pickline_core::{
    ClientView, Item, ItemAction, Mutation, MutationEngine, MutationError, Order, PackRequest,
    Reconcile, Role, Session, SessionId, SessionStore,
};

// ── Strategies ───────────────────────────────────────────────────────────

fn action() -> impl Strategy<Value = ItemAction> {
    prop_oneof![
        4 => Just(ItemAction::Increment),
        3 => Just(ItemAction::Decrement),
        1 => Just(ItemAction::PickAll),
    ]
}

fn role() -> impl Strategy<Value = Role> {
    prop_oneof![Just(Role::Desktop), Just(Role::Mobile)]
}

/// (item index, action, role, whether the caller guesses optimistically)
fn step(items: usize) -> impl Strategy<Value = (usize, ItemAction, Role, bool)> {
    (0..items, action(), role(), any::<bool>())
}

fn seeded(quantities: &[u32]) -> (MutationEngine, SessionId) {
    let store = Arc::new(SessionStore::new());
    let items = quantities
        .iter()
        .enumerate()
        .map(|(idx, qty)| Item::new(idx as i64 + 100, format!("SKU-{idx}"), "part", *qty))
        .collect();
    let session = Session::new(Uuid::new_v4(), vec![Order::new(1, "WH-1", "Ada", items)]);
    let id = session.id;
    store.insert(session);
    (MutationEngine::new(store), id)
}

fn no_details() -> PackRequest {
    PackRequest {
        material_id: None,
        weight: None,
        photo_url: None,
        low_stock_warning: None,
        send_email: false,
    }
}

// ── 1. Clamping and aggregate consistency ────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_picked_stays_within_bounds(
        quantities in prop::collection::vec(0u32..6, 1..5),
        steps in prop::collection::vec((0usize..5, action()), 0..60),
    ) {
        let (engine, id) = seeded(&quantities);
        let mut expected: Vec<u32> = vec![0; quantities.len()];

        for (idx, action) in steps {
            let idx = idx % quantities.len();
            let event = engine
                .apply(
                    id,
                    Role::Desktop,
                    Mutation::Item { item_id: idx as i64 + 100, action },
                    None,
                )
                .unwrap();
            expected[idx] = action.apply(expected[idx], quantities[idx]);

            if let pickline_core::EventKind::ItemDelta { item, order, session, .. } = &event.kind {
                prop_assert!(item.picked_quantity <= item.quantity);
                prop_assert_eq!(item.picked_quantity, expected[idx]);
                let picked: u64 = expected.iter().map(|p| u64::from(*p)).sum();
                prop_assert_eq!(order.picked_quantity, picked);
                prop_assert_eq!(session.picked_quantity, picked);
            } else {
                prop_assert!(false, "item mutation produced {:?}", event.kind.name());
            }
        }
    }
}

// ── 2. Echo convergence ──────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_views_converge_on_server_state(
        quantities in prop::collection::vec(1u32..5, 1..4),
        steps in prop::collection::vec(step(4), 1..40),
    ) {
        let (engine, id) = seeded(&quantities);
        let snapshot = engine.store().snapshot(id).unwrap();
        let mut desktop = ClientView::new(Role::Desktop);
        let mut mobile = ClientView::new(Role::Mobile);
        desktop.load_snapshot(snapshot.clone(), vec![Role::Desktop, Role::Mobile]);
        mobile.load_snapshot(snapshot, vec![Role::Desktop, Role::Mobile]);

        for (idx, action, role, optimistic) in steps {
            let item_id = (idx % quantities.len()) as i64 + 100;
            if optimistic {
                let view = match role {
                    Role::Desktop => &mut desktop,
                    Role::Mobile => &mut mobile,
                };
                view.apply_local(item_id, action).unwrap();
            }
            let event = engine
                .apply(id, role, Mutation::Item { item_id, action }, None)
                .unwrap();
            prop_assert_eq!(desktop.apply_event(&event), Reconcile::Applied);
            prop_assert_eq!(mobile.apply_event(&event), Reconcile::Applied);
        }

        let authoritative = engine.store().snapshot(id).unwrap();
        prop_assert_eq!(desktop.session(), Some(&authoritative.session));
        prop_assert_eq!(mobile.session(), Some(&authoritative.session));
        prop_assert_eq!(desktop.sequence(), authoritative.sequence);
    }
}

// ── 3. Single writer under contention ────────────────────────────────────

#[test]
fn concurrent_writers_produce_gapless_sequences() {
    let (engine, id) = seeded(&[500]);
    let workers: Vec<_> = (0..4)
        .map(|n| {
            let engine = engine.clone();
            thread::spawn(move || {
                let role = if n % 2 == 0 { Role::Desktop } else { Role::Mobile };
                (0..50)
                    .map(|_| {
                        engine
                            .apply(
                                id,
                                role,
                                Mutation::Item {
                                    item_id: 100,
                                    action: ItemAction::Increment,
                                },
                                None,
                            )
                            .unwrap()
                            .sequence
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut sequences: Vec<u64> = workers
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    sequences.sort_unstable();
    assert_eq!(sequences, (1..=200).collect::<Vec<_>>());

    let snapshot = engine.store().snapshot(id).unwrap();
    assert_eq!(snapshot.sequence, 200);
    assert_eq!(snapshot.session.orders[0].items[0].picked_quantity, 200);
}

// ── 4. Racing pack requests ──────────────────────────────────────────────

#[test]
fn only_one_of_two_racing_packs_wins() {
    let (engine, id) = seeded(&[2]);
    engine
        .apply(
            id,
            Role::Desktop,
            Mutation::Item {
                item_id: 100,
                action: ItemAction::PickAll,
            },
            None,
        )
        .unwrap();

    let racers: Vec<_> = [Role::Desktop, Role::Mobile]
        .into_iter()
        .map(|role| {
            let engine = engine.clone();
            thread::spawn(move || {
                engine.apply(
                    id,
                    role,
                    Mutation::Pack {
                        order_id: 1,
                        request: no_details(),
                    },
                    None,
                )
            })
        })
        .collect();
    let results: Vec<_> = racers.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(MutationError::AlreadyPacked(1)))));
    assert_eq!(engine.store().snapshot(id).unwrap().sequence, 2);
}
