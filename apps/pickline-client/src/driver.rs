//! Connection-independent client state machine.
//!
//! The driver owns the [`ClientView`] and the set of requests still waiting
//! for their echo. It never touches the socket: every call returns the frames
//! to send and the notices to surface, so the reconnect loop and the tests
//! drive it the same way.

use std::collections::VecDeque;

use pickline_core::{
    ClientMessage, ClientView, ControlEvent, ErrorKind, ItemAction, ItemId, MaterialId,
    MutationError, MutationEvent, OrderId, PackRequest, Reconcile, Role, ServerMessage, SessionId,
    SessionSnapshot,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Something the operator asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Pick {
        item_id: ItemId,
        action: ItemAction,
    },
    Pack {
        order_id: OrderId,
        material_id: Option<MaterialId>,
        weight: Option<f64>,
        send_email: bool,
    },
    Navigate {
        order_id: OrderId,
    },
}

/// What the surrounding UI should show.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Synced { sequence: u64 },
    Applied(MutationEvent),
    Acknowledged(Uuid),
    Rejected {
        kind: ErrorKind,
        message: String,
        request_id: Option<Uuid>,
    },
    Resyncing { expected: u64, received: u64 },
    Control(ControlEvent),
    Reconnecting { attempt: u32 },
}

/// Frames to send and notices to surface after one input.
#[derive(Debug, Default)]
pub struct Step {
    pub outgoing: Vec<ClientMessage>,
    pub notices: Vec<Notice>,
}

struct Pending {
    request_id: Uuid,
    seq: u64,
    message: ClientMessage,
}

pub struct SessionDriver {
    view: ClientView,
    session_id: Option<SessionId>,
    token: Option<String>,
    client_id: Uuid,
    last_seq: u64,
    pending: VecDeque<Pending>,
    awaiting_snapshot: bool,
    replay_on_snapshot: bool,
}

impl SessionDriver {
    pub fn desktop(session_id: SessionId) -> Self {
        Self::new(Role::Desktop, Some(session_id), None)
    }

    pub fn mobile(token: String, session_id: Option<SessionId>) -> Self {
        Self::new(Role::Mobile, session_id, Some(token))
    }

    fn new(role: Role, session_id: Option<SessionId>, token: Option<String>) -> Self {
        Self {
            view: ClientView::new(role),
            session_id,
            token,
            client_id: Uuid::new_v4(),
            last_seq: 0,
            pending: VecDeque::new(),
            awaiting_snapshot: true,
            replay_on_snapshot: false,
        }
    }

    pub fn view(&self) -> &ClientView {
        &self.view
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_superseded(&self) -> bool {
        self.view.is_superseded()
    }

    pub fn join_message(&self) -> ClientMessage {
        ClientMessage::JoinSession {
            session_id: self.session_id,
            role: self.view.role(),
            token: self.token.clone(),
            client_id: Some(self.client_id),
        }
    }

    /// Applies `action` locally and queues the request. Returns the request id
    /// and the frame to send when connected.
    pub fn submit(&mut self, action: Action) -> Result<(Uuid, ClientMessage), MutationError> {
        let message = match action {
            Action::Pick { item_id, action } => self.view.apply_local(item_id, action)?,
            Action::Pack {
                order_id,
                material_id,
                weight,
                send_email,
            } => {
                let request = PackRequest {
                    material_id,
                    weight,
                    photo_url: None,
                    low_stock_warning: None,
                    send_email,
                };
                self.view.begin_pack(order_id, &request)?
            }
            Action::Navigate { order_id } => self.view.navigate_local(order_id)?,
        };
        let request_id = message
            .request_id()
            .ok_or_else(|| MutationError::Validation("request carries no id".into()))?;
        self.last_seq += 1;
        let message = message.with_client_seq(self.last_seq);
        self.pending.push_back(Pending {
            request_id,
            seq: self.last_seq,
            message: message.clone(),
        });
        Ok((request_id, message))
    }

    /// The socket dropped. Local edits keep working; pending requests are
    /// replayed with their original ids once the next snapshot lands.
    pub fn on_disconnected(&mut self) {
        self.view.set_connected(false);
        self.awaiting_snapshot = true;
        self.replay_on_snapshot = true;
    }

    pub fn on_server(&mut self, message: ServerMessage) -> Step {
        let mut step = Step::default();
        match message {
            ServerMessage::SessionState {
                session,
                sequence,
                connected_roles,
                client_seq,
            } => {
                self.session_id = Some(session.id);
                self.view.load_snapshot(
                    SessionSnapshot { session, sequence },
                    connected_roles,
                );
                self.awaiting_snapshot = false;
                step.notices.push(Notice::Synced { sequence });
                // Requests at or below the mark are already in the snapshot.
                if let Some(applied) = client_seq {
                    while self.pending.front().is_some_and(|p| p.seq <= applied) {
                        if let Some(done) = self.pending.pop_front() {
                            step.notices.push(Notice::Acknowledged(done.request_id));
                        }
                    }
                }
                if std::mem::take(&mut self.replay_on_snapshot) {
                    step.outgoing
                        .extend(self.pending.iter().map(|p| p.message.clone()));
                }
            }
            ServerMessage::Acknowledged { request_id } => {
                self.settle(Some(request_id));
                step.notices.push(Notice::Acknowledged(request_id));
            }
            ServerMessage::Error {
                kind,
                message,
                request_id,
                order_id,
            } => {
                self.settle(request_id);
                self.view.handle_error_frame(order_id, kind);
                step.notices.push(Notice::Rejected {
                    kind,
                    message,
                    request_id,
                });
            }
            ServerMessage::Pong => {}
            other => {
                let control = other.clone().into_control();
                if let Some(control) = control {
                    self.view.apply_control(&control);
                    step.notices.push(Notice::Control(control));
                } else if let Some(event) = other.into_event() {
                    self.apply_event(event, &mut step);
                }
            }
        }
        step
    }

    fn apply_event(&mut self, event: MutationEvent, step: &mut Step) {
        if self.awaiting_snapshot {
            debug!(sequence = event.sequence, "dropping event while awaiting snapshot");
            self.settle(event.request_id);
            return;
        }
        match self.view.apply_event(&event) {
            Reconcile::Applied => {
                self.settle(event.request_id);
                step.notices.push(Notice::Applied(event));
            }
            Reconcile::Stale => self.settle(event.request_id),
            outcome => {
                let (expected, received) = match outcome {
                    Reconcile::Gap { expected, received } => (expected, received),
                    _ => (self.view.sequence() + 1, event.sequence),
                };
                warn!(expected, received, ?outcome, "event stream out of step; resyncing");
                self.awaiting_snapshot = true;
                step.outgoing.push(ClientMessage::Resync);
                step.notices.push(Notice::Resyncing { expected, received });
            }
        }
    }

    fn settle(&mut self, request_id: Option<Uuid>) {
        if let Some(request_id) = request_id {
            self.pending.retain(|p| p.request_id != request_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pickline_core::{Item, Mutation, MutationEngine, Order, Session, SessionStore};
    use std::sync::Arc;

    fn engine() -> (MutationEngine, SessionId) {
        let store = Arc::new(SessionStore::new());
        let session_id = Uuid::new_v4();
        store.insert(Session::new(
            session_id,
            vec![
                Order::new(1, "SO-1", "Ada", vec![Item::new(11, "S-11", "bolt", 2)]),
                Order::new(2, "SO-2", "Lin", vec![Item::new(21, "S-21", "nut", 1)]),
            ],
        ));
        (MutationEngine::new(store), session_id)
    }

    fn state(engine: &MutationEngine, session_id: SessionId, roles: Vec<Role>) -> ServerMessage {
        ServerMessage::session_state(engine.store().snapshot(session_id).unwrap(), roles)
    }

    fn pick(item_id: ItemId) -> Action {
        Action::Pick {
            item_id,
            action: ItemAction::Increment,
        }
    }

    #[test]
    fn echo_settles_the_pending_request() {
        let (engine, id) = engine();
        let mut driver = SessionDriver::desktop(id);
        driver.on_server(state(&engine, id, vec![Role::Desktop]));

        let (request_id, _) = driver.submit(pick(11)).unwrap();
        assert_eq!(driver.pending(), 1);

        let event = engine
            .apply(
                id,
                Role::Desktop,
                Mutation::Item {
                    item_id: 11,
                    action: ItemAction::Increment,
                },
                Some(request_id),
            )
            .unwrap();
        let step = driver.on_server(event.into());
        assert_eq!(driver.pending(), 0);
        assert!(matches!(step.notices.as_slice(), [Notice::Applied(_)]));
        let order = driver.view().session().unwrap().order(1).unwrap().clone();
        assert_eq!(order.items[0].picked_quantity, 1);
    }

    #[test]
    fn reconnect_replays_pending_with_original_ids() {
        let (engine, id) = engine();
        let mut driver = SessionDriver::desktop(id);
        driver.on_server(state(&engine, id, vec![Role::Desktop]));

        driver.on_disconnected();
        assert!(!driver.view().is_connected());
        let (first, _) = driver.submit(pick(11)).unwrap();
        let (second, _) = driver.submit(pick(21)).unwrap();

        let step = driver.on_server(state(&engine, id, vec![Role::Desktop]));
        let replayed: Vec<_> = step
            .outgoing
            .iter()
            .filter_map(ClientMessage::request_id)
            .collect();
        assert_eq!(replayed, vec![first, second]);

        // A later snapshot on the same socket does not replay again.
        let step = driver.on_server(state(&engine, id, vec![Role::Desktop]));
        assert!(step.outgoing.is_empty());
    }

    #[test]
    fn requests_applied_before_a_drop_are_not_replayed() {
        let (engine, id) = engine();
        let mut driver = SessionDriver::mobile("token".into(), Some(id));
        driver.on_server(state(&engine, id, vec![Role::Mobile]));

        // Applied by the server, but the socket drops before the echo lands.
        let (applied, sent) = driver.submit(pick(11)).unwrap();
        assert_eq!(sent.client_seq(), Some(1));
        engine
            .apply(
                id,
                Role::Mobile,
                Mutation::Item {
                    item_id: 11,
                    action: ItemAction::Increment,
                },
                Some(applied),
            )
            .unwrap();
        driver.on_disconnected();
        let (offline, _) = driver.submit(pick(21)).unwrap();

        // Far more foreign requests than any id window holds.
        for _ in 0..300 {
            engine
                .apply(id, Role::Desktop, Mutation::Navigate { order_id: 2 }, Some(Uuid::new_v4()))
                .unwrap();
        }

        let snapshot = engine.store().snapshot(id).unwrap();
        let step = driver.on_server(ServerMessage::session_state_for(
            snapshot,
            vec![Role::Desktop, Role::Mobile],
            Some(1),
        ));
        let replayed: Vec<_> = step
            .outgoing
            .iter()
            .filter_map(ClientMessage::request_id)
            .collect();
        assert_eq!(replayed, vec![offline]);
        assert!(step.notices.contains(&Notice::Acknowledged(applied)));
        assert_eq!(driver.pending(), 1);
        let order = driver.view().session().unwrap().order(1).unwrap();
        assert_eq!(order.items[0].picked_quantity, 1);
    }

    #[test]
    fn echo_seen_while_resyncing_settles_its_request() {
        let (engine, id) = engine();
        let mut driver = SessionDriver::desktop(id);
        driver.on_server(state(&engine, id, vec![Role::Desktop]));
        let (request_id, _) = driver.submit(pick(11)).unwrap();

        driver.on_disconnected();
        let echo = engine
            .apply(
                id,
                Role::Desktop,
                Mutation::Item {
                    item_id: 11,
                    action: ItemAction::Increment,
                },
                Some(request_id),
            )
            .unwrap();
        let step = driver.on_server(echo.into());
        assert!(step.notices.is_empty());
        assert_eq!(driver.pending(), 0);

        let step = driver.on_server(state(&engine, id, vec![Role::Desktop]));
        assert!(step.outgoing.is_empty());
    }

    #[test]
    fn gap_requests_resync_and_drops_events_until_snapshot() {
        let (engine, id) = engine();
        let mut driver = SessionDriver::desktop(id);
        driver.on_server(state(&engine, id, vec![Role::Desktop]));

        let increment = || Mutation::Item {
            item_id: 11,
            action: ItemAction::Increment,
        };
        engine.apply(id, Role::Mobile, increment(), None).unwrap();
        let second = engine.apply(id, Role::Mobile, increment(), None).unwrap();

        let step = driver.on_server(second.clone().into());
        assert_eq!(step.outgoing, vec![ClientMessage::Resync]);
        assert_eq!(
            step.notices,
            vec![Notice::Resyncing {
                expected: 1,
                received: 2
            }]
        );

        let step = driver.on_server(second.into());
        assert!(step.outgoing.is_empty());
        assert!(step.notices.is_empty());

        driver.on_server(state(&engine, id, vec![Role::Desktop]));
        assert_eq!(driver.view().sequence(), 2);
    }

    #[test]
    fn duplicate_ack_and_rejection_settle_requests() {
        let (engine, id) = engine();
        let mut driver = SessionDriver::desktop(id);
        driver.on_server(state(&engine, id, vec![Role::Desktop]));

        let (picked, _) = driver.submit(pick(21)).unwrap();
        driver.on_server(ServerMessage::Acknowledged { request_id: picked });
        assert_eq!(driver.pending(), 0);

        let (packed, _) = driver
            .submit(Action::Pack {
                order_id: 2,
                material_id: None,
                weight: None,
                send_email: false,
            })
            .unwrap();
        let step = driver.on_server(ServerMessage::Error {
            kind: ErrorKind::CollaboratorFailure,
            message: "order repository unavailable".into(),
            request_id: Some(packed),
            order_id: Some(2),
        });
        assert_eq!(driver.pending(), 0);
        assert!(driver.view().is_packable(2));
        assert!(matches!(
            step.notices.as_slice(),
            [Notice::Rejected {
                kind: ErrorKind::CollaboratorFailure,
                ..
            }]
        ));
    }

    #[test]
    fn mobile_learns_its_session_from_the_snapshot() {
        let (engine, id) = engine();
        let mut driver = SessionDriver::mobile("token".into(), None);
        assert_eq!(
            driver.join_message(),
            ClientMessage::JoinSession {
                session_id: None,
                role: Role::Mobile,
                token: Some("token".into()),
                client_id: Some(driver.client_id()),
            }
        );
        driver.on_server(state(&engine, id, vec![Role::Mobile]));
        assert_eq!(driver.session_id(), Some(id));

        driver.on_server(ServerMessage::Superseded {
            role: Role::Mobile,
            message: "replaced".into(),
        });
        assert!(driver.is_superseded());
    }

    #[test]
    fn local_guards_reject_before_sending() {
        let (engine, id) = engine();
        let mut driver = SessionDriver::desktop(id);
        assert!(driver.submit(pick(11)).is_err());

        driver.on_server(state(&engine, id, vec![Role::Desktop]));
        let err = driver
            .submit(Action::Pack {
                order_id: 1,
                material_id: None,
                weight: None,
                send_email: false,
            })
            .unwrap_err();
        assert!(matches!(err, MutationError::OrderNotFullyPicked { .. }));
        assert_eq!(driver.pending(), 0);
    }
}
