//! Per-session rooms.
//!
//! Every session with activity gets one actor task that owns its roster and
//! is the only caller of the mutation engine for that session, so sequence
//! numbers are assigned and broadcast in one order. Rooms are created on
//! demand and close once the session has ended and every role has left.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge, histogram};
use pickline_core::{
    ControlEvent, EventKind, MaterialId, Mutation, MutationEngine, MutationError, MutationEvent,
    OrderId, OrderSummary, PackRequest, Role, ServerMessage, SessionId,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collaborators::{OrderRepository, PackedOrderRecord};
use crate::error::ApiError;
use crate::telemetry::{METRIC_MUTATIONS, METRIC_PACK_PERSIST, METRIC_ROOMS_ACTIVE};

/// Per-connection outbound queue drained by the socket's writer task.
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

const MAILBOX_DEPTH: usize = 256;
/// How long an ended session stays readable after its room closes.
pub const DEFAULT_SESSION_RETENTION: Duration = Duration::from_secs(300);
/// Number of applied request ids remembered per room.
pub const DEDUP_WINDOW: usize = 256;
const RELEASE_RETRY_FIRST: Duration = Duration::from_millis(250);
const RELEASE_RETRY_CAP: Duration = Duration::from_secs(5);
const RELEASE_RETRY_ATTEMPTS: u32 = 8;

/// Position of a request in the stream of the client that sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSeq {
    pub client_id: Uuid,
    pub seq: u64,
}

/// Result of a mutation request.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Event(MutationEvent),
    /// The request id was already applied; nothing changed.
    Duplicate(Uuid),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PackCommand {
    pub order_id: OrderId,
    pub packaging_material_id: Option<MaterialId>,
    pub weight: Option<f64>,
    pub send_email: bool,
}

enum RoomCommand {
    Join {
        role: Role,
        connection_id: Uuid,
        client_id: Option<Uuid>,
        outbound: Outbound,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    Leave {
        role: Role,
        connection_id: Uuid,
    },
    Mutate {
        role: Role,
        mutation: Mutation,
        request_id: Option<Uuid>,
        origin: Option<ClientSeq>,
        reply: oneshot::Sender<Result<Applied, ApiError>>,
    },
    Pack {
        role: Role,
        pack: PackCommand,
        request_id: Option<Uuid>,
        origin: Option<ClientSeq>,
        reply: oneshot::Sender<Result<Applied, ApiError>>,
    },
    Resync {
        connection_id: Uuid,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    PhotoUploaded {
        order_id: OrderId,
        photo_url: String,
        reply: oneshot::Sender<Result<OrderSummary, ApiError>>,
    },
}

#[derive(Clone)]
struct RoomHandle {
    instance: Uuid,
    tx: mpsc::Sender<RoomCommand>,
}

#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    rooms: DashMap<SessionId, RoomHandle>,
    engine: MutationEngine,
    orders: Arc<dyn OrderRepository>,
    retention: Duration,
}

impl RoomRegistry {
    pub fn new(
        engine: MutationEngine,
        orders: Arc<dyn OrderRepository>,
        retention: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                rooms: DashMap::new(),
                engine,
                orders,
                retention,
            }),
        }
    }

    pub fn engine(&self) -> &MutationEngine {
        &self.inner.engine
    }

    pub fn active_rooms(&self) -> usize {
        self.inner.rooms.len()
    }

    pub fn is_open(&self, session_id: SessionId) -> bool {
        self.inner.rooms.contains_key(&session_id)
    }

    pub async fn join(
        &self,
        session_id: SessionId,
        role: Role,
        connection_id: Uuid,
        outbound: Outbound,
    ) -> Result<(), ApiError> {
        self.join_client(session_id, role, connection_id, None, outbound)
            .await
    }

    /// Joins on behalf of a client that numbers its requests; the snapshot
    /// then reports the highest of them already applied.
    pub async fn join_client(
        &self,
        session_id: SessionId,
        role: Role,
        connection_id: Uuid,
        client_id: Option<Uuid>,
        outbound: Outbound,
    ) -> Result<(), ApiError> {
        self.dispatch(session_id, |reply| RoomCommand::Join {
            role,
            connection_id,
            client_id,
            outbound,
            reply,
        })
        .await
    }

    /// Leaving never opens a room.
    pub async fn leave(&self, session_id: SessionId, role: Role, connection_id: Uuid) {
        let Some(handle) = self
            .inner
            .rooms
            .get(&session_id)
            .map(|entry| entry.value().clone())
        else {
            return;
        };
        let _ = handle
            .tx
            .send(RoomCommand::Leave {
                role,
                connection_id,
            })
            .await;
    }

    pub async fn mutate(
        &self,
        session_id: SessionId,
        role: Role,
        mutation: Mutation,
        request_id: Option<Uuid>,
    ) -> Result<Applied, ApiError> {
        self.mutate_from(session_id, role, mutation, request_id, None)
            .await
    }

    pub async fn mutate_from(
        &self,
        session_id: SessionId,
        role: Role,
        mutation: Mutation,
        request_id: Option<Uuid>,
        origin: Option<ClientSeq>,
    ) -> Result<Applied, ApiError> {
        if let Mutation::Pack { order_id, request } = mutation {
            let pack = PackCommand {
                order_id,
                packaging_material_id: request.material_id,
                weight: request.weight,
                send_email: request.send_email,
            };
            return self
                .pack_from(session_id, role, pack, request_id, origin)
                .await;
        }
        self.dispatch(session_id, |reply| RoomCommand::Mutate {
            role,
            mutation,
            request_id,
            origin,
            reply,
        })
        .await
    }

    pub async fn pack(
        &self,
        session_id: SessionId,
        role: Role,
        pack: PackCommand,
        request_id: Option<Uuid>,
    ) -> Result<Applied, ApiError> {
        self.pack_from(session_id, role, pack, request_id, None)
            .await
    }

    pub async fn pack_from(
        &self,
        session_id: SessionId,
        role: Role,
        pack: PackCommand,
        request_id: Option<Uuid>,
        origin: Option<ClientSeq>,
    ) -> Result<Applied, ApiError> {
        self.dispatch(session_id, |reply| RoomCommand::Pack {
            role,
            pack,
            request_id,
            origin,
            reply,
        })
        .await
    }

    pub async fn resync(&self, session_id: SessionId, connection_id: Uuid) -> Result<(), ApiError> {
        self.dispatch(session_id, |reply| RoomCommand::Resync {
            connection_id,
            reply,
        })
        .await
    }

    pub async fn photo_uploaded(
        &self,
        session_id: SessionId,
        order_id: OrderId,
        photo_url: String,
    ) -> Result<OrderSummary, ApiError> {
        self.dispatch(session_id, |reply| RoomCommand::PhotoUploaded {
            order_id,
            photo_url,
            reply,
        })
        .await
    }

    async fn dispatch<T>(
        &self,
        session_id: SessionId,
        build: impl FnOnce(oneshot::Sender<Result<T, ApiError>>) -> RoomCommand,
    ) -> Result<T, ApiError> {
        let (reply, response) = oneshot::channel();
        let mut command = build(reply);

        // A room that is closing drops its sender; retry once on a fresh room.
        for _ in 0..2 {
            let handle = self.handle(session_id)?;
            match handle.tx.send(command).await {
                Ok(()) => {
                    return response
                        .await
                        .unwrap_or(Err(ApiError::RoomUnavailable(session_id)))
                }
                Err(mpsc::error::SendError(returned)) => {
                    self.inner
                        .rooms
                        .remove_if(&session_id, |_, current| current.instance == handle.instance);
                    command = returned;
                }
            }
        }
        Err(ApiError::RoomUnavailable(session_id))
    }

    fn handle(&self, session_id: SessionId) -> Result<RoomHandle, ApiError> {
        if !self.inner.engine.store().contains(session_id) {
            return Err(MutationError::SessionNotFound(session_id).into());
        }

        let mut opened = false;
        let handle = match self.inner.rooms.entry(session_id) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let handle = self.spawn_room(session_id);
                entry.insert(handle.clone());
                opened = true;
                handle
            }
        };

        if opened {
            gauge!(METRIC_ROOMS_ACTIVE, self.inner.rooms.len() as f64);
            debug!(session = %session_id, "room opened");
        }
        Ok(handle)
    }

    /// Hands a join that reached a closing room to a fresh one.
    async fn forward_join(&self, session_id: SessionId, command: RoomCommand) {
        let RoomCommand::Join {
            role,
            connection_id,
            client_id,
            outbound,
            reply,
        } = command
        else {
            return;
        };
        debug!(session = %session_id, %role, connection = %connection_id, "join raced room close; reopening");
        let result = self
            .join_client(session_id, role, connection_id, client_id, outbound)
            .await;
        let _ = reply.send(result);
    }

    fn spawn_room(&self, session_id: SessionId) -> RoomHandle {
        let (tx, mailbox) = mpsc::channel(MAILBOX_DEPTH);
        let instance = Uuid::new_v4();
        let room = Room {
            session_id,
            instance,
            engine: self.inner.engine.clone(),
            orders: Arc::clone(&self.inner.orders),
            roster: HashMap::new(),
            applied_seqs: HashMap::new(),
            recent: VecDeque::with_capacity(DEDUP_WINDOW),
            seen: HashSet::with_capacity(DEDUP_WINDOW),
        };
        tokio::spawn(room.run(mailbox, Arc::clone(&self.inner)));
        RoomHandle { instance, tx }
    }
}

/// Drops an ended session from the store once the retention period has
/// passed, unless a late join reopened its room in the meantime.
async fn expire_session(registry: Arc<RegistryInner>, session_id: SessionId) {
    tokio::time::sleep(registry.retention).await;
    if registry.rooms.contains_key(&session_id) {
        return;
    }
    let ended = registry
        .engine
        .store()
        .status(session_id)
        .is_ok_and(|status| status.is_terminal());
    if ended && registry.engine.store().remove(session_id).is_some() {
        debug!(session = %session_id, "ended session dropped from store");
    }
}

/// Retries an order release that failed during cancel. The session is
/// already terminal, so nothing else would free the orders.
async fn retry_release(
    orders: Arc<dyn OrderRepository>,
    session_id: SessionId,
    order_ids: Vec<OrderId>,
) {
    let mut delay = RELEASE_RETRY_FIRST;
    for attempt in 1..=RELEASE_RETRY_ATTEMPTS {
        tokio::time::sleep(delay).await;
        match orders.release_orders(session_id, &order_ids).await {
            Ok(()) => {
                info!(session = %session_id, attempt, "orders released after retry");
                return;
            }
            Err(err) => {
                warn!(session = %session_id, attempt, error = %err, "order release retry failed")
            }
        }
        delay = (delay * 2).min(RELEASE_RETRY_CAP);
    }
    error!(session = %session_id, orders = ?order_ids, "giving up on releasing orders");
}

struct Member {
    connection_id: Uuid,
    client_id: Option<Uuid>,
    outbound: Outbound,
}

struct Room {
    session_id: SessionId,
    instance: Uuid,
    engine: MutationEngine,
    orders: Arc<dyn OrderRepository>,
    roster: HashMap<Role, Member>,
    /// Highest applied request sequence per client.
    applied_seqs: HashMap<Uuid, u64>,
    recent: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
}

impl Room {
    async fn run(mut self, mut mailbox: mpsc::Receiver<RoomCommand>, registry: Arc<RegistryInner>) {
        while let Some(command) = mailbox.recv().await {
            self.handle(command).await;
            if self.should_close() {
                break;
            }
        }

        let instance = self.instance;
        registry
            .rooms
            .remove_if(&self.session_id, |_, current| current.instance == instance);
        gauge!(METRIC_ROOMS_ACTIVE, registry.rooms.len() as f64);

        // Commands that raced the close still get an answer; joins go to a
        // fresh room so the joiner is not left in a closed one.
        mailbox.close();
        let reopen = RoomRegistry {
            inner: Arc::clone(&registry),
        };
        while let Some(command) = mailbox.recv().await {
            match command {
                join @ RoomCommand::Join { .. } => {
                    reopen.forward_join(self.session_id, join).await
                }
                other => self.handle(other).await,
            }
        }
        debug!(session = %self.session_id, "room closed");

        if self.should_close() {
            tokio::spawn(expire_session(registry, self.session_id));
        }
    }

    fn should_close(&self) -> bool {
        if !self.roster.is_empty() {
            return false;
        }
        match self.engine.store().status(self.session_id) {
            Ok(status) => status.is_terminal(),
            Err(_) => true,
        }
    }

    async fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Join {
                role,
                connection_id,
                client_id,
                outbound,
                reply,
            } => {
                let _ = reply.send(self.join(role, connection_id, client_id, outbound));
            }
            RoomCommand::Leave {
                role,
                connection_id,
            } => self.leave(role, connection_id),
            RoomCommand::Mutate {
                role,
                mutation,
                request_id,
                origin,
                reply,
            } => {
                let result = self.mutate(role, mutation, request_id, origin).await;
                let _ = reply.send(result);
            }
            RoomCommand::Pack {
                role,
                pack,
                request_id,
                origin,
                reply,
            } => {
                let result = self.pack(role, pack, request_id, origin).await;
                let _ = reply.send(result);
            }
            RoomCommand::Resync {
                connection_id,
                reply,
            } => {
                let _ = reply.send(self.resync(connection_id));
            }
            RoomCommand::PhotoUploaded {
                order_id,
                photo_url,
                reply,
            } => {
                let _ = reply.send(self.photo_uploaded(order_id, photo_url));
            }
        }
    }

    fn connected_roles(&self) -> Vec<Role> {
        [Role::Desktop, Role::Mobile]
            .into_iter()
            .filter(|role| self.roster.contains_key(role))
            .collect()
    }

    fn applied_seq(&self, client_id: Option<Uuid>) -> Option<u64> {
        client_id.and_then(|id| self.applied_seqs.get(&id).copied())
    }

    fn join(
        &mut self,
        role: Role,
        connection_id: Uuid,
        client_id: Option<Uuid>,
        outbound: Outbound,
    ) -> Result<(), ApiError> {
        let snapshot = self.engine.store().snapshot(self.session_id)?;

        let previous = self.roster.insert(
            role,
            Member {
                connection_id,
                client_id,
                outbound: outbound.clone(),
            },
        );
        if let Some(previous) = previous.filter(|p| p.connection_id != connection_id) {
            info!(
                session = %self.session_id,
                %role,
                superseded = %previous.connection_id,
                connection = %connection_id,
                "role taken over by a new connection"
            );
            let _ = previous
                .outbound
                .send(ControlEvent::Superseded { role }.into());
        }

        let _ = outbound.send(ServerMessage::session_state_for(
            snapshot,
            self.connected_roles(),
            self.applied_seq(client_id),
        ));
        if role == Role::Mobile {
            self.notify(Role::Desktop, ControlEvent::PhoneConnected);
        }
        info!(session = %self.session_id, %role, connection = %connection_id, "joined room");
        Ok(())
    }

    fn leave(&mut self, role: Role, connection_id: Uuid) {
        let holds_role = self
            .roster
            .get(&role)
            .is_some_and(|member| member.connection_id == connection_id);
        if !holds_role {
            return;
        }
        self.roster.remove(&role);
        if role == Role::Mobile {
            self.notify(Role::Desktop, ControlEvent::PhoneDisconnected);
        }
        info!(session = %self.session_id, %role, connection = %connection_id, "left room");
    }

    fn notify(&self, role: Role, event: ControlEvent) {
        if let Some(member) = self.roster.get(&role) {
            let _ = member.outbound.send(event.into());
        }
    }

    fn broadcast(&self, message: ServerMessage) {
        for member in self.roster.values() {
            // Closed sockets are removed by their own leave.
            let _ = member.outbound.send(message.clone());
        }
    }

    fn is_duplicate(&self, kind: &'static str, request_id: Option<Uuid>) -> Option<Applied> {
        let request_id = request_id?;
        if !self.seen.contains(&request_id) {
            return None;
        }
        counter!(METRIC_MUTATIONS, 1, "kind" => kind, "result" => "duplicate");
        debug!(session = %self.session_id, %request_id, kind, "duplicate request acknowledged");
        Some(Applied::Duplicate(request_id))
    }

    fn remember(&mut self, request_id: Option<Uuid>) {
        let Some(request_id) = request_id else {
            return;
        };
        if self.recent.len() == DEDUP_WINDOW {
            if let Some(oldest) = self.recent.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.recent.push_back(request_id);
        self.seen.insert(request_id);
    }

    async fn mutate(
        &mut self,
        role: Role,
        mutation: Mutation,
        request_id: Option<Uuid>,
        origin: Option<ClientSeq>,
    ) -> Result<Applied, ApiError> {
        let kind = mutation.name();
        if let Some(duplicate) = self.is_duplicate(kind, request_id) {
            return Ok(duplicate);
        }
        let result = self.engine.apply(self.session_id, role, mutation, request_id);
        self.publish(kind, request_id, origin, result).await
    }

    /// The repository write is the last fallible step before the in-memory
    /// commit; a failed write leaves the session untouched for a retry.
    async fn pack(
        &mut self,
        role: Role,
        pack: PackCommand,
        request_id: Option<Uuid>,
        origin: Option<ClientSeq>,
    ) -> Result<Applied, ApiError> {
        const KIND: &str = "pack";
        if let Some(duplicate) = self.is_duplicate(KIND, request_id) {
            return Ok(duplicate);
        }
        if let Err(err) = self.engine.ensure_packable(self.session_id, pack.order_id) {
            return self.publish(KIND, request_id, origin, Err(err)).await;
        }

        let started = Instant::now();
        let persisted = self
            .orders
            .persist_packed_order(PackedOrderRecord {
                session_id: self.session_id,
                order_id: pack.order_id,
                packaging_material_id: pack.packaging_material_id,
                weight: pack.weight,
                send_email: pack.send_email,
            })
            .await;
        histogram!(METRIC_PACK_PERSIST, started.elapsed().as_secs_f64());

        let outcome = match persisted {
            Ok(outcome) => outcome,
            Err(err) => {
                counter!(METRIC_MUTATIONS, 1, "kind" => KIND, "result" => "collaborator_failure");
                warn!(
                    session = %self.session_id,
                    order = pack.order_id,
                    error = %err,
                    "order repository rejected pack"
                );
                return Err(err.into());
            }
        };

        let mutation = Mutation::Pack {
            order_id: pack.order_id,
            request: PackRequest {
                material_id: pack.packaging_material_id,
                weight: pack.weight,
                photo_url: None,
                low_stock_warning: outcome.low_stock_warning,
                send_email: pack.send_email,
            },
        };
        let result = self.engine.apply(self.session_id, role, mutation, request_id);
        self.publish(KIND, request_id, origin, result).await
    }

    async fn publish(
        &mut self,
        kind: &'static str,
        request_id: Option<Uuid>,
        origin: Option<ClientSeq>,
        result: Result<MutationEvent, MutationError>,
    ) -> Result<Applied, ApiError> {
        let event = match result {
            Ok(event) => event,
            Err(err) => {
                counter!(METRIC_MUTATIONS, 1, "kind" => kind, "result" => err.kind().as_str());
                debug!(session = %self.session_id, kind, error = %err, "mutation rejected");
                return Err(err.into());
            }
        };

        counter!(METRIC_MUTATIONS, 1, "kind" => kind, "result" => "applied");
        self.remember(request_id);
        if let Some(origin) = origin {
            let mark = self.applied_seqs.entry(origin.client_id).or_default();
            *mark = (*mark).max(origin.seq);
        }
        self.broadcast(ServerMessage::from(event.clone()));

        if let EventKind::SessionCancelled {
            released_order_ids, ..
        } = &event.kind
        {
            if let Err(err) = self
                .orders
                .release_orders(self.session_id, released_order_ids)
                .await
            {
                warn!(session = %self.session_id, error = %err, "failed to release orders; retrying");
                tokio::spawn(retry_release(
                    Arc::clone(&self.orders),
                    self.session_id,
                    released_order_ids.clone(),
                ));
            }
        }
        if event.kind.ends_session() {
            info!(session = %self.session_id, event = event.kind.name(), "session ended");
        }

        Ok(Applied::Event(event))
    }

    fn resync(&self, connection_id: Uuid) -> Result<(), ApiError> {
        let member = self
            .roster
            .values()
            .find(|member| member.connection_id == connection_id)
            .ok_or_else(|| ApiError::Validation("connection has not joined this session".into()))?;
        let snapshot = self.engine.store().snapshot(self.session_id)?;
        let _ = member.outbound.send(ServerMessage::session_state_for(
            snapshot,
            self.connected_roles(),
            self.applied_seq(member.client_id),
        ));
        Ok(())
    }

    fn photo_uploaded(&self, order_id: OrderId, photo_url: String) -> Result<OrderSummary, ApiError> {
        let order = self
            .engine
            .store()
            .attach_photo(self.session_id, order_id, photo_url.clone())?;
        self.broadcast(
            ControlEvent::PackingPhotoUploaded {
                order_id,
                photo_url,
            }
            .into(),
        );
        Ok(order)
    }
}
