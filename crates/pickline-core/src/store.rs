//! Authoritative session state.
//!
//! Each session lives behind its own `RwLock`; the outer `DashMap` only hands
//! out `Arc`s, so sessions never contend with each other and readers copy a
//! snapshot without waiting on more than the write in flight. Every
//! successful mutator bumps the session's sequence inside the same write
//! critical section, which keeps `(state, sequence)` pairs consistent for
//! resync.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::MutationError;
use crate::model::{
    DeltaOutcome, ItemAction, ItemId, OrderId, OrderSummary, PackOutcome, PackingDetails,
    Session, SessionId, SessionProgress, SessionStatus,
};

/// Full session state plus the sequence of the last event it reflects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session: Session,
    pub sequence: u64,
}

/// A mutation result tagged with the sequence number assigned to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequenced<T> {
    pub sequence: u64,
    pub value: T,
}

struct SessionRecord {
    session: Session,
    sequence: u64,
}

impl SessionRecord {
    fn commit<T>(
        &mut self,
        mutate: impl FnOnce(&mut Session) -> Result<T, MutationError>,
    ) -> Result<Sequenced<T>, MutationError> {
        let value = mutate(&mut self.session)?;
        self.sequence += 1;
        Ok(Sequenced {
            sequence: self.sequence,
            value,
        })
    }
}

#[derive(Default)]
pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<RwLock<SessionRecord>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly seeded session. Its sequence baseline is 0.
    pub fn insert(&self, session: Session) -> SessionSnapshot {
        let snapshot = SessionSnapshot {
            session: session.clone(),
            sequence: 0,
        };
        self.sessions.insert(
            session.id,
            Arc::new(RwLock::new(SessionRecord {
                session,
                sequence: 0,
            })),
        );
        snapshot
    }

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.sessions.contains_key(&session_id)
    }

    pub fn remove(&self, session_id: SessionId) -> Option<Session> {
        self.sessions
            .remove(&session_id)
            .map(|(_, record)| record.read().session.clone())
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    fn record(&self, session_id: SessionId) -> Result<Arc<RwLock<SessionRecord>>, MutationError> {
        self.sessions
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(MutationError::SessionNotFound(session_id))
    }

    pub fn snapshot(&self, session_id: SessionId) -> Result<SessionSnapshot, MutationError> {
        let record = self.record(session_id)?;
        let guard = record.read();
        Ok(SessionSnapshot {
            session: guard.session.clone(),
            sequence: guard.sequence,
        })
    }

    pub fn status(&self, session_id: SessionId) -> Result<SessionStatus, MutationError> {
        let record = self.record(session_id)?;
        let status = record.read().session.status;
        Ok(status)
    }

    pub fn apply_delta(
        &self,
        session_id: SessionId,
        item_id: ItemId,
        action: ItemAction,
    ) -> Result<Sequenced<DeltaOutcome>, MutationError> {
        let record = self.record(session_id)?;
        let mut guard = record.write();
        guard.commit(|session| session.apply_delta(item_id, action))
    }

    /// Evaluates the pack guards without changing anything.
    pub fn ensure_packable(
        &self,
        session_id: SessionId,
        order_id: OrderId,
    ) -> Result<(), MutationError> {
        let record = self.record(session_id)?;
        let guard = record.read();
        guard.session.ensure_packable(order_id)
    }

    pub fn mark_packed(
        &self,
        session_id: SessionId,
        order_id: OrderId,
        details: PackingDetails,
    ) -> Result<Sequenced<PackOutcome>, MutationError> {
        let record = self.record(session_id)?;
        let mut guard = record.write();
        guard.commit(|session| session.mark_packed(order_id, details))
    }

    pub fn navigate(
        &self,
        session_id: SessionId,
        order_id: OrderId,
    ) -> Result<Sequenced<OrderId>, MutationError> {
        let record = self.record(session_id)?;
        let mut guard = record.write();
        guard.commit(|session| session.navigate(order_id).map(|_| order_id))
    }

    pub fn complete_session(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<Sequenced<SessionProgress>, MutationError> {
        let record = self.record(session_id)?;
        let mut guard = record.write();
        guard.commit(|session| session.complete(now))
    }

    /// Cancels the session, returning its progress and the order ids to
    /// release in the order repository.
    pub fn cancel_session(
        &self,
        session_id: SessionId,
        now: DateTime<Utc>,
    ) -> Result<Sequenced<(SessionProgress, Vec<OrderId>)>, MutationError> {
        let record = self.record(session_id)?;
        let mut guard = record.write();
        guard.commit(|session| {
            let released = session.cancel(now)?;
            Ok((session.progress(), released))
        })
    }

    /// Stores a relayed packing photo URL. Photos are not sequenced events.
    pub fn attach_photo(
        &self,
        session_id: SessionId,
        order_id: OrderId,
        photo_url: String,
    ) -> Result<OrderSummary, MutationError> {
        let record = self.record(session_id)?;
        let mut guard = record.write();
        guard.session.attach_photo(order_id, photo_url)
    }
}
