//! Address-based message bus between execution contexts.
//!
//! The background context and each attached tab own a receiving end; everything else
//! talks to them through a cloneable [`Router`]. Payloads cross as JSON so no context
//! ever shares state with another.
//!
//! A request carries a [`Responder`]. Sending on it consumes it, and dropping it
//! unanswered (early return, error, panic, context shutdown) sends the generic fallback
//! reply instead, so every request settles exactly once and no caller hangs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::message::{Message, Reply, TabId};

const CHANNEL_CAPACITY: usize = 64;

/// Where a message is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    Background,
    Tab(TabId),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Background => f.write_str("background"),
            Address::Tab(id) => write!(f, "tab {id}"),
        }
    }
}

/// Who sent a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SurfaceId {
    Popup,
    Options,
    ContextMenu,
    Background,
    Tab(TabId),
}

impl SurfaceId {
    pub fn tab(self) -> Option<TabId> {
        match self {
            SurfaceId::Tab(id) => Some(id),
            _ => None,
        }
    }
}

/// Ties a request to its eventual reply and its origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Correlation {
    /// Monotonic per router
    pub id: u64,
    pub source: SurfaceId,
    pub origin_tab: Option<TabId>,
    pub requested_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("no context is listening at {0}")]
    NoReceiver(Address),
    #[error("{0} stopped before replying")]
    Dropped(Address),
    #[error("no reply from {address} within {timeout:?}")]
    Timeout { address: Address, timeout: Duration },
}

/// One-shot reply handle for a request.
#[derive(Debug)]
pub struct Responder {
    id: u64,
    tx: Option<oneshot::Sender<Reply>>,
}

impl Responder {
    /// Settle the request. Returns false if the caller already gave up waiting.
    pub fn send(mut self, reply: Reply) -> bool {
        match self.tx.take() {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            warn!(id = self.id, "request dropped without a reply, sending fallback");
            let _ = tx.send(Reply::fallback());
        }
    }
}

/// A delivered message.
#[derive(Debug)]
pub struct Envelope {
    pub payload: Value,
    pub correlation: Correlation,
    /// Present when the sender waits for a reply
    pub responder: Option<Responder>,
}

impl Envelope {
    /// Answer if a reply is expected; notifications are silently satisfied.
    pub fn reply(&mut self, reply: Reply) {
        if let Some(responder) = self.responder.take() {
            if !responder.send(reply) {
                debug!(id = self.correlation.id, "caller stopped waiting before the reply");
            }
        }
    }
}

struct RouterInner {
    background: mpsc::Sender<Envelope>,
    tabs: Mutex<HashMap<TabId, mpsc::Sender<Envelope>>>,
    next_id: AtomicU64,
}

/// Cloneable handle for sending to any context.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Create the bus and the background context's receiving end.
    pub fn new() -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let router = Self {
            inner: Arc::new(RouterInner {
                background: tx,
                tabs: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        };
        (router, rx)
    }

    /// Register a tab and return its receiving end. Replaces any previous registration.
    pub fn attach_tab(&self, tab: TabId) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.tabs().insert(tab, tx);
        debug!(tab, "tab attached");
        rx
    }

    pub fn detach_tab(&self, tab: TabId) -> bool {
        self.tabs().remove(&tab).is_some()
    }

    fn tabs(&self) -> std::sync::MutexGuard<'_, HashMap<TabId, mpsc::Sender<Envelope>>> {
        // A poisoned map is still a valid map
        self.inner
            .tabs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sender(&self, address: Address) -> Result<mpsc::Sender<Envelope>, RouterError> {
        match address {
            Address::Background => Ok(self.inner.background.clone()),
            Address::Tab(tab) => self
                .tabs()
                .get(&tab)
                .cloned()
                .ok_or(RouterError::NoReceiver(address)),
        }
    }

    fn correlate(&self, source: SurfaceId, origin_tab: Option<TabId>) -> Correlation {
        Correlation {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            source,
            origin_tab: origin_tab.or(source.tab()),
            requested_at: Utc::now(),
        }
    }

    /// Send a typed message and wait for its reply.
    pub async fn request(
        &self,
        address: Address,
        message: &Message,
        source: SurfaceId,
    ) -> Result<Reply, RouterError> {
        self.request_raw(address, message.to_value(), source, None).await
    }

    /// Like [`Router::request`], but stop waiting after `timeout`. The receiving context
    /// keeps working; its late reply is discarded.
    pub async fn request_timeout(
        &self,
        address: Address,
        message: &Message,
        source: SurfaceId,
        timeout: Duration,
    ) -> Result<Reply, RouterError> {
        let pending = self.request_raw(address, message.to_value(), source, None);
        tokio::time::timeout(timeout, pending)
            .await
            .map_err(|_| RouterError::Timeout { address, timeout })?
    }

    /// Send an arbitrary JSON payload and wait for its reply.
    pub async fn request_raw(
        &self,
        address: Address,
        payload: Value,
        source: SurfaceId,
        origin_tab: Option<TabId>,
    ) -> Result<Reply, RouterError> {
        let sender = self.sender(address)?;
        let correlation = self.correlate(source, origin_tab);
        let id = correlation.id;
        let (tx, rx) = oneshot::channel();
        let envelope = Envelope {
            payload,
            correlation,
            responder: Some(Responder { id, tx: Some(tx) }),
        };

        debug!(id, %address, ?source, "request");
        sender
            .send(envelope)
            .await
            .map_err(|_| RouterError::NoReceiver(address))?;

        rx.await.map_err(|_| RouterError::Dropped(address))
    }

    /// Fire-and-forget delivery. Returns the correlation id used.
    pub async fn notify(
        &self,
        address: Address,
        message: &Message,
        source: SurfaceId,
    ) -> Result<u64, RouterError> {
        self.notify_correlated(address, message, self.correlate(source, None))
            .await
    }

    /// Fire-and-forget delivery reusing an existing correlation, so the receiver can
    /// recognise it as belonging to an earlier request.
    pub async fn notify_correlated(
        &self,
        address: Address,
        message: &Message,
        correlation: Correlation,
    ) -> Result<u64, RouterError> {
        let sender = self.sender(address)?;
        let id = correlation.id;
        debug!(id, %address, kind = message.kind(), "notify");
        sender
            .send(Envelope {
                payload: message.to_value(),
                correlation,
                responder: None,
            })
            .await
            .map_err(|_| RouterError::NoReceiver(address))?;
        Ok(id)
    }
}
