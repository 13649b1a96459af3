//! In-memory [`Transport`] for exercising the lifecycle core without a network.
//!
//! Connections are numbered in creation order starting at 0. Events can be
//! scripted for a connection before it exists; they are delivered as soon
//! as it is created.
//!
//! ```ignore
//! let (transport, controller) = FakeTransport::new();
//! let factory = ConnectionFactory::new(Arc::new(transport), store, SocketConfig::default());
//! controller.qr(0, "1@ABC");
//! controller.open(0);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::credentials::Credential;
use crate::error::TransportError;
use crate::transport::{
    ConnectRequest, ConnectionUpdate, RawDisconnect, SocketControl, Transport, TransportEvent,
    TransportSession,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct FakeSocket {
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    closes: AtomicUsize,
}

impl SocketControl for FakeSocket {
    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        // Dropping the sender ends the event stream
        lock(&self.events).take();
    }
}

#[derive(Default)]
struct Shared {
    requests: Mutex<Vec<ConnectRequest>>,
    sockets: Mutex<Vec<Arc<FakeSocket>>>,
    pending: Mutex<HashMap<usize, Vec<TransportEvent>>>,
    failures: Mutex<VecDeque<String>>,
    panic_next: AtomicBool,
}

pub struct FakeTransport {
    shared: Arc<Shared>,
    created: watch::Sender<usize>,
}

impl FakeTransport {
    pub fn new() -> (Self, FakeTransportController) {
        let shared = Arc::new(Shared::default());
        let (created, created_rx) = watch::channel(0);
        let controller = FakeTransportController {
            shared: Arc::clone(&shared),
            created: created_rx,
        };
        (Self { shared, created }, controller)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, request: ConnectRequest) -> Result<TransportSession, TransportError> {
        if self.shared.panic_next.swap(false, Ordering::SeqCst) {
            panic!("fake transport: scripted panic on connect");
        }
        if let Some(message) = lock(&self.shared.failures).pop_front() {
            return Err(TransportError::Connect(message));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let index = {
            let mut sockets = lock(&self.shared.sockets);
            let index = sockets.len();
            if let Some(events) = lock(&self.shared.pending).remove(&index) {
                for event in events {
                    let _ = tx.send(event);
                }
            }
            let socket = Arc::new(FakeSocket {
                events: Mutex::new(Some(tx)),
                closes: AtomicUsize::new(0),
            });
            sockets.push(Arc::clone(&socket));
            lock(&self.shared.requests).push(request);
            index
        };
        self.created.send_replace(index + 1);

        let control = lock(&self.shared.sockets)[index].clone();
        Ok(TransportSession {
            events: rx,
            control,
        })
    }
}

/// Scripts events into fake connections and inspects what the core did.
#[derive(Clone)]
pub struct FakeTransportController {
    shared: Arc<Shared>,
    created: watch::Receiver<usize>,
}

impl FakeTransportController {
    /// Deliver `event` to connection `index`, or hold it until that
    /// connection is created. Events for a closed connection are dropped.
    pub fn send(&self, index: usize, event: TransportEvent) {
        let sockets = lock(&self.shared.sockets);
        match sockets.get(index) {
            Some(socket) => {
                if let Some(tx) = lock(&socket.events).as_ref() {
                    let _ = tx.send(event);
                }
            }
            None => lock(&self.shared.pending)
                .entry(index)
                .or_default()
                .push(event),
        }
    }

    pub fn qr(&self, index: usize, code: &str) {
        self.send(index, TransportEvent::ConnectionUpdate(ConnectionUpdate::qr(code)));
    }

    pub fn open(&self, index: usize) {
        self.send(index, TransportEvent::ConnectionUpdate(ConnectionUpdate::open()));
    }

    pub fn close_with(&self, index: usize, raw: Option<RawDisconnect>) {
        self.send(index, TransportEvent::ConnectionUpdate(ConnectionUpdate::close(raw)));
    }

    /// Close with a Boom-shaped payload carrying `status_code`.
    pub fn close_status(&self, index: usize, status_code: u16) {
        self.close_with(index, Some(RawDisconnect::status(status_code)));
    }

    pub fn creds_update(&self, index: usize, credential: Value) {
        self.send(index, TransportEvent::CredsUpdate(Credential::new(credential)));
    }

    /// Make the next `connect` call fail with `message`.
    pub fn fail_next_connect(&self, message: &str) {
        lock(&self.shared.failures).push_back(message.to_string());
    }

    /// Make the next `connect` call panic, as a buggy transport would.
    pub fn panic_next_connect(&self) {
        self.shared.panic_next.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ConnectRequest> {
        lock(&self.shared.requests).clone()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.shared.sockets).len()
    }

    /// How many times connection `index` was closed by the core.
    pub fn close_count(&self, index: usize) -> usize {
        lock(&self.shared.sockets)
            .get(index)
            .map(|s| s.closes.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn is_closed(&self, index: usize) -> bool {
        self.close_count(index) > 0
    }

    /// Wait until at least `count` connections have been created.
    pub async fn wait_for_connections(&self, count: usize) {
        let mut created = self.created.clone();
        let _ = created.wait_for(|n| *n >= count).await;
    }
}
