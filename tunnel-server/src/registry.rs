//! Client registry: the set of live tunnel clients (§3 `TunnelClientRegistration`).
//!
//! Guarded by a single `tokio::sync::Mutex`, as required by spec §5 ("the
//! TunnelServer's client registry ... is protected by a single mutual
//! exclusion lock ... no blocking I/O is performed while [it] is held").
//! Every method here does nothing but touch the `Vec` — no socket I/O is
//! ever attempted under the lock.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tunnel_protocol::MsgType;

/// One queued outbound message for a client's control connection: type,
/// session id, and payload. A dedicated writer task per control connection
/// drains this and calls [`tunnel_protocol::send`].
pub type OutboundMsg = (MsgType, u32, Vec<u8>);
pub type ControlTx = mpsc::UnboundedSender<OutboundMsg>;

/// Server-side record of one live tunnel client (§3).
pub struct ClientRegistration {
    pub subdomain: String,
    pub token: String,
    pub tx: ControlTx,
    pub active: Arc<AtomicBool>,
    pub next_session_id: AtomicU32,
    last_heartbeat: Arc<std::sync::Mutex<Instant>>,
}

impl ClientRegistration {
    pub fn touch_heartbeat(&self) {
        *self.last_heartbeat.lock().unwrap() = Instant::now();
    }

    pub fn seconds_since_heartbeat(&self) -> u64 {
        self.last_heartbeat.lock().unwrap().elapsed().as_secs()
    }

    pub fn next_session_id(&self) -> u32 {
        self.next_session_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// The fleet of currently registered tunnel clients, keyed implicitly by
/// `subdomain` (spec §3: "subdomain is unique across the active set;
/// lookups are O(n) over active registrations").
pub struct ClientRegistry {
    clients: Mutex<Vec<Arc<ClientRegistration>>>,
    max_clients: usize,
}

impl ClientRegistry {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
            max_clients,
        }
    }

    /// Registers a new client. If `requested_subdomain` is empty, a random
    /// 8-character lowercase alphanumeric subdomain is generated and
    /// re-rolled on collision (spec §4.1 step 1). Returns `None` if the
    /// registry is at capacity.
    pub async fn register(
        &self,
        requested_subdomain: &str,
        token: String,
        tx: ControlTx,
    ) -> Option<Arc<ClientRegistration>> {
        let mut clients = self.clients.lock().await;
        if clients.len() >= self.max_clients {
            return None;
        }

        let subdomain = if requested_subdomain.is_empty() {
            loop {
                let candidate = random_subdomain();
                if !clients.iter().any(|c| c.subdomain == candidate) {
                    break candidate;
                }
            }
        } else {
            requested_subdomain.to_string()
        };

        let registration = Arc::new(ClientRegistration {
            subdomain,
            token,
            tx,
            active: Arc::new(AtomicBool::new(true)),
            next_session_id: AtomicU32::new(1),
            last_heartbeat: Arc::new(std::sync::Mutex::new(Instant::now())),
        });
        clients.push(registration.clone());
        Some(registration)
    }

    /// Looks up an active registration by subdomain. O(n) per spec §3.
    pub async fn find_by_subdomain(&self, subdomain: &str) -> Option<Arc<ClientRegistration>> {
        let clients = self.clients.lock().await;
        clients
            .iter()
            .find(|c| c.subdomain == subdomain && c.is_active())
            .cloned()
    }

    /// Removes a registration (terminal state of the control state machine).
    pub async fn remove(&self, subdomain: &str) {
        let mut clients = self.clients.lock().await;
        clients.retain(|c| c.subdomain != subdomain);
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }
}

fn random_subdomain() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..8)
        .map(|_| {
            let idx = rng.random_range(0..CHARS.len());
            CHARS[idx] as char
        })
        .collect()
}
