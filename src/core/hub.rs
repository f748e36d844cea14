use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::core::status::LogLine;

/// Bounded per-client queue; a client that cannot keep up loses its
/// connection rather than slowing the others down.
pub const CLIENT_BUFFER: usize = 32;
/// Connections silent for longer than this are reaped even if their sends
/// still appear to succeed.
pub const STALE_AFTER: Duration = Duration::from_secs(30);

/// One event on a subscriber's SSE stream.
#[derive(Debug, Clone)]
pub enum SseFrame {
    Status(serde_json::Value),
    Log(serde_json::Value),
    Ping,
}

impl SseFrame {
    pub fn event_name(&self) -> &'static str {
        match self {
            SseFrame::Status(_) => "status",
            SseFrame::Log(_) => "log",
            SseFrame::Ping => "ping",
        }
    }

    pub fn data(&self) -> String {
        match self {
            SseFrame::Status(v) | SseFrame::Log(v) => v.to_string(),
            SseFrame::Ping => "keep-alive".to_string(),
        }
    }
}

#[derive(Debug)]
struct Client {
    user: String,
    tx: mpsc::Sender<SseFrame>,
    last_active: Instant,
}

impl Client {
    /// Non-blocking push. A full or closed queue counts as a dead
    /// connection.
    fn push(&mut self, frame: SseFrame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.last_active = Instant::now();
                true
            }
            Err(_) => false,
        }
    }
}

/// Registry of live subscriber connections, at most one per caller
/// identity. Delivery is best-effort: any failed send evicts that client
/// immediately and never blocks delivery to the rest.
#[derive(Debug, Default)]
pub struct BroadcastHub {
    clients: Mutex<Vec<Client>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection for `user`, superseding (and thereby closing)
    /// any existing connection for the same identity. The caller is expected
    /// to follow up with an initial-state frame via `send_to`.
    pub async fn register(&self, user: &str) -> mpsc::Receiver<SseFrame> {
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        let mut clients = self.clients.lock().await;
        let before = clients.len();
        clients.retain(|c| c.user != user);
        if clients.len() < before {
            info!("[sse] replaced existing connection for {}", user);
        }
        clients.push(Client {
            user: user.to_string(),
            tx,
            last_active: Instant::now(),
        });
        info!("[sse] client registered: {} ({} connected)", user, clients.len());
        rx
    }

    /// Delivers a status frame to one identity only, augmented the same way
    /// a broadcast would be.
    pub async fn send_to(
        &self,
        user: &str,
        base: serde_json::Value,
        runner: Option<&str>,
        active: bool,
    ) {
        let mut clients = self.clients.lock().await;
        clients.retain_mut(|c| {
            if c.user != user {
                return true;
            }
            c.push(SseFrame::Status(augment(&base, &c.user, runner, active)))
        });
    }

    /// Fans a status payload to every client, augmented per connection with
    /// the runner, an ownership flag, and the receiving identity.
    pub async fn broadcast_status(
        &self,
        base: &serde_json::Value,
        runner: Option<&str>,
        active: bool,
    ) {
        let mut clients = self.clients.lock().await;
        clients.retain_mut(|c| {
            let delivered = c.push(SseFrame::Status(augment(base, &c.user, runner, active)));
            if !delivered {
                warn!("[sse] send failed, evicting client: {}", c.user);
            }
            delivered
        });
    }

    /// Ships a batch of log lines to every client. Callers flush logs before
    /// the status frame that references them, so subscribers never see a
    /// status claiming coverage of lines they have not received.
    pub async fn broadcast_logs(&self, lines: &[LogLine]) {
        if lines.is_empty() {
            return;
        }
        let payload = serde_json::to_value(lines).unwrap_or_default();
        let mut clients = self.clients.lock().await;
        clients.retain_mut(|c| {
            let delivered = c.push(SseFrame::Log(payload.clone()));
            if !delivered {
                warn!("[sse] send failed, evicting client: {}", c.user);
            }
            delivered
        });
    }

    /// Keepalive ping; doubles as prompt dead-connection detection.
    pub async fn heartbeat(&self) {
        let mut clients = self.clients.lock().await;
        clients.retain_mut(|c| {
            let delivered = c.push(SseFrame::Ping);
            if !delivered {
                debug!("[sse] heartbeat failed, evicting client: {}", c.user);
            }
            delivered
        });
    }

    /// Drops connections with no successful send inside the window, against
    /// transports that accept writes without delivering them.
    pub async fn reap_stale(&self, window: Duration) {
        let now = Instant::now();
        let mut clients = self.clients.lock().await;
        clients.retain(|c| {
            let live = now.duration_since(c.last_active) <= window;
            if !live {
                warn!("[sse] reaping stale client: {}", c.user);
            }
            live
        });
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }
}

fn augment(
    base: &serde_json::Value,
    user: &str,
    runner: Option<&str>,
    active: bool,
) -> serde_json::Value {
    let mut payload = base.clone();
    if let Some(map) = payload.as_object_mut() {
        map.insert("runner".into(), runner.into());
        map.insert("owner".into(), (runner == Some(user)).into());
        map.insert("current_user".into(), user.into());
        map.insert("active".into(), active.into());
    }
    payload
}
