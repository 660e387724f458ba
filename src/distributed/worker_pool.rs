/*!
 * Pooled SSH channels to remote workers.
 *
 * Call sites borrow a connection with `get` and hand it back with `release`;
 * nobody else closes pooled connections. An idle connection is reused while
 * it is younger than `connection_max_lifetime` and has been idle for less
 * than `connection_idle_timeout`. The sweeper closes everything else that is
 * not in use.
 */

use std::collections::HashMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use ssh2::{CheckResult, KnownHostFileKind, Session};
use tokio::task::JoinHandle;

use crate::app_config::{PoolConfig, WorkerDescriptor};
use crate::errors::TranslationError;
use crate::events::{Event, EventBus, EventType};

/// An open channel to one worker
pub trait WorkerConnection: Send + Sync {
    fn worker_id(&self) -> &str;

    fn is_alive(&self) -> bool;

    fn close(&self);
}

/// Opens new worker connections for the pool
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, worker: &WorkerDescriptor) -> Result<Arc<dyn WorkerConnection>, TranslationError>;
}

/// Authenticated ssh2 session
pub struct SshConnection {
    worker_id: String,
    session: Mutex<Option<Session>>,
}

impl WorkerConnection for SshConnection {
    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn is_alive(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(Session::authenticated)
    }

    fn close(&self) {
        if let Some(session) = self.session.lock().take() {
            if let Err(e) = session.disconnect(None, "pool eviction", None) {
                debug!("Disconnect from {} failed: {}", self.worker_id, e);
            }
        }
    }
}

/// Dials workers over SSH
#[derive(Debug, Clone)]
pub struct SshConnector {
    connect_timeout: Duration,
    host_key_verification: bool,
    known_hosts_path: Option<PathBuf>,
}

impl SshConnector {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            host_key_verification: config.host_key_verification,
            known_hosts_path: config.known_hosts_path.clone(),
        }
    }

    fn known_hosts(&self) -> Option<PathBuf> {
        self.known_hosts_path
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts")))
    }

    fn dial(&self, worker: &WorkerDescriptor) -> Result<SshConnection, TranslationError> {
        let address = format!("{}:{}", worker.host, worker.port);
        let socket = address
            .to_socket_addrs()
            .map_err(|e| ssh_error(&address, "failed to resolve host", e))?
            .next()
            .ok_or_else(|| TranslationError::Connection(format!("{}: no address resolved", address)))?;

        let tcp = TcpStream::connect_timeout(&socket, self.connect_timeout)
            .map_err(|e| ssh_error(&address, "SSH dial failed", e))?;
        let mut session = Session::new().map_err(|e| ssh_error(&address, "failed to create session", e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.connect_timeout.as_millis().min(u32::MAX as u128) as u32);
        session
            .handshake()
            .map_err(|e| ssh_error(&address, "SSH handshake failed", e))?;

        self.check_host_key(&session, worker, &address)?;
        authenticate(&session, worker, &address)?;

        Ok(SshConnection {
            worker_id: worker.id.clone(),
            session: Mutex::new(Some(session)),
        })
    }

    fn check_host_key(&self, session: &Session, worker: &WorkerDescriptor, address: &str) -> Result<(), TranslationError> {
        if !self.host_key_verification {
            warn!("Host key verification disabled, accepting any key from {}", address);
            return Ok(());
        }

        let path = self
            .known_hosts()
            .ok_or_else(|| TranslationError::Config("known hosts file not configured".to_string()))?;
        let mut known_hosts = session
            .known_hosts()
            .map_err(|e| ssh_error(address, "failed to open known hosts", e))?;
        known_hosts
            .read_file(&path, KnownHostFileKind::OpenSSH)
            .map_err(|e| ssh_error(address, &format!("failed to read {}", path.display()), e))?;

        let (key, _) = session
            .host_key()
            .ok_or_else(|| TranslationError::Connection(format!("{}: server sent no host key", address)))?;
        match known_hosts.check_port(&worker.host, worker.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound => Err(TranslationError::Connection(format!(
                "{}: host key not found in {}",
                address,
                path.display()
            ))),
            CheckResult::Mismatch => Err(TranslationError::Connection(format!(
                "{}: host key mismatch",
                address
            ))),
            CheckResult::Failure => Err(TranslationError::Connection(format!(
                "{}: host key check failed",
                address
            ))),
        }
    }
}

fn ssh_error(address: &str, context: &str, error: impl std::fmt::Display) -> TranslationError {
    TranslationError::Connection(format!("{}: {}: {}", address, context, error))
}

/// Try the private key first, then the password
fn authenticate(session: &Session, worker: &WorkerDescriptor, address: &str) -> Result<(), TranslationError> {
    let mut last_error = None;

    if let Some(key) = worker.auth.private_key.as_deref().filter(|k| !k.is_empty()) {
        match session.userauth_pubkey_memory(&worker.user, None, key, None) {
            Ok(()) => debug!("Authenticated to {} with public key", address),
            Err(e) => last_error = Some(ssh_error(address, "public key authentication failed", e)),
        }
    }

    if !session.authenticated() {
        if let Some(password) = worker.auth.password.as_deref().filter(|p| !p.is_empty()) {
            match session.userauth_password(&worker.user, password) {
                Ok(()) => debug!("Authenticated to {} with password", address),
                Err(e) => last_error = Some(ssh_error(address, "password authentication failed", e)),
            }
        }
    }

    if session.authenticated() {
        Ok(())
    } else {
        Err(last_error.unwrap_or_else(|| TranslationError::NoAuth(worker.id.clone())))
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, worker: &WorkerDescriptor) -> Result<Arc<dyn WorkerConnection>, TranslationError> {
        let connector = self.clone();
        let worker = worker.clone();
        let connection = tokio::task::spawn_blocking(move || connector.dial(&worker))
            .await
            .map_err(|e| TranslationError::Connection(format!("SSH dial task failed: {}", e)))??;
        Ok(Arc::new(connection))
    }
}

struct Slot {
    id: u64,
    connection: Arc<dyn WorkerConnection>,
    in_use: bool,
    /// Closed on release instead of returning to the idle set
    retired: bool,
    created_at: Instant,
    last_used: Instant,
}

impl Slot {
    fn is_reusable(&self, now: Instant, config: &PoolConfig) -> bool {
        !self.in_use
            && !self.retired
            && now.duration_since(self.created_at) < config.max_lifetime()
            && now.duration_since(self.last_used) < config.idle_timeout()
            && self.connection.is_alive()
    }

    /// Why the sweeper should drop this slot, if it should
    fn eviction_reason(&self, now: Instant, config: &PoolConfig) -> Option<&'static str> {
        if self.in_use {
            None
        } else if self.retired {
            Some("removed")
        } else if now.duration_since(self.created_at) >= config.max_lifetime() {
            Some("expired")
        } else if now.duration_since(self.last_used) >= config.idle_timeout() {
            Some("idle")
        } else if !self.connection.is_alive() {
            Some("dead")
        } else {
            None
        }
    }
}

#[derive(Default)]
struct WorkerSlots {
    slots: Vec<Slot>,
    /// Dials in progress, counted against capacity
    connecting: usize,
}

impl WorkerSlots {
    fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }
}

/// A borrowed connection; return it with `WorkerPool::release`
pub struct ConnectionLease {
    worker_id: String,
    slot_id: u64,
    connection: Arc<dyn WorkerConnection>,
}

impl ConnectionLease {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn connection(&self) -> &Arc<dyn WorkerConnection> {
        &self.connection
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("worker_id", &self.worker_id)
            .field("slot_id", &self.slot_id)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub workers: usize,
    pub max_per_worker: usize,
}

/// Gives back a dial slot when `get` is dropped before the dial finishes
struct DialReservation<'a> {
    workers: &'a RwLock<HashMap<String, WorkerSlots>>,
    worker_id: &'a str,
    armed: bool,
}

impl DialReservation<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DialReservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(entry) = self.workers.write().get_mut(self.worker_id) {
            entry.connecting = entry.connecting.saturating_sub(1);
        }
        debug!("Dial to {} abandoned, reservation released", self.worker_id);
    }
}

pub struct WorkerPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    events: EventBus,
    workers: RwLock<HashMap<String, WorkerSlots>>,
    next_slot: AtomicU64,
    closed: AtomicBool,
}

impl WorkerPool {
    pub fn new(connector: Arc<dyn Connector>, config: PoolConfig, events: EventBus) -> Self {
        Self {
            connector,
            config,
            events,
            workers: RwLock::new(HashMap::new()),
            next_slot: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Pool dialing over SSH with the configured host key policy
    pub fn ssh(config: PoolConfig, events: EventBus) -> Self {
        let connector = Arc::new(SshConnector::from_config(&config));
        Self::new(connector, config, events)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Borrow a connection to `worker_id`, reusing an idle one when possible
    pub async fn get(&self, worker_id: &str, worker: &WorkerDescriptor) -> Result<ConnectionLease, TranslationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TranslationError::Connection("worker pool is closed".to_string()));
        }
        if worker.auth.is_empty() {
            return Err(TranslationError::NoAuth(worker_id.to_string()));
        }

        let mut stale = Vec::new();
        let reused = {
            let mut workers = self.workers.write();
            let entry = workers.entry(worker_id.to_string()).or_default();
            let now = Instant::now();

            let mut kept = Vec::with_capacity(entry.slots.len());
            for slot in entry.slots.drain(..) {
                if slot.in_use || slot.is_reusable(now, &self.config) {
                    kept.push(slot);
                } else {
                    stale.push(slot.connection);
                }
            }
            entry.slots = kept;

            match entry.slots.iter_mut().find(|s| !s.in_use) {
                Some(slot) => {
                    slot.in_use = true;
                    slot.last_used = now;
                    Some(ConnectionLease {
                        worker_id: worker_id.to_string(),
                        slot_id: slot.id,
                        connection: slot.connection.clone(),
                    })
                }
                None => {
                    if entry.in_use() + entry.connecting >= self.config.max_connections_per_worker.max(1) {
                        return Err(TranslationError::Connection(format!(
                            "connection limit of {} reached for worker {}",
                            self.config.max_connections_per_worker, worker_id
                        )));
                    }
                    entry.connecting += 1;
                    None
                }
            }
        };

        for connection in stale {
            connection.close();
            self.publish_eviction(worker_id, "stale");
        }

        if let Some(lease) = reused {
            debug!("Reusing pooled connection {} to {}", lease.slot_id, worker_id);
            return Ok(lease);
        }

        let reservation = DialReservation {
            workers: &self.workers,
            worker_id,
            armed: true,
        };
        let connected = self.connector.connect(worker).await;

        let mut workers = self.workers.write();
        let entry = workers.entry(worker_id.to_string()).or_default();
        entry.connecting = entry.connecting.saturating_sub(1);
        reservation.disarm();
        let connection = connected?;

        let now = Instant::now();
        let slot_id = self.next_slot.fetch_add(1, Ordering::Relaxed);
        entry.slots.push(Slot {
            id: slot_id,
            connection: connection.clone(),
            in_use: true,
            retired: false,
            created_at: now,
            last_used: now,
        });
        drop(workers);

        info!("Opened connection {} to worker {} ({}:{})", slot_id, worker_id, worker.host, worker.port);
        self.events.publish(
            Event::new(EventType::ConnectionOpened, format!("Connected to worker {}", worker_id))
                .with_data("worker_id", worker_id)
                .with_data("host", worker.host.as_str())
                .with_data("port", worker.port as u64),
        );

        Ok(ConnectionLease {
            worker_id: worker_id.to_string(),
            slot_id,
            connection,
        })
    }

    /// Hand a borrowed connection back to the pool
    pub fn release(&self, lease: ConnectionLease) {
        let retired = {
            let mut workers = self.workers.write();
            let Some(entry) = workers.get_mut(&lease.worker_id) else {
                return;
            };
            let Some(position) = entry.slots.iter().position(|s| s.id == lease.slot_id) else {
                return;
            };
            if entry.slots[position].retired {
                Some(entry.slots.remove(position).connection)
            } else {
                let slot = &mut entry.slots[position];
                slot.in_use = false;
                slot.last_used = Instant::now();
                None
            }
        };
        if let Some(connection) = retired {
            connection.close();
            self.publish_eviction(&lease.worker_id, "removed");
        }
    }

    /// Close and forget every idle connection to `worker_id`.
    /// Borrowed connections are closed when they are released.
    pub fn remove(&self, worker_id: &str) {
        let removed: Vec<Arc<dyn WorkerConnection>> = {
            let mut workers = self.workers.write();
            match workers.get_mut(worker_id) {
                Some(entry) => {
                    let (mut busy, idle): (Vec<Slot>, Vec<Slot>) = entry.slots.drain(..).partition(|s| s.in_use);
                    for slot in &mut busy {
                        slot.retired = true;
                    }
                    entry.slots = busy;
                    idle.into_iter().map(|s| s.connection).collect()
                }
                None => Vec::new(),
            }
        };
        for connection in removed {
            connection.close();
            self.publish_eviction(worker_id, "removed");
        }
    }

    /// Close idle, expired or dead connections; returns how many were evicted
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut workers = self.workers.write();
            for (worker_id, entry) in workers.iter_mut() {
                let mut kept = Vec::with_capacity(entry.slots.len());
                for slot in entry.slots.drain(..) {
                    match slot.eviction_reason(now, &self.config) {
                        Some(reason) => evicted.push((worker_id.clone(), reason, slot.connection)),
                        None => kept.push(slot),
                    }
                }
                entry.slots = kept;
            }
            workers.retain(|_, entry| !entry.slots.is_empty() || entry.connecting > 0);
        }

        let count = evicted.len();
        for (worker_id, reason, connection) in evicted {
            connection.close();
            self.publish_eviction(&worker_id, reason);
        }
        if count > 0 {
            debug!("Pool sweeper evicted {} connections", count);
        }
        count
    }

    /// Start the periodic sweeper; it stops when the pool is dropped or closed
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                if pool.closed.load(Ordering::SeqCst) {
                    break;
                }
                pool.sweep();
            }
        })
    }

    pub fn stats(&self) -> PoolStats {
        let workers = self.workers.read();
        let mut stats = PoolStats {
            workers: workers.values().filter(|w| !w.slots.is_empty()).count(),
            max_per_worker: self.config.max_connections_per_worker,
            ..PoolStats::default()
        };
        for slot in workers.values().flat_map(|w| w.slots.iter()) {
            stats.total_connections += 1;
            if slot.in_use {
                stats.active_connections += 1;
            } else {
                stats.idle_connections += 1;
            }
        }
        stats
    }

    /// Close every connection and refuse further `get` calls
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<(String, Arc<dyn WorkerConnection>)> = self
            .workers
            .write()
            .drain()
            .flat_map(|(id, entry)| entry.slots.into_iter().map(move |s| (id.clone(), s.connection)))
            .collect();
        for (worker_id, connection) in drained {
            connection.close();
            self.publish_eviction(&worker_id, "closed");
        }
    }

    fn publish_eviction(&self, worker_id: &str, reason: &str) {
        self.events.publish(
            Event::new(EventType::ConnectionEvicted, format!("Connection to {} evicted ({})", worker_id, reason))
                .with_data("worker_id", worker_id)
                .with_data("reason", reason),
        );
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool").field("stats", &self.stats()).finish()
    }
}
