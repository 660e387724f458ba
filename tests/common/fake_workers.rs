/*!
 * In-memory worker connections for pool and pairing tests
 */

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use ebook_translator::app_config::WorkerDescriptor;
use ebook_translator::distributed::worker_pool::{Connector, WorkerConnection};
use ebook_translator::errors::TranslationError;

#[derive(Debug)]
pub struct FakeConnection {
    worker_id: String,
    alive: AtomicBool,
    closed: AtomicBool,
}

impl FakeConnection {
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl WorkerConnection for FakeConnection {
    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.is_closed()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector that hands out `FakeConnection`s and remembers them
#[derive(Default)]
pub struct FakeConnector {
    dials: AtomicUsize,
    refuse: AtomicBool,
    hang: AtomicBool,
    opened: Mutex<Vec<Arc<FakeConnection>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Make later dials never complete
    pub fn hang_connections(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn opened(&self) -> Vec<Arc<FakeConnection>> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, worker: &WorkerDescriptor) -> Result<Arc<dyn WorkerConnection>, TranslationError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TranslationError::Connection(format!("{} refused the connection", worker.host)));
        }
        let connection = Arc::new(FakeConnection {
            worker_id: worker.id.clone(),
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        });
        self.opened.lock().push(connection.clone());
        Ok(connection)
    }
}
