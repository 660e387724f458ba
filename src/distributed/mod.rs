/*!
 * Remote workers: connections, discovery, version control and routing.
 *
 * - `worker_pool`: bounded, reusable SSH connections per worker
 * - `pairing`: discovery and pairing of the HTTP services on workers
 * - `version_manager`: version gating, drift alerts, updates and rollback
 * - `signing` / `update_package`: signed tar.gz update packages
 * - `alerts`: drift alert history and delivery channels
 * - `coordinator`: round-robin translation across remote instances
 */

pub mod alerts;
pub mod coordinator;
pub mod pairing;
pub mod signing;
pub mod update_package;
pub mod version_manager;
pub mod worker_pool;

pub use alerts::{AlertChannel, AlertManager, DriftAlert, Severity, WebhookAlertChannel};
pub use coordinator::{DistributedCoordinator, RemoteInstance};
pub use pairing::{Capabilities, PairingManager, RemoteService, ServiceStatus};
pub use version_manager::{BatchUpdateResult, HealthStatus, VersionInfo, VersionManager, VersionMetrics};
pub use worker_pool::{ConnectionLease, Connector, PoolStats, WorkerConnection, WorkerPool};
