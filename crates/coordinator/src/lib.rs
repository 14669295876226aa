//! AV1 farm coordinator
//!
//! Owns the persistent job queue and the RPC surface workers talk to. The
//! store is the single source of truth; the registry, scheduler, lifecycle
//! and event bus are thin layers that funnel every mutation through it.

pub mod events;
pub mod lifecycle;
pub mod registry;
pub mod safe_replace;
pub mod scan;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod sweeper;
pub mod transfer;

use std::sync::Arc;

use av1_farm_config::CoordinatorConfig;

use events::EventBus;
use lifecycle::JobLifecycle;
use registry::WorkerRegistry;
use scheduler::Scheduler;
use store::{Store, StoreError};
use transfer::UploadManager;

pub use server::router;
pub use store::{FileRecord, QueueStats};

/// Everything a request handler can reach.
pub struct AppState {
    pub config: CoordinatorConfig,
    pub store: Arc<Store>,
    pub registry: Arc<WorkerRegistry>,
    pub events: Arc<EventBus>,
    pub scheduler: Scheduler,
    pub lifecycle: JobLifecycle,
    pub uploads: UploadManager,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Build the coordinator from its config, opening the queue database.
    pub fn new(config: CoordinatorConfig) -> Result<SharedState, StoreError> {
        let store = Arc::new(Store::open(&config.db_path)?);
        Ok(Self::assemble(config, store))
    }

    /// Build against an already opened store (tests use an in-memory one).
    pub fn with_store(config: CoordinatorConfig, store: Arc<Store>) -> SharedState {
        Self::assemble(config, store)
    }

    fn assemble(config: CoordinatorConfig, store: Arc<Store>) -> SharedState {
        let registry = Arc::new(WorkerRegistry::new());
        let events = Arc::new(EventBus::default());
        let scheduler = Scheduler::new(
            store.clone(),
            registry.clone(),
            events.clone(),
            config.cluster.clone(),
        );
        let lifecycle = JobLifecycle::new(
            store.clone(),
            registry.clone(),
            events.clone(),
            config.cluster.clone(),
            config.progress_silence_timeout_s,
        );
        Arc::new(AppState {
            config,
            store,
            registry,
            events,
            scheduler,
            lifecycle,
            uploads: UploadManager::new(),
        })
    }
}
