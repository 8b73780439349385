use std::sync::Arc;

use tracing::{info, warn};

use super::{
    arbitration::Arbiter,
    clock::{Clock, SystemClock},
    config::{Config, StoreBackend},
    database::RedisStore,
    memory::MemoryStore,
    scheduler::BackupScheduler,
    status::StatusReporter,
    store::{BackupStore, FleetListing, LiveSource, StoreError},
};

pub struct State {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn BackupStore>,
    pub arbiter: Arbiter,
    pub scheduler: Arc<BackupScheduler>,
    pub reporter: StatusReporter,
}

impl State {
    pub async fn new(config: Config) -> Result<Arc<Self>, StoreError> {
        let clock = Arc::new(SystemClock);

        match config.store_backend {
            StoreBackend::Redis => {
                info!("Connecting to Redis at {}", config.redis_url);
                let redis = Arc::new(RedisStore::connect(&config.redis_url).await?);

                Ok(Self::with_backends(
                    config,
                    redis.clone(),
                    redis.clone(),
                    redis,
                    clock,
                ))
            }
            StoreBackend::Memory => {
                warn!("Using in-memory store, backups will not survive a restart");
                let memory = Arc::new(MemoryStore::new());

                Ok(Self::with_backends(
                    config,
                    memory.clone(),
                    memory.clone(),
                    memory,
                    clock,
                ))
            }
        }
    }

    pub fn with_backends(
        config: Config,
        store: Arc<dyn BackupStore>,
        live: Arc<dyn LiveSource>,
        fleet: Arc<dyn FleetListing>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let policy = config.live_policy();

        let arbiter = Arbiter::new(store.clone(), live.clone(), clock.clone(), policy);
        let scheduler = Arc::new(BackupScheduler::new(
            store.clone(),
            live.clone(),
            fleet.clone(),
            clock.clone(),
            config.sweep_config(),
        ));
        let reporter = StatusReporter::new(store.clone(), live, fleet, clock.clone(), policy);

        Arc::new(Self {
            config,
            clock,
            store,
            arbiter,
            scheduler,
            reporter,
        })
    }
}
