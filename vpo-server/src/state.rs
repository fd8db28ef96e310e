//! Shared daemon state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use vpo_core::{Config, DataDir, JobQueue, Store, ToolRegistry};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub data_dir: DataDir,
    pub registry: Arc<ToolRegistry>,
    pub store: Store,
    pub queue: JobQueue,
    shutdown: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(
        config: Config,
        data_dir: DataDir,
        registry: Arc<ToolRegistry>,
        store: Store,
    ) -> Self {
        let queue = JobQueue::new(store.clone());
        Self {
            config: Arc::new(config),
            data_dir,
            registry,
            store,
            queue,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("data_dir", &self.data_dir.root())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
