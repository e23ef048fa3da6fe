use std::sync::Arc;

use crate::pipeline::Pipeline;
use crate::release::ReleaseStore;
use crate::storage::Pool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub pipeline: Arc<Pipeline>,
    pub releases: ReleaseStore,
}

impl AppState {
    pub fn new(pool: Pool, pipeline: Pipeline) -> Self {
        Self {
            releases: ReleaseStore::new(pool.clone()),
            pipeline: Arc::new(pipeline),
            pool,
        }
    }
}
