use std::collections::HashMap;
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::Mutex;

use crate::engine::{Engine, RunHandle};
use crate::plan::RunId;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub server_id: String,
    /// Handles of runs still executing.
    pub active: Arc<Mutex<HashMap<RunId, RunHandle>>>,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        Self {
            engine,
            server_id: format!("loadplane-{suffix}"),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}
