use crate::storage::TaskRepo;
use crate::submit::SubmitService;

/// Shared handler state. Both members clone cheaply around the same pool.
#[derive(Clone)]
pub struct AppState {
    pub repo: TaskRepo,
    pub submit: SubmitService,
}
