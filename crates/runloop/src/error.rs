use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunLoopError {
    #[error("no run loop is initialized on the current thread")]
    NoRunLoop,

    #[error("{component} used before initialization")]
    NotInitialized { component: &'static str },

    #[error("timer runtime unavailable: {reason}")]
    Runtime { reason: String },
}

impl RunLoopError {
    pub fn not_initialized(component: &'static str) -> Self {
        Self::NotInitialized { component }
    }

    pub fn runtime<S: ToString>(str: S) -> Self {
        Self::Runtime { reason: str.to_string() }
    }
}
