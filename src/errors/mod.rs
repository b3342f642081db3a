//! Error handling for the xg2g streaming core
//!
//! The taxonomy follows the subsystem boundaries: upstream fetch, transcoder
//! runner, session FSM, filesystem sandbox, durable store, decision engine,
//! and auth. `AppError` is the top-level type the web layer maps onto
//! RFC-7807 problem details.

pub mod types;

pub use types::{
    AppError, AuthError, DecisionError, FsError, FsmError, OrchestratorError, RunnerError,
    StoreError, UpstreamError,
};

/// Convenience result type used throughout the application
pub type AppResult<T> = Result<T, AppError>;
