pub mod cache;
pub mod config;
pub mod discovery;
pub mod logging;
pub mod model;
pub mod orchestrator;
pub mod protocol;
pub mod reconciler;
pub mod runtime;
pub mod windows_enum;
pub mod worker;
pub mod worker_session;
