pub mod config;
pub mod handlers;
pub mod observability;
pub mod server;
pub mod storage;
pub mod websocket;

pub use config::{AppConfig, FhirSettings, LoggingConfig, ServerConfig};
pub use observability::{init_tracing, spawn_delivery_logger};
pub use server::{AppState, OctofhirServer, ServerBuilder, build_app, router};
pub use storage::{InMemoryStore, StoredResource};
