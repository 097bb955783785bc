pub mod codex;
pub mod config;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod router;
pub mod schema;
pub mod server;
pub mod store;
pub mod stream_safety;
pub mod tool_id;
pub mod translate;
pub mod upstream;

pub use config::GatewayConfig;
pub use credentials::CredentialManager;
pub use error::{GatewayError, Result};
pub use logging::SharedLogger;
pub use router::ModelRouter;
pub use server::{build_router, AppState};
