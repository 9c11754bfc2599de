pub mod config;
pub mod cost;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod pricing;
pub mod proxy;
pub mod server;
pub mod storage;
pub mod tokens;
pub mod translate;

pub use config::GatewayConfig;
pub use error::{ProxyError, Result};
pub use logging::SharedLogger;
pub use server::{build_router, AppState};
pub use storage::SqliteStore;
