pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod pool;
pub mod proxy;
pub mod server;
pub mod translate;
pub mod upload;

pub use cache::AttachmentCache;
pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use logging::SharedLogger;
pub use pool::CredentialPool;
pub use server::{build_router, AppState};
pub use upload::Uploader;
