//! # Layer server
//!
//! Serves image layers out of the configured storage backend, using the
//! registry blob endpoints of the
//! [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec).
//!
//! ## Example
//!
//! ```no_run
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let app = layer_server::router(MemoryStorage::new().into());
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5000").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod error;
mod http;

pub use config::{BackendKind, Config, ConfigError};
pub use error::{LayerError, LayerResult};
pub use http::router;
