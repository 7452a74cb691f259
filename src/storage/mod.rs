//! Record store and server directory backends
//!
//! The control loop only depends on the [`RecordStore`] and [`ServerDirectory`]
//! traits, so backends can be swapped without touching the loop itself.
//!
//! ## Backends
//!
//! - **SQLite** (default): Embedded database with WAL mode
//! - **In-Memory**: No persistence, for tests or throwaway deployments
//!
//! ## Usage
//!
//! ```no_run
//! use guardia::storage::{RecordStore, sqlite::SqliteStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = SqliteStore::new("./guardia.db").await?;
//!     let health = store.health_check().await?;
//!     println!("{}", health.message);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{HealthStatus, RecordStore, ServerDirectory, StatusUpdate};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
