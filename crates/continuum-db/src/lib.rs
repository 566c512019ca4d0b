pub mod config;
pub mod error;
pub mod models;
pub mod notify;
pub mod pool;
pub mod queries;

pub use config::DbConfig;
pub use error::StoreError;
pub use models::{Code, Task, TaskStatus};
pub use notify::{subscribe_changes, ChangeNotification};
pub use pool::{create_pool, default_migrations_path, ensure_database_exists, run_migrations};
