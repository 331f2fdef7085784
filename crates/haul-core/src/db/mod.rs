//! Database module - SQLite persistence layer

mod connection;
mod resume;
mod settings;

pub use connection::{get_db_path, init_database, open_database, open_in_memory, Database};
pub use resume::SqliteResumeStore;
pub use settings::SettingsDb;
