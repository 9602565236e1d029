pub mod loader;
pub mod schema;

pub use loader::{extract, figment, load_from_path, validate};
pub use schema::ClientConfig;
