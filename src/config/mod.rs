pub mod types;
pub mod loader;
pub mod schema;

pub use types::*;
pub use loader::*;
pub use schema::*;
