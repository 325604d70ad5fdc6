pub mod connection;
pub mod schema;
pub mod queries;

pub use connection::*;
pub use schema::*;
pub use queries::*;
