pub mod connection;
pub mod protocol;
pub mod statement;
pub mod types;

pub use connection::{ReplicationConnection, SystemInfo};
pub use statement::{OperationStatement, RawParam};
pub use types::{SqlType, SqlValue, TestSchema};
