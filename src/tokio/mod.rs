//! Asynchronous client using Tokio.

mod conn;
mod dispatcher;
mod pool;
mod session;

pub use conn::{Connection, ConnectionState};
pub use pool::{Pool, PoolStatus, PooledConnection};
