//! Blocking PostgreSQL client.

mod conn;
mod stream;

pub use conn::{Conn, PgConnector};
pub use stream::Stream;
