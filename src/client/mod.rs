//! Client transport: a persistent connection to the detection server with
//! lockstep frame/result exchange and bounded reconnect backoff.

mod backoff;
mod connector;
mod fps;
mod manager;

pub use backoff::BackoffPolicy;
pub use connector::{Closer, Connection, Connector, TcpConnector};
pub use fps::FpsMeter;
pub use manager::{ConnectionManager, ConnectionState, Sleeper};
