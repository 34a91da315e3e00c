pub mod connection_string;
pub mod connections;
pub mod ssh;

pub use connection_string::{extract_host_port, rewrite};
pub use connections::{Connection, Route, open_route, open_route_with};
