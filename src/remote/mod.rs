pub mod hub;
pub mod registry;
pub mod routes;
pub mod server;
