// HTTP endpoints for publishers and operators
pub mod routes;

pub use routes::{publish_event, stats};
