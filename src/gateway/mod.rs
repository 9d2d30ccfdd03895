//! Public side: turns HTTP requests into records and waits for their responses.

pub mod context;
mod handler;

pub use handler::handle_request;
