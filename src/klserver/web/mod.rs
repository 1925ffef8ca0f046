pub mod handlers;
pub mod response;
pub mod server;

pub use server::{build_router, serve, start_web_server};
