pub mod errors;
pub mod server;
