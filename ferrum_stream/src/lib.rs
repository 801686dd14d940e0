pub mod api;
pub mod config;
pub mod core;
pub mod framework;

pub mod proto {
    tonic::include_proto!("ferrum_stream.v1");
}

#[cfg(test)]
#[path = "tests/tests.rs"]
mod tests;
