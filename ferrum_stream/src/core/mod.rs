pub mod callback;
pub mod dedup;
pub mod driver;
pub mod emitter;
pub mod mapper;
pub mod readiness;
pub mod registry;
pub mod router;
pub mod service;
