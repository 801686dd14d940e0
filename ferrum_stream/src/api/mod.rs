pub mod datum;
pub mod map;
pub mod reduce;
