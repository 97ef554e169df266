pub mod map;
pub mod ray;

pub use map::{MapSnapshot, OccupancyGridMap};
