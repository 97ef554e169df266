//! Incremental pose estimation and occupancy mapping from 2D laser scans.
//!
//! Each incoming [`reading::RangeReading`] is registered against the map
//! built from all previously accepted scans: the odometry estimate seeds a
//! hill-climbing search ([`optimizer`]) over a likelihood field ([`score`]),
//! the result is gated by score thresholds, and the map ([`grid`]) is
//! advanced with the accepted pose. Orchestrated by
//! [`processor::ScanMatcherProcessor`].

pub mod covariance;
pub mod error;
pub mod grid;
pub mod icp;
pub mod optimizer;
pub mod params;
pub mod pipeline;
pub mod processor;
pub mod reading;
pub mod score;

pub use error::Error;
pub use processor::{Registration, ScanMatch, ScanMatcherProcessor};
