//! Explicit collaborators around the processor.
//!
//! The surrounding application used to wire the matcher through a global
//! message dispatcher; here the two seams are explicit traits injected
//! into a small driver: a [`ReadingSource`] feeding scans in and a
//! [`PoseSink`] consuming poses and map snapshots.

use anyhow::Result;

use crate::{
    grid::map::MapSnapshot,
    processor::{ScanMatch, ScanMatcherProcessor},
    reading::RangeReading,
};

/// Supplies readings at scan rate. The sensor driver's acquisition thread
/// lives behind this trait; acquisition timing is not managed here.
pub trait ReadingSource {
    /// The next reading, or `None` once the feed is exhausted.
    fn next_reading(&mut self) -> Option<RangeReading>;
}

/// Consumes the per-scan outputs, e.g. a map publisher.
pub trait PoseSink {
    fn pose_updated(&mut self, scan: &ScanMatch);

    fn map_updated(&mut self, _snapshot: MapSnapshot) {}
}

/// Drives the processor from a reading source into a sink, one scan at a
/// time.
pub struct ScanPipeline<S, K> {
    source: S,
    sink: K,
    processor: ScanMatcherProcessor,
}

impl<S, K> ScanPipeline<S, K>
where
    S: ReadingSource,
    K: PoseSink,
{
    pub fn new(source: S, sink: K, processor: ScanMatcherProcessor) -> Self {
        Self {
            source,
            sink,
            processor,
        }
    }

    /// Processes a single reading. Returns `false` when the source is
    /// exhausted.
    pub fn spin_once(&mut self) -> Result<bool> {
        let Some(reading) = self.source.next_reading() else {
            return Ok(false);
        };

        let scan = self.processor.process_scan(&reading)?;
        self.sink.pose_updated(&scan);
        self.sink.map_updated(self.processor.map().snapshot());

        Ok(true)
    }

    /// Runs until the source is exhausted and returns the number of scans
    /// processed.
    pub fn run(&mut self) -> Result<usize> {
        let mut processed = 0;
        while self.spin_once()? {
            processed += 1;
        }
        Ok(processed)
    }

    pub fn processor(&self) -> &ScanMatcherProcessor {
        &self.processor
    }
}
