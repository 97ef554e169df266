//! Likelihood scoring of a candidate pose against a map.

use common::robot::Pose;

use crate::{grid::map::OccupancyGridMap, params::MatchingParameters, reading::RangeReading};

/// Scores how well a reading, projected through a candidate pose, fits a
/// map. Higher is better. Implementations must be pure: identical inputs
/// yield identical scores, and scoring never mutates the map.
pub trait Scorer<M> {
    fn score(&self, map: &M, reading: &RangeReading, pose: Pose) -> f64;
}

/// Likelihood-field scorer.
///
/// Each beam within the usable range projects its endpoint through the
/// candidate pose; the squared distance to the nearest occupied cell's mean
/// hit position, searched within a square kernel window, feeds a Gaussian
/// falloff `exp(-d2 / sigma)` that is summed over all beams.
#[derive(Debug, Clone, Copy)]
pub struct LikelihoodField {
    sigma: f64,
    kernel_size: i32,
    usable_range: f64,
}

impl LikelihoodField {
    pub fn new(params: &MatchingParameters) -> Self {
        Self {
            sigma: params.sigma,
            kernel_size: params.kernel_size,
            usable_range: params.usable_range,
        }
    }
}

impl Scorer<OccupancyGridMap> for LikelihoodField {
    fn score(&self, map: &OccupancyGridMap, reading: &RangeReading, pose: Pose) -> f64 {
        let kernel = i64::from(self.kernel_size);
        let mut total = 0.0;

        for beam in reading.beams() {
            if beam.distance <= 0.0 || beam.distance > self.usable_range {
                continue;
            }

            let endpoint = pose.project(beam.angle, beam.distance);
            let (cx, cy) = map.world_to_cell(endpoint);

            let mut best_sq_dist: Option<f64> = None;
            for dx in -kernel..=kernel {
                for dy in -kernel..=kernel {
                    let Some(cell) = map.cell(cx + dx, cy + dy) else {
                        continue;
                    };
                    if !cell.is_occupied() {
                        continue;
                    }
                    if let Some(mean) = cell.mean() {
                        let sq_dist = (endpoint - mean).norm_squared();
                        best_sq_dist =
                            Some(best_sq_dist.map_or(sq_dist, |best| best.min(sq_dist)));
                    }
                }
            }

            if let Some(sq_dist) = best_sq_dist {
                total += (-sq_dist / self.sigma).exp();
            }
        }

        total
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    use crate::reading::{Beam, RangeReading, DEFAULT_SENSOR};

    use super::*;

    fn ring_reading(pose: Pose, distance: f64) -> RangeReading {
        let beams = (0..8)
            .map(|i| Beam {
                angle: -PI + (i as f64 + 0.5) * PI / 4.0,
                distance,
            })
            .collect();
        RangeReading::new(DEFAULT_SENSOR, 0.0, pose, beams).unwrap()
    }

    fn params() -> MatchingParameters {
        MatchingParameters::default()
    }

    #[test]
    fn empty_map_scores_zero() {
        let map = OccupancyGridMap::new(-10.0, -10.0, 10.0, 10.0, 0.05, 1.0).unwrap();
        let reading = ring_reading(Pose::identity(), 3.0);
        let scorer = LikelihoodField::new(&params());

        assert_relative_eq!(scorer.score(&map, &reading, Pose::identity()), 0.0);
    }

    #[test]
    fn matching_pose_beats_offset_pose() {
        let mut map = OccupancyGridMap::new(-10.0, -10.0, 10.0, 10.0, 0.05, 1.0).unwrap();
        let reading = ring_reading(Pose::identity(), 3.0);
        map.update(&reading, Pose::identity(), 15.0, 20.0);

        let scorer = LikelihoodField::new(&params());
        let at_origin = scorer.score(&map, &reading, Pose::identity());
        let offset = scorer.score(&map, &reading, Pose::new(0.25, 0.0, 0.0));

        assert!(at_origin > offset);
        // all 8 endpoints coincide with their own hit cells
        assert_relative_eq!(at_origin, 8.0, epsilon = 1e-6);
    }

    #[test]
    fn beams_beyond_usable_range_are_ignored() {
        let mut map = OccupancyGridMap::new(-10.0, -10.0, 10.0, 10.0, 0.05, 1.0).unwrap();
        let reading = ring_reading(Pose::identity(), 3.0);
        map.update(&reading, Pose::identity(), 15.0, 20.0);

        let matching = MatchingParameters {
            usable_range: 2.0,
            ..MatchingParameters::default()
        };
        let scorer = LikelihoodField::new(&matching);
        assert_relative_eq!(scorer.score(&map, &reading, Pose::identity()), 0.0);
    }

    #[test]
    fn scoring_is_pure() {
        let mut map = OccupancyGridMap::new(-10.0, -10.0, 10.0, 10.0, 0.05, 1.0).unwrap();
        let reading = ring_reading(Pose::identity(), 3.0);
        map.update(&reading, Pose::identity(), 15.0, 20.0);

        let scorer = LikelihoodField::new(&params());
        let pose = Pose::new(0.02, -0.01, 0.005);
        let first = scorer.score(&map, &reading, pose);
        let second = scorer.score(&map, &reading, pose);
        assert_relative_eq!(first, second);
    }
}
