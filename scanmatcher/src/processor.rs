//! Per-scan orchestration: bootstrap, refinement, gating and map update.

use std::time::Instant;

use nalgebra::{Matrix3, Point2};
use tracing::{info, warn};

use common::{math::angle_diff, robot::Pose, PerfStats};

use crate::{
    covariance,
    error::{Error, Result},
    grid::map::OccupancyGridMap,
    icp::{self, IcpParameters},
    optimizer::Optimizer,
    params::{MatchingParameters, RegistrationParameters, ScanMatcherConfig},
    reading::{RangeReading, SensorMap},
    score::{LikelihoodField, Scorer},
};

/// Maximum translation between the grid-based pose and the ICP pose for
/// the ICP result to be adopted.
const ICP_LINEAR_AGREEMENT: f64 = 0.05;

/// Maximum heading difference for the ICP result to be adopted, in radians.
const ICP_ANGULAR_AGREEMENT: f64 = 0.05;

/// How a scan registration was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The score cleared the registration threshold.
    Accepted,

    /// The score fell between the critical and the registration threshold;
    /// the refined pose is kept but flagged.
    LowConfidence,

    /// The score fell below the critical threshold; the refinement was
    /// discarded in favor of the odometry-composed pose. The scan still
    /// counts and the map still advances.
    Failed,
}

/// Result of processing one scan.
#[derive(Debug, Clone, Copy)]
pub struct ScanMatch {
    /// The accepted pose.
    pub pose: Pose,

    /// Likelihood score of the refined pose. Zero for the bootstrap scan.
    pub score: f64,

    pub registration: Registration,

    /// Curvature-based covariance of the accepted pose, when requested and
    /// available.
    pub covariance: Option<Matrix3<f64>>,
}

/// Incremental scan-to-map registration.
///
/// Owns the occupancy map exclusively; all mutation happens inside
/// [`process_scan`](Self::process_scan), which is expected to be driven
/// from a single scan-acquisition feed. The optimizer sweep only ever
/// borrows the map immutably, the map update afterwards takes the
/// exclusive borrow, so the read-phase/write-phase separation is enforced
/// at compile time.
pub struct ScanMatcherProcessor {
    map: OccupancyGridMap,
    matching: MatchingParameters,
    registration: RegistrationParameters,
    max_move: f64,
    use_icp: bool,
    icp_params: IcpParameters,
    sensors: SensorMap,

    // state
    first_scan_pending: bool,
    pose: Pose,
    odo_pose: Pose,
    scan_count: usize,
    stats: PerfStats,
}

impl ScanMatcherProcessor {
    /// Allocates a fresh map over the given world rectangle.
    pub fn new(
        xmin: f64,
        ymin: f64,
        xmax: f64,
        ymax: f64,
        delta: f64,
        patch_delta: f64,
    ) -> Result<Self> {
        let map = OccupancyGridMap::new(xmin, ymin, xmax, ymax, delta, patch_delta)?;
        Ok(Self::with_map(map))
    }

    /// Starts from a supplied (possibly pre-built) map.
    pub fn with_map(map: OccupancyGridMap) -> Self {
        Self {
            map,
            matching: MatchingParameters::default(),
            registration: RegistrationParameters::default(),
            max_move: 1.0,
            use_icp: false,
            icp_params: IcpParameters::default(),
            sensors: SensorMap::new(),
            first_scan_pending: true,
            pose: Pose::identity(),
            odo_pose: Pose::identity(),
            scan_count: 0,
            stats: PerfStats::new(),
        }
    }

    /// Re-arms the processor: clears the map and all pose state, so the
    /// next scan bootstraps again.
    pub fn init(&mut self) {
        self.map.clear();
        self.pose = Pose::identity();
        self.odo_pose = Pose::identity();
        self.first_scan_pending = true;
        self.scan_count = 0;
        self.stats.reset();
    }

    /// Registers the sensors allowed to feed the processor. Must precede
    /// [`process_scan`](Self::process_scan) for each sensor name.
    pub fn set_sensor_map(&mut self, sensors: SensorMap) {
        self.sensors = sensors;
    }

    pub fn set_matching_parameters(&mut self, params: MatchingParameters) -> Result<()> {
        params.validate()?;
        self.matching = params;
        Ok(())
    }

    pub fn set_registration_parameters(&mut self, params: RegistrationParameters) -> Result<()> {
        params.validate()?;
        self.registration = params;
        Ok(())
    }

    pub fn set_max_move(&mut self, max_move: f64) -> Result<()> {
        if !(max_move > 0.0 && max_move.is_finite()) {
            return Err(Error::configuration("maxMove must be positive"));
        }
        self.max_move = max_move;
        Ok(())
    }

    pub fn set_use_icp(&mut self, use_icp: bool) {
        self.use_icp = use_icp;
    }

    /// Applies the flat configuration key set in one go.
    pub fn configure(&mut self, config: &ScanMatcherConfig) -> Result<()> {
        config.validate()?;
        self.matching = config.matching();
        self.registration = config.registration();
        self.max_move = config.max_move;
        self.use_icp = config.use_icp;
        Ok(())
    }

    /// The last accepted pose.
    pub fn pose(&self) -> Pose {
        self.pose
    }

    /// Read-only view of the map, for an external publisher.
    pub fn map(&self) -> &OccupancyGridMap {
        &self.map
    }

    pub fn scan_count(&self) -> usize {
        self.scan_count
    }

    /// Per-scan processing time statistics.
    pub fn stats(&mut self) -> &mut PerfStats {
        &mut self.stats
    }

    /// Registers one scan against the map.
    ///
    /// The first scan after construction or [`init`](Self::init) is
    /// accepted verbatim with no gating. Afterwards the odometry delta
    /// seeds a hill-climbing refinement whose score decides acceptance:
    /// at or above `regScore` the pose is accepted, between `critScore`
    /// and `regScore` it is accepted but flagged, below `critScore` the
    /// refinement is discarded for the odometry-composed pose. In every
    /// outcome the map advances and the scan counts.
    pub fn process_scan(&mut self, reading: &RangeReading) -> Result<ScanMatch> {
        let started = Instant::now();

        let Some(sensor) = self.sensors.get(reading.sensor()) else {
            return Err(Error::validation(format!(
                "sensor {:?} is not registered",
                reading.sensor()
            )));
        };
        if sensor.beam_count != reading.beams().len() {
            return Err(Error::validation(format!(
                "sensor {:?} expects {} beams, reading carries {}",
                reading.sensor(),
                sensor.beam_count,
                reading.beams().len()
            )));
        }

        if self.first_scan_pending {
            info!(pose = ?reading.pose(), "bootstrapping map from first scan");
            self.map.update(
                reading,
                reading.pose(),
                self.matching.usable_range,
                self.matching.max_range,
            );
            self.pose = reading.pose();
            self.odo_pose = reading.pose();
            self.first_scan_pending = false;
            self.scan_count += 1;
            self.stats.update(started.elapsed());

            return Ok(ScanMatch {
                pose: self.pose,
                score: 0.0,
                registration: Registration::Accepted,
                covariance: None,
            });
        }

        let scorer = LikelihoodField::new(&self.matching);
        let optimizer = Optimizer::new(self.matching, scorer);

        // compose the odometry motion since the last scan onto the last
        // accepted pose to seed the search
        let odometry_delta = reading.pose().relative_to(&self.odo_pose);
        let guess = self.pose.compose(&odometry_delta);

        let refined = optimizer.refine(reading, guess, &self.map);
        let score = refined.score;
        let mut pose = refined.pose;

        let moved = pose.translation_distance(&self.pose);
        if moved > self.max_move {
            warn!(
                moved,
                limit = self.max_move,
                "refinement moved too far, keeping the odometry estimate"
            );
            pose = guess;
        }

        let registration = if score >= self.registration.reg_score {
            Registration::Accepted
        } else if score >= self.registration.crit_score {
            warn!(score, "low-confidence registration");
            Registration::LowConfidence
        } else {
            warn!(
                score,
                crit_score = self.registration.crit_score,
                "registration failed, falling back to odometry"
            );
            pose = guess;
            Registration::Failed
        };

        if self.use_icp && registration != Registration::Failed {
            if let Some(validated) = self.validate_with_icp(reading, pose) {
                pose = validated;
            }
        }

        let covariance = if self.matching.compute_covariance {
            let shrink = 0.5_f64.powi(self.matching.iterations as i32);
            covariance::from_score_surface(
                pose,
                self.matching.linear_step * shrink,
                self.matching.angular_step * shrink,
                |p| scorer.score(&self.map, reading, p),
            )
        } else {
            None
        };

        self.map.update(
            reading,
            pose,
            self.matching.usable_range,
            self.matching.max_range,
        );
        self.pose = pose;
        self.odo_pose = reading.pose();
        self.scan_count += 1;
        self.stats.update(started.elapsed());

        Ok(ScanMatch {
            pose,
            score,
            registration,
            covariance,
        })
    }

    /// Secondary ICP pass against the occupied cells around the pose. The
    /// result is adopted only when it agrees with the grid-based pose
    /// within fixed tolerances; it never changes the gating outcome.
    fn validate_with_icp(&self, reading: &RangeReading, pose: Pose) -> Option<Pose> {
        let reference = self
            .map
            .occupied_points(Point2::new(pose.x, pose.y), self.matching.usable_range);
        let points: Vec<Point2<f64>> = reading
            .beams()
            .iter()
            .filter(|b| b.distance > 0.0 && b.distance <= self.matching.usable_range)
            .map(|b| Pose::identity().project(b.angle, b.distance))
            .collect();

        let validated = icp::align(&points, &reference, pose, self.icp_params)?;

        let agrees = validated.translation_distance(&pose) <= ICP_LINEAR_AGREEMENT
            && angle_diff(pose.theta, validated.theta).abs() <= ICP_ANGULAR_AGREEMENT;
        agrees.then_some(validated)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    use crate::reading::{sensor_map, Beam, RangeSensor, DEFAULT_SENSOR};

    use super::*;

    const BEAMS: usize = 8;

    /// Ranges of a fixed 3m world ring around the origin, as measured from
    /// `true_pose`, attached to the odometry estimate `odo_pose`.
    fn ring_reading(odo_pose: Pose, true_pose: Pose) -> RangeReading {
        let mut polar: Vec<(f64, f64)> = (0..BEAMS)
            .map(|i| {
                let angle = -PI + (i as f64 + 0.5) * 2.0 * PI / BEAMS as f64;
                let target = Pose::identity().project(angle, 3.0);
                let dx = target.x - true_pose.x;
                let dy = target.y - true_pose.y;
                (
                    common::math::normalize_angle(dy.atan2(dx) - true_pose.theta),
                    dx.hypot(dy),
                )
            })
            .collect();
        polar.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

        let beams = polar
            .into_iter()
            .map(|(angle, distance)| Beam { angle, distance })
            .collect();
        RangeReading::new(DEFAULT_SENSOR, 0.0, odo_pose, beams).unwrap()
    }

    /// Processor over the end-to-end geometry with thresholds scaled to
    /// the 8-beam ring (perfect fit scores 8).
    fn ring_processor() -> ScanMatcherProcessor {
        let mut processor =
            ScanMatcherProcessor::new(-10.0, -10.0, 10.0, 10.0, 0.05, 1.0).unwrap();
        processor.set_sensor_map(sensor_map([RangeSensor::new(DEFAULT_SENSOR, BEAMS)]));
        processor
            .set_registration_parameters(RegistrationParameters {
                reg_score: 4.0,
                crit_score: 2.0,
            })
            .unwrap();
        processor
    }

    fn assert_pose_near(pose: Pose, x: f64, y: f64, theta: f64, lin: f64, ang: f64) {
        assert_relative_eq!(pose.x, x, epsilon = lin);
        assert_relative_eq!(pose.y, y, epsilon = lin);
        assert!(angle_diff(pose.theta, theta).abs() <= ang);
    }

    #[test]
    fn first_scan_is_accepted_verbatim() {
        let mut processor = ring_processor();
        let pose = Pose::new(2.0, -1.0, 0.7);
        let reading = ring_reading(pose, pose);

        let result = processor.process_scan(&reading).unwrap();

        assert_eq!(result.registration, Registration::Accepted);
        assert_relative_eq!(result.pose.x, pose.x);
        assert_relative_eq!(result.pose.y, pose.y);
        assert_relative_eq!(result.pose.theta, pose.theta);
        assert_eq!(processor.scan_count(), 1);
        assert!(processor.map().allocated_patches() > 0);
    }

    #[test]
    fn unregistered_sensor_is_rejected_without_mutation() {
        let mut processor = ring_processor();
        let reading = RangeReading::new(
            "RLASER",
            0.0,
            Pose::identity(),
            vec![Beam {
                angle: 0.0,
                distance: 1.0,
            }],
        )
        .unwrap();

        let result = processor.process_scan(&reading);
        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(processor.scan_count(), 0);
        assert_eq!(processor.map().allocated_patches(), 0);
    }

    #[test]
    fn beam_count_mismatch_is_rejected() {
        let mut processor = ring_processor();
        let reading = RangeReading::new(
            DEFAULT_SENSOR,
            0.0,
            Pose::identity(),
            vec![Beam {
                angle: 0.0,
                distance: 1.0,
            }],
        )
        .unwrap();

        assert!(matches!(
            processor.process_scan(&reading),
            Err(Error::Validation(_))
        ));
        assert_eq!(processor.scan_count(), 0);
    }

    #[test]
    fn tracks_a_small_displacement_end_to_end() {
        let mut processor = ring_processor();

        let first = ring_reading(Pose::identity(), Pose::identity());
        processor.process_scan(&first).unwrap();

        let moved = Pose::new(0.1, 0.0, 0.0);
        let second = ring_reading(moved, moved);
        let result = processor.process_scan(&second).unwrap();

        assert_eq!(result.registration, Registration::Accepted);
        // within 1cm / 1 degree of the true displacement
        assert_pose_near(result.pose, 0.1, 0.0, 0.0, 0.01, 1.0_f64.to_radians());
        assert_pose_near(processor.pose(), 0.1, 0.0, 0.0, 0.01, 1.0_f64.to_radians());
        assert_eq!(processor.scan_count(), 2);
    }

    #[test]
    fn drifted_odometry_is_corrected() {
        let mut processor = ring_processor();

        processor
            .process_scan(&ring_reading(Pose::identity(), Pose::identity()))
            .unwrap();

        // the robot moved 10cm, odometry only noticed 6cm
        let second = ring_reading(Pose::new(0.06, 0.0, 0.0), Pose::new(0.1, 0.0, 0.0));
        let result = processor.process_scan(&second).unwrap();

        assert_eq!(result.registration, Registration::Accepted);
        assert_pose_near(result.pose, 0.1, 0.0, 0.0, 0.02, 2.0_f64.to_radians());
    }

    #[test]
    fn middling_scores_are_flagged_low_confidence() {
        let mut processor = ring_processor();
        processor
            .set_registration_parameters(RegistrationParameters {
                reg_score: 1000.0,
                crit_score: 2.0,
            })
            .unwrap();

        processor
            .process_scan(&ring_reading(Pose::identity(), Pose::identity()))
            .unwrap();
        let moved = Pose::new(0.1, 0.0, 0.0);
        let result = processor.process_scan(&ring_reading(moved, moved)).unwrap();

        assert_eq!(result.registration, Registration::LowConfidence);
        // the refined pose is still used
        assert_pose_near(result.pose, 0.1, 0.0, 0.0, 0.01, 1.0_f64.to_radians());
    }

    #[test]
    fn failed_registration_falls_back_to_odometry_and_still_advances() {
        let mut processor = ring_processor();
        processor
            .set_registration_parameters(RegistrationParameters {
                reg_score: 1e6,
                crit_score: 1e6,
            })
            .unwrap();

        processor
            .process_scan(&ring_reading(Pose::identity(), Pose::identity()))
            .unwrap();

        let moved = Pose::new(0.1, 0.0, 0.0);
        let result = processor.process_scan(&ring_reading(moved, moved)).unwrap();

        assert_eq!(result.registration, Registration::Failed);
        // the odometry-composed pose is kept verbatim
        assert_pose_near(result.pose, 0.1, 0.0, 0.0, 1e-9, 1e-9);
        // the scan still counted and the map still advanced
        assert_eq!(processor.scan_count(), 2);
    }

    #[test]
    fn runaway_refinement_is_clamped_to_max_move() {
        let mut processor = ring_processor();
        processor.set_max_move(0.01).unwrap();

        processor
            .process_scan(&ring_reading(Pose::identity(), Pose::identity()))
            .unwrap();

        // odometry reports no motion, but the scan geometry says 10cm: the
        // refinement would jump beyond maxMove and must be discarded
        let second = ring_reading(Pose::identity(), Pose::new(0.1, 0.0, 0.0));
        let result = processor.process_scan(&second).unwrap();

        assert!(result.pose.translation_distance(&Pose::identity()) <= 0.01);
    }

    #[test]
    fn covariance_is_estimated_on_request() {
        let mut processor = ring_processor();
        processor
            .set_matching_parameters(MatchingParameters {
                compute_covariance: true,
                ..MatchingParameters::default()
            })
            .unwrap();

        processor
            .process_scan(&ring_reading(Pose::identity(), Pose::identity()))
            .unwrap();
        let moved = Pose::new(0.1, 0.0, 0.0);
        let result = processor.process_scan(&ring_reading(moved, moved)).unwrap();

        let covariance = result.covariance.expect("covariance requested");
        for i in 0..3 {
            assert!(covariance[(i, i)] > 0.0);
        }
    }

    #[test]
    fn icp_validation_keeps_agreeing_results() {
        let mut processor = ring_processor();
        processor.set_use_icp(true);

        processor
            .process_scan(&ring_reading(Pose::identity(), Pose::identity()))
            .unwrap();
        let moved = Pose::new(0.1, 0.0, 0.0);
        let result = processor.process_scan(&ring_reading(moved, moved)).unwrap();

        assert_eq!(result.registration, Registration::Accepted);
        assert_pose_near(result.pose, 0.1, 0.0, 0.0, 0.01, 1.0_f64.to_radians());
    }

    #[test]
    fn init_rearms_the_bootstrap() {
        let mut processor = ring_processor();
        processor
            .process_scan(&ring_reading(Pose::identity(), Pose::identity()))
            .unwrap();
        assert_eq!(processor.scan_count(), 1);

        processor.init();
        assert_eq!(processor.scan_count(), 0);
        assert_eq!(processor.map().allocated_patches(), 0);

        // the next scan bootstraps again, accepted verbatim
        let pose = Pose::new(1.0, 1.0, 0.3);
        let result = processor.process_scan(&ring_reading(pose, pose)).unwrap();
        assert_eq!(result.registration, Registration::Accepted);
        assert_relative_eq!(result.pose.x, 1.0);
    }

    #[test]
    fn configure_applies_the_flat_key_set() {
        let mut processor = ring_processor();
        let config = ScanMatcherConfig {
            max_move: 0.5,
            use_icp: true,
            reg_score: 10.0,
            crit_score: 5.0,
            ..ScanMatcherConfig::default()
        };

        processor.configure(&config).unwrap();

        let bad = ScanMatcherConfig {
            reg_score: 1.0,
            crit_score: 5.0,
            ..ScanMatcherConfig::default()
        };
        assert!(matches!(
            processor.configure(&bad),
            Err(Error::Configuration(_))
        ));
    }
}
