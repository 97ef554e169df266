//! Gradient-free hill-climbing pose refinement.

use nalgebra::Matrix3;

use common::robot::Pose;

use crate::{params::MatchingParameters, reading::RangeReading, score::Scorer};

/// A map the optimizer can rebuild between registrations.
pub trait LocalMap {
    fn clear(&mut self);
    fn update(&mut self, reading: &RangeReading, pose: Pose, usable_range: f64, max_range: f64);
}

/// Outcome of a refinement: the best pose found and its score.
#[derive(Debug, Clone, Copy)]
pub struct MatchResult {
    pub pose: Pose,
    pub score: f64,
    pub covariance: Option<Matrix3<f64>>,
}

/// Hill-climbing search over the six-move lattice {±x, ±y, ±theta}.
///
/// Each inner sweep evaluates all six perturbations of the current best
/// pose and adopts the single best improvement; sweeps repeat until none
/// improves, then both step sizes halve and the outer counter advances.
/// After `iterations` halvings the search stops, which bounds the final
/// lattice precision by `linear_step * 2^-iterations` and
/// `angular_step * 2^-iterations`.
///
/// The search never fails: with a flat score surface it returns the
/// initial guess unchanged, and the best score is monotonically
/// non-decreasing throughout the run.
pub struct Optimizer<S> {
    params: MatchingParameters,
    scorer: S,
}

impl<S> Optimizer<S> {
    pub fn new(params: MatchingParameters, scorer: S) -> Self {
        Self { params, scorer }
    }

    /// Refines `initial` against an externally owned map.
    pub fn refine<M>(&self, reading: &RangeReading, initial: Pose, map: &M) -> MatchResult
    where
        S: Scorer<M>,
    {
        hill_climb(&self.params, initial, |pose| {
            self.scorer.score(map, reading, pose)
        })
    }

    /// Refines the relative pose between two whole readings.
    ///
    /// The older reading is integrated into `scratch` at the origin and the
    /// newer one is matched against it, starting from the odometry
    /// difference of the two attached poses.
    pub fn refine_relative<M>(
        &self,
        old: &RangeReading,
        new: &RangeReading,
        scratch: &mut M,
    ) -> MatchResult
    where
        S: Scorer<M>,
        M: LocalMap,
    {
        scratch.clear();
        scratch.update(
            old,
            Pose::identity(),
            self.params.usable_range,
            self.params.max_range,
        );

        let guess = new.pose().relative_to(&old.pose());
        let scratch = &*scratch;
        hill_climb(&self.params, guess, |pose| {
            self.scorer.score(scratch, new, pose)
        })
    }
}

fn moves(from: Pose, linear_step: f64, angular_step: f64) -> [Pose; 6] {
    [
        Pose::new(from.x + linear_step, from.y, from.theta),
        Pose::new(from.x - linear_step, from.y, from.theta),
        Pose::new(from.x, from.y + linear_step, from.theta),
        Pose::new(from.x, from.y - linear_step, from.theta),
        Pose::new(from.x, from.y, from.theta + angular_step),
        Pose::new(from.x, from.y, from.theta - angular_step),
    ]
}

fn hill_climb(
    params: &MatchingParameters,
    initial: Pose,
    score: impl Fn(Pose) -> f64,
) -> MatchResult {
    let mut best_pose = initial;
    let mut best_score = score(initial);

    let mut linear_step = params.linear_step;
    let mut angular_step = params.angular_step;
    let mut round = 0;

    while round < params.iterations {
        let mut sweep_pose = best_pose;
        let mut sweep_score = best_score;

        // keep sweeping at this step size as long as one of the six moves
        // improves on the current best
        loop {
            let mut candidate_pose = sweep_pose;
            let mut candidate_score = sweep_score;

            for pose in moves(sweep_pose, linear_step, angular_step) {
                let value = score(pose);
                if value > candidate_score {
                    candidate_score = value;
                    candidate_pose = pose;
                }
            }

            if candidate_score > sweep_score {
                sweep_score = candidate_score;
                sweep_pose = candidate_pose;
            } else {
                break;
            }
        }

        if sweep_score > best_score {
            best_score = sweep_score;
            best_pose = sweep_pose;
        } else {
            linear_step *= 0.5;
            angular_step *= 0.5;
            round += 1;
        }
    }

    MatchResult {
        pose: best_pose,
        score: best_score,
        covariance: None,
    }
}
