#![allow(non_snake_case)]

//! Secondary pose validation using Iterative Closest Point (ICP).
//!
//! Aligns the beam endpoints of a scan against the mean hit positions of
//! the occupied map cells. The grid-based registration remains
//! authoritative; this pass only confirms (and slightly sharpens) its
//! result when both agree.

use kd_tree::KdMap;
use nalgebra::{Matrix2, Matrix2x3, Matrix3, Point2, Vector3};
use serde::Deserialize;

use common::{math::normalize_angle, robot::Pose};

/// Specifies parameters to use during the ICP computation.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default, rename_all = "camelCase")]
pub struct IcpParameters {
    pub correspondence_weights: CorrespondenceWeight,
    pub iterations: usize,
}

impl Default for IcpParameters {
    fn default() -> Self {
        Self {
            correspondence_weights: CorrespondenceWeight::Uniform,
            iterations: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub enum CorrespondenceWeight {
    /// All weights are 1.0
    Uniform,

    /// Weight is a step function. Below the threshold (in squared error
    /// norm terms) the weight is 1.0. Above it is 0.0.
    Step { threshold: f64 },
}

impl CorrespondenceWeight {
    fn weight(&self, sq_error: f64) -> f64 {
        match self {
            CorrespondenceWeight::Uniform => 1.0,
            CorrespondenceWeight::Step { threshold } => {
                if sq_error < threshold * threshold {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Returns the pose aligning `points` (in the sensor frame) with
/// `reference` (in the world frame), refined from `initial`.
///
/// `None` when either point set is too small to constrain the solve or the
/// normal equations degenerate.
pub fn align(
    points: &[Point2<f64>],
    reference: &[Point2<f64>],
    initial: Pose,
    params: IcpParameters,
) -> Option<Pose> {
    if points.len() < 3 || reference.len() < 3 {
        return None;
    }

    let reference_tree = build_tree(reference);
    let mut x: Vector3<f64> = initial.into();

    for _ in 0..params.iterations {
        let mut H = Matrix3::zeros();
        let mut g = Vector3::zeros();

        for point in points {
            let transformed = R(x[2]) * point.coords + x.xy();
            let Some(nearest) = reference_tree.nearest(&[transformed.x, transformed.y]) else {
                continue;
            };
            let target = reference[nearest.item.1];

            let e = transformed - target.coords;
            let weight = params.correspondence_weights.weight(e.norm_squared());
            let J = jacobian(x, *point);

            H += weight * J.transpose() * J;
            g += weight * J.transpose() * e;
        }

        let dx = lstsq::lstsq(&H, &(-g), 1e-9).ok()?.solution;
        x += dx;

        // normalize the angle
        x[2] = normalize_angle(x[2]);
    }

    Some(Pose::from(x))
}

fn build_tree(points: &[Point2<f64>]) -> KdMap<[f64; 2], usize> {
    let items: Vec<([f64; 2], usize)> = points
        .iter()
        .enumerate()
        .map(|(i, p)| ([p.x, p.y], i))
        .collect();
    KdMap::build_by_ordered_float(items)
}

fn R(theta: f64) -> Matrix2<f64> {
    Matrix2::new(theta.cos(), -theta.sin(), theta.sin(), theta.cos())
}

fn dR(theta: f64) -> Matrix2<f64> {
    Matrix2::new(-theta.sin(), -theta.cos(), theta.cos(), -theta.sin())
}

fn jacobian(x: Vector3<f64>, point: Point2<f64>) -> Matrix2x3<f64> {
    let mut J = Matrix2x3::identity();
    J.set_column(2, &(dR(x[2]) * point.coords));
    J
}
