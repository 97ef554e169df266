use nalgebra::{Point2, Vector3};

use crate::math::normalize_angle;

/// The pose of a robot in the 2D plane.
#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct Pose {
    /// The x position of the robot
    pub x: f64,

    /// The y position of the robot
    pub y: f64,

    /// The rotation of the robot, measured in radians counter-clockwise from
    /// the positive x-axis. Always normalized to (-PI, PI].
    pub theta: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Self {
            x,
            y,
            theta: normalize_angle(theta),
        }
    }

    pub fn identity() -> Self {
        Self::default()
    }

    /// SE(2) composition: applies `other` in the frame of `self`.
    pub fn compose(&self, other: &Pose) -> Pose {
        let (sin_t, cos_t) = self.theta.sin_cos();
        Pose::new(
            self.x + other.x * cos_t - other.y * sin_t,
            self.y + other.x * sin_t + other.y * cos_t,
            self.theta + other.theta,
        )
    }

    /// The transform that undoes this pose: `compose(inverse) == identity`.
    pub fn inverse(&self) -> Pose {
        let (sin_t, cos_t) = self.theta.sin_cos();
        Pose::new(
            -self.x * cos_t - self.y * sin_t,
            self.x * sin_t - self.y * cos_t,
            -self.theta,
        )
    }

    /// The motion taking `reference` to `self`, expressed in the frame of
    /// `reference`: `reference.compose(&self.relative_to(&reference)) == self`.
    pub fn relative_to(&self, reference: &Pose) -> Pose {
        reference.inverse().compose(self)
    }

    /// Euclidean distance between the positions, ignoring heading.
    pub fn translation_distance(&self, other: &Pose) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    /// World position of a polar range measurement taken from this pose.
    pub fn project(&self, angle: f64, distance: f64) -> Point2<f64> {
        Point2::new(
            self.x + (self.theta + angle).cos() * distance,
            self.y + (self.theta + angle).sin() * distance,
        )
    }
}

impl From<Pose> for Vector3<f64> {
    fn from(val: Pose) -> Self {
        Vector3::new(val.x, val.y, val.theta)
    }
}

impl From<Vector3<f64>> for Pose {
    fn from(v: Vector3<f64>) -> Self {
        Pose::new(v.x, v.y, v.z)
    }
}
