//! Covariance estimation from the curvature of the score surface.

use nalgebra::Matrix3;

use common::robot::Pose;

/// Estimates a 3x3 pose covariance from central finite differences of the
/// score surface around `pose`, sampled with the given step sizes.
///
/// The score surface is locally approximated by its curvature (Hessian);
/// around a maximum the curvature is negative and its negated inverse
/// serves as the covariance. Returns `None` when the surface is flat, the
/// curvature is not invertible or the resulting variances are not positive
/// — callers must treat that as "covariance unavailable".
pub fn from_score_surface(
    pose: Pose,
    linear_step: f64,
    angular_step: f64,
    score: impl Fn(Pose) -> f64,
) -> Option<Matrix3<f64>> {
    let steps = [linear_step, linear_step, angular_step];
    let sample = |offsets: [f64; 3]| {
        score(Pose::new(
            pose.x + offsets[0],
            pose.y + offsets[1],
            pose.theta + offsets[2],
        ))
    };

    let center = sample([0.0; 3]);
    let mut curvature = Matrix3::zeros();

    for i in 0..3 {
        let mut offsets = [0.0; 3];
        offsets[i] = steps[i];
        let plus = sample(offsets);
        offsets[i] = -steps[i];
        let minus = sample(offsets);

        curvature[(i, i)] = (plus - 2.0 * center + minus) / (steps[i] * steps[i]);
    }

    for i in 0..3 {
        for j in (i + 1)..3 {
            let mut offsets = [0.0; 3];

            offsets[i] = steps[i];
            offsets[j] = steps[j];
            let plus_plus = sample(offsets);
            offsets[j] = -steps[j];
            let plus_minus = sample(offsets);
            offsets[i] = -steps[i];
            let minus_minus = sample(offsets);
            offsets[j] = steps[j];
            let minus_plus = sample(offsets);

            let value =
                (plus_plus - plus_minus - minus_plus + minus_minus) / (4.0 * steps[i] * steps[j]);
            curvature[(i, j)] = value;
            curvature[(j, i)] = value;
        }
    }

    if curvature.iter().any(|v| !v.is_finite()) {
        return None;
    }
    if curvature.iter().all(|v| *v == 0.0) {
        return None;
    }

    let covariance = (-curvature).try_inverse()?;
    let valid = covariance.iter().all(|v| v.is_finite())
        && (0..3).all(|i| covariance[(i, i)] > 0.0);
    valid.then_some(covariance)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn quadratic_peak_recovers_its_curvature() {
        // score = -(x^2 + y^2 + theta^2) / 2 has curvature -I, covariance I
        let score =
            |p: Pose| -(p.x * p.x + p.y * p.y + p.theta * p.theta) / 2.0;

        let covariance =
            from_score_surface(Pose::identity(), 0.01, 0.01, score).unwrap();

        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_relative_eq!(covariance[(i, j)], expected, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn anisotropic_peak_scales_the_variances() {
        // twice the curvature in x means half the variance in x
        let score = |p: Pose| {
            -(2.0 * p.x * p.x + p.y * p.y + p.theta * p.theta) / 2.0
        };

        let covariance =
            from_score_surface(Pose::identity(), 0.01, 0.01, score).unwrap();
        assert_relative_eq!(covariance[(0, 0)], 0.5, epsilon = 1e-6);
        assert_relative_eq!(covariance[(1, 1)], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn flat_surface_is_unavailable() {
        assert!(from_score_surface(Pose::identity(), 0.01, 0.01, |_| 4.2).is_none());
    }

    #[test]
    fn saddle_surface_is_unavailable() {
        // negative variance along y must not leak out as a covariance
        let score = |p: Pose| -(p.x * p.x) + p.y * p.y - p.theta * p.theta;
        assert!(from_score_surface(Pose::identity(), 0.01, 0.01, score).is_none());
    }
}
