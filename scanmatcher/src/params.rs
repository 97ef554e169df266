//! Parameter structs for matching, registration gating and the flat
//! configuration surface consumed from the application's config file.

use std::fs;

use anyhow::anyhow;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Specifies parameters to use for likelihood scoring and pose refinement.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default, rename_all = "camelCase")]
pub struct MatchingParameters {
    /// Beams longer than this carve free space but register no hit.
    pub usable_range: f64,

    /// Beams longer than this are discarded entirely.
    pub max_range: f64,

    /// Scale of the Gaussian likelihood kernel: a beam endpoint at squared
    /// distance d2 from the nearest occupied cell contributes exp(-d2/sigma).
    pub sigma: f64,

    /// Radius, in cells, of the square window searched around each
    /// projected beam endpoint.
    pub kernel_size: i32,

    /// Initial translational perturbation of the optimizer, in meters.
    pub linear_step: f64,

    /// Initial angular perturbation of the optimizer, in radians.
    pub angular_step: f64,

    /// Number of step-halving rounds the optimizer runs through.
    pub iterations: u32,

    /// Estimate a 3x3 covariance around the refined pose (expensive).
    pub compute_covariance: bool,
}

impl Default for MatchingParameters {
    fn default() -> Self {
        Self {
            usable_range: 15.0,
            max_range: 20.0,
            sigma: 0.05,
            kernel_size: 1,
            linear_step: 0.05,
            angular_step: 0.05,
            iterations: 5,
            compute_covariance: false,
        }
    }
}

impl MatchingParameters {
    pub fn validate(&self) -> Result<()> {
        if !(self.usable_range > 0.0 && self.usable_range.is_finite()) {
            return Err(Error::configuration("usableRange must be positive"));
        }
        if !(self.max_range > 0.0 && self.max_range.is_finite()) {
            return Err(Error::configuration("maxRange must be positive"));
        }
        if !(self.sigma > 0.0 && self.sigma.is_finite()) {
            return Err(Error::configuration("sigma must be positive"));
        }
        if self.kernel_size < 0 {
            return Err(Error::configuration("kernelSize must not be negative"));
        }
        if !(self.linear_step > 0.0 && self.angular_step > 0.0) {
            return Err(Error::configuration(
                "linearStep and angularStep must be positive",
            ));
        }
        if self.iterations == 0 {
            return Err(Error::configuration("iterations must be at least 1"));
        }
        Ok(())
    }
}

/// Score thresholds gating the acceptance of a registration.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistrationParameters {
    /// Scores at or above this accept the refined pose outright.
    pub reg_score: f64,

    /// Scores below this reject the refinement in favor of odometry.
    /// Scores in between accept the pose but flag it as low-confidence.
    pub crit_score: f64,
}

impl Default for RegistrationParameters {
    fn default() -> Self {
        Self {
            reg_score: 300.0,
            crit_score: 150.0,
        }
    }
}

impl RegistrationParameters {
    pub fn validate(&self) -> Result<()> {
        if !(self.reg_score.is_finite() && self.crit_score.is_finite()) {
            return Err(Error::configuration("score thresholds must be finite"));
        }
        if self.reg_score < self.crit_score {
            return Err(Error::configuration(
                "regScore must not be below critScore",
            ));
        }
        Ok(())
    }
}

/// The flat key set recognized from the configuration collaborator.
///
/// Unknown keys are ignored, missing keys fall back to the defaults of
/// [`MatchingParameters`] and [`RegistrationParameters`].
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default, rename_all = "camelCase")]
pub struct ScanMatcherConfig {
    pub usable_range: f64,
    pub max_range: f64,
    pub sigma: f64,
    pub kernel_size: i32,
    pub linear_step: f64,
    pub angular_step: f64,
    pub iterations: u32,
    pub compute_covariance: bool,
    pub reg_score: f64,
    pub crit_score: f64,

    /// Maximum distance, in meters, the refined pose may move away from the
    /// previously accepted pose before the refinement is discarded.
    pub max_move: f64,

    /// Run the secondary ICP validation pass after gating.
    pub use_icp: bool,
}

impl Default for ScanMatcherConfig {
    fn default() -> Self {
        let matching = MatchingParameters::default();
        let registration = RegistrationParameters::default();
        Self {
            usable_range: matching.usable_range,
            max_range: matching.max_range,
            sigma: matching.sigma,
            kernel_size: matching.kernel_size,
            linear_step: matching.linear_step,
            angular_step: matching.angular_step,
            iterations: matching.iterations,
            compute_covariance: matching.compute_covariance,
            reg_score: registration.reg_score,
            crit_score: registration.crit_score,
            max_move: 1.0,
            use_icp: false,
        }
    }
}

impl ScanMatcherConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        // read file contents
        let contents = fs::read_to_string(path)?;

        serde_yaml::from_str(&contents).map_err(|e| anyhow!(e))
    }

    pub fn matching(&self) -> MatchingParameters {
        MatchingParameters {
            usable_range: self.usable_range,
            max_range: self.max_range,
            sigma: self.sigma,
            kernel_size: self.kernel_size,
            linear_step: self.linear_step,
            angular_step: self.angular_step,
            iterations: self.iterations,
            compute_covariance: self.compute_covariance,
        }
    }

    pub fn registration(&self) -> RegistrationParameters {
        RegistrationParameters {
            reg_score: self.reg_score,
            crit_score: self.crit_score,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.matching().validate()?;
        self.registration().validate()?;
        if !(self.max_move > 0.0 && self.max_move.is_finite()) {
            return Err(Error::configuration("maxMove must be positive"));
        }
        Ok(())
    }
}
