use serde::{Deserialize, Serialize};
use stampede_error::{ErrorCodes, StampedeError};
use thiserror::Error;

/// Non-error terminal signal: the journey's configured duration has elapsed
/// and no further requests should be emitted for it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct JourneyComplete;

#[derive(Error, Debug)]
pub enum VolumeModelError {
    #[error("ramp down requires a defined duration")]
    RampDownWithoutDuration,
}

impl StampedeError for VolumeModelError {
    fn code(&self) -> ErrorCodes {
        ErrorCodes::InvalidArgument
    }
}

/// A per-time-unit request target.  `target_at(t)` is the number of requests
/// the whole cluster should emit during second `t` of the journey, counted
/// from the scenario's start.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum VolumeModel {
    /// A flat target for the whole (possibly unbounded) duration.
    #[serde(rename = "constant")]
    Constant {
        target: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
    },
    /// A flat target with a linear ramp from zero at the start and
    /// optionally back down to zero over the final seconds.
    #[serde(rename = "dynamic")]
    Dynamic {
        target: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
        /// Seconds to climb from 0 to `target`.  Zero disables the ramp.
        #[serde(default)]
        ramp_up: u64,
        /// Seconds to descend from `target` to 0 at the end of `duration`.
        #[serde(skip_serializing_if = "Option::is_none")]
        ramp_down: Option<u64>,
    },
}

impl VolumeModel {
    pub fn constant(target: u64, duration: Option<u64>) -> Self {
        VolumeModel::Constant { target, duration }
    }

    pub fn dynamic(
        target: u64,
        duration: Option<u64>,
        ramp_up: u64,
        ramp_down: Option<u64>,
    ) -> Result<Self, VolumeModelError> {
        if ramp_down.is_some() && duration.is_none() {
            return Err(VolumeModelError::RampDownWithoutDuration);
        }
        Ok(VolumeModel::Dynamic {
            target,
            duration,
            ramp_up,
            ramp_down,
        })
    }

    /// The cluster-wide target for second `t`, or `JourneyComplete` once `t`
    /// reaches the configured duration.
    pub fn target_at(&self, t: u64) -> Result<u64, JourneyComplete> {
        match self {
            VolumeModel::Constant { target, duration } => {
                if matches!(duration, Some(d) if t >= *d) {
                    return Err(JourneyComplete);
                }
                Ok(*target)
            }
            VolumeModel::Dynamic {
                target,
                duration,
                ramp_up,
                ramp_down,
            } => {
                if matches!(duration, Some(d) if t >= *d) {
                    return Err(JourneyComplete);
                }
                if *ramp_up > 0 && t <= *ramp_up {
                    return Ok(div_ceil(target * t, *ramp_up));
                }
                if let (Some(duration), Some(ramp_down)) = (duration, ramp_down) {
                    if *ramp_down > 0 && t >= duration.saturating_sub(*ramp_down) {
                        return Ok(div_ceil(target * (duration - t), *ramp_down));
                    }
                }
                Ok(*target)
            }
        }
    }

    /// Total volume over `[start, end]`, inclusive on both ends.  O(1) for
    /// constant models; ramped models sum second by second, stopping early
    /// once the journey completes.
    pub fn cumulative_volume(&self, start: u64, end: u64) -> u64 {
        if end < start {
            return 0;
        }
        match self {
            VolumeModel::Constant { target, .. } => target * (end - start + 1),
            VolumeModel::Dynamic { .. } => {
                let mut total = 0;
                for t in start..=end {
                    match self.target_at(t) {
                        Ok(v) => total += v,
                        Err(JourneyComplete) => break,
                    }
                }
                total
            }
        }
    }
}

fn div_ceil(numerator: u64, denominator: u64) -> u64 {
    (numerator + denominator - 1) / denominator
}
