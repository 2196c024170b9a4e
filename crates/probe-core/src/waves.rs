use crate::config::LoadConfig;
use serde::{Deserialize, Serialize};

/// How the last wave is sized when `total` is not a multiple of `rps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastWave {
    /// Every wave is `rps` wide; the run may issue past `total`.
    #[default]
    Overshoot,
    /// The last wave only issues what is left of `total`.
    Trim,
}

/// Deterministic wave planner: waves are issued strictly in order.
#[derive(Debug, Clone, Copy)]
pub struct WavePlan {
    rps: u64,
    total: u64,
    last_wave: LastWave,
}

impl WavePlan {
    /// `rps` must be non-zero.
    pub fn new(rps: u64, total: u64, last_wave: LastWave) -> anyhow::Result<Self> {
        if rps == 0 {
            anyhow::bail!("rps must be greater than zero");
        }
        Ok(Self {
            rps,
            total,
            last_wave,
        })
    }

    pub fn from_config(config: &LoadConfig) -> anyhow::Result<Self> {
        Self::new(config.rps, config.total, config.last_wave)
    }

    pub fn rps(&self) -> u64 {
        self.rps
    }

    /// Sizes of the waves, in order.
    pub fn sizes(&self) -> impl Iterator<Item = u64> {
        let Self {
            rps,
            total,
            last_wave,
        } = *self;
        (0..self.wave_count()).map(move |idx| {
            let issued = idx * rps;
            match last_wave {
                LastWave::Overshoot => rps,
                LastWave::Trim => rps.min(total - issued),
            }
        })
    }

    pub fn wave_count(&self) -> u64 {
        self.total.div_ceil(self.rps)
    }

    /// Requests the plan issues in total.
    pub fn planned_requests(&self) -> u64 {
        self.sizes().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overshoot_keeps_full_waves() {
        let plan = WavePlan::new(10, 25, LastWave::Overshoot).unwrap();
        assert_eq!(plan.wave_count(), 3);
        assert_eq!(plan.sizes().collect::<Vec<_>>(), vec![10, 10, 10]);
        assert_eq!(plan.planned_requests(), 30);
    }

    #[test]
    fn test_trim_shortens_last_wave() {
        let plan = WavePlan::new(10, 25, LastWave::Trim).unwrap();
        assert_eq!(plan.wave_count(), 3);
        assert_eq!(plan.sizes().collect::<Vec<_>>(), vec![10, 10, 5]);
        assert_eq!(plan.planned_requests(), 25);
    }

    #[test]
    fn test_exact_multiple_and_empty() {
        for last_wave in [LastWave::Overshoot, LastWave::Trim] {
            let plan = WavePlan::new(5, 20, last_wave).unwrap();
            assert_eq!(plan.sizes().collect::<Vec<_>>(), vec![5, 5, 5, 5]);

            let plan = WavePlan::new(5, 0, last_wave).unwrap();
            assert_eq!(plan.wave_count(), 0);
            assert_eq!(plan.planned_requests(), 0);
        }
    }

    #[test]
    fn test_rps_larger_than_total() {
        let plan = WavePlan::new(100, 7, LastWave::Overshoot).unwrap();
        assert_eq!(plan.sizes().collect::<Vec<_>>(), vec![100]);
        let plan = WavePlan::new(100, 7, LastWave::Trim).unwrap();
        assert_eq!(plan.sizes().collect::<Vec<_>>(), vec![7]);
    }

    #[test]
    fn test_zero_rps_rejected() {
        assert!(WavePlan::new(0, 10, LastWave::Overshoot).is_err());
    }
}
