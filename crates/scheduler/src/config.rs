use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub worker_threads: usize,
    /// Largest side of a projection update job; bigger requests are split.
    pub patch_size: i32,
    pub merge_updates: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism()
                .map(|threads| threads.get())
                .unwrap_or(4),
            patch_size: 512,
            merge_updates: true,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), SchedulerConfigError> {
        if self.worker_threads == 0 {
            return Err(SchedulerConfigError::NoWorkers);
        }
        if self.patch_size <= 0 {
            return Err(SchedulerConfigError::PatchSizeNotPositive(self.patch_size));
        }
        Ok(())
    }

    pub(crate) fn max_merged_area(&self) -> i64 {
        i64::from(self.patch_size) * i64::from(self.patch_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerConfigError {
    #[error("scheduler needs at least one worker thread")]
    NoWorkers,
    #[error("patch size must be positive, got {0}")]
    PatchSizeNotPositive(i32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SchedulerConfig::default();
        assert!(config.worker_threads >= 1);
        assert_eq!(config.patch_size, 512);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn rejects_zero_workers_and_empty_patches() {
        let config = SchedulerConfig {
            worker_threads: 0,
            ..SchedulerConfig::default()
        };
        assert_eq!(config.validate(), Err(SchedulerConfigError::NoWorkers));

        let config = SchedulerConfig {
            patch_size: 0,
            ..SchedulerConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(SchedulerConfigError::PatchSizeNotPositive(0))
        );
    }
}
