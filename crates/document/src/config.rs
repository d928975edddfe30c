use std::path::Path;

use scheduler::SchedulerConfig;
use serde::Deserialize;
use tiles::MemoryConfig;

use crate::DocumentError;

/// Every knob of the core, as read from a TOML file. Missing tables and
/// keys fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub memory: MemoryConfig,
    pub scheduler: SchedulerConfig,
}

impl CoreConfig {
    pub fn from_toml(text: &str) -> Result<Self, DocumentError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, DocumentError> {
        let text = std::fs::read_to_string(path).map_err(|source| DocumentError::ReadConfig {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text)?;
        tracing::debug!(path = %path.display(), "loaded core config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DocumentError> {
        self.memory.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler::SchedulerConfigError;
    use std::io::Write;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = CoreConfig::from_toml(
            r#"
            [memory]
            soft_limit_bytes = 1048576
            hard_limit_bytes = 2097152

            [scheduler]
            worker_threads = 2
            "#,
        )
        .expect("parse config");
        assert_eq!(config.memory.soft_limit_bytes, 1 << 20);
        assert_eq!(config.memory.pool_limit, MemoryConfig::default().pool_limit);
        assert_eq!(config.scheduler.worker_threads, 2);
        assert_eq!(config.scheduler.patch_size, 512);
        assert!(config.scheduler.merge_updates);
    }

    #[test]
    fn empty_toml_is_the_default() {
        assert_eq!(
            CoreConfig::from_toml("").expect("parse config"),
            CoreConfig::default()
        );
    }

    #[test]
    fn invalid_limits_are_rejected() {
        let error = CoreConfig::from_toml(
            r#"
            [memory]
            soft_limit_bytes = 4096
            hard_limit_bytes = 1024
            "#,
        )
        .expect_err("soft above hard");
        assert!(matches!(
            error,
            DocumentError::Memory(tiles::ConfigError::SoftLimitAboveHardLimit {
                soft: 4096,
                hard: 1024
            })
        ));

        let error = CoreConfig::from_toml("[scheduler]\npatch_size = 0\n").expect_err("empty patch");
        assert!(matches!(
            error,
            DocumentError::Scheduler(SchedulerConfigError::PatchSizeNotPositive(0))
        ));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let error = CoreConfig::from_toml("[scheduler]\nworker_threads = \"many\"\n")
            .expect_err("wrong type");
        assert!(matches!(error, DocumentError::ParseConfig(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(file, "[scheduler]\nworker_threads = 3\nmerge_updates = false")
            .expect("write config");
        let config = CoreConfig::load(file.path()).expect("load config");
        assert_eq!(config.scheduler.worker_threads, 3);
        assert!(!config.scheduler.merge_updates);

        let missing = CoreConfig::load(Path::new("/nonexistent/core.toml"));
        assert!(matches!(missing, Err(DocumentError::ReadConfig { .. })));
    }
}
