use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    api_observability::{ObservabilityConfig, ServerConfig},
    dispatcher_worker::{PoolConfig, SchedulerConfig, WorkerConfig},
};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: TESTFLEET_, nesting separator: __)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults =
            ConfigBuilder::try_from(&AppConfig::default()).context("生成默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            let default_paths = ["config/testfleet.toml", "testfleet.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("TESTFLEET")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// Validate configuration effectiveness
    pub fn validate(&self) -> Result<()> {
        self.server.validate().context("服务配置验证失败")?;

        self.scheduler.validate().context("调度配置验证失败")?;

        self.worker.validate().context("Worker配置验证失败")?;

        self.pool.validate().context("Worker池配置验证失败")?;

        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.max_depth, 10);
        assert_eq!(config.scheduler.unaffected_depth(), 9);
    }

    #[test]
    fn test_from_toml_partial_sections() {
        let config = AppConfig::from_toml(
            r#"
            [scheduler]
            max_depth = 6
            batches_per_job = 2
            max_analysis_depth = 3

            [worker]
            group = "ci"
            worker_id = 7
            server_url = "http://dispatcher:7878"
            work_dir = "/var/lib/testfleet"
            go_binary = "go"
            poll_interval_ms = 250
            exec_timeout_seconds = 60
            build_timeout_seconds = 120
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.batches_per_job, 2);
        assert_eq!(config.worker.group, "ci");
        assert_eq!(config.server.bind_address, "0.0.0.0:7878");
    }

    #[test]
    fn test_invalid_analysis_depth_rejected() {
        let mut config = AppConfig::default();
        config.scheduler.max_analysis_depth = config.scheduler.max_depth;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [server]
            bind_address = "127.0.0.1:9000"
            shutdown_timeout_seconds = 5
            max_request_size_mb = 8
            "#
        )
        .unwrap();

        let config = AppConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:9000");
        assert_eq!(config.server.shutdown_timeout_seconds, 5);
        assert_eq!(config.scheduler.max_depth, 10);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load(Some("/nonexistent/testfleet.toml")).is_err());
    }

    #[test]
    fn test_toml_round_trip_keeps_provisioner() {
        let mut config = AppConfig::default();
        config.pool.provisioner = super::super::ProvisionerKind::Docker;
        let text = config.to_toml().unwrap();
        assert!(text.contains("provisioner = \"docker\""));
    }
}
