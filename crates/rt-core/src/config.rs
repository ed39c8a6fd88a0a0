//! 配置管理
//!
//! 进程级配置在启动时加载一次，之后以引用方式传入各组件

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::error::{Result, RtError};

/// 系统完整配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtConfig {
    /// DICOM文件根目录，目录中的相对路径拼接在其后
    pub dicom_root: PathBuf,
    /// 写回目录时记录的编辑用户
    pub user: String,
    /// 目录数据库连接字符串
    pub database_url: String,
    /// 剂量求和配置
    pub dose: DoseConfig,
    /// 侧别判定配置
    pub laterality: LateralityConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 剂量求和配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DoseConfig {
    /// 低于等于该最大剂量 (Gy) 的剂量文件视为单野剂量并跳过
    pub min_summed_max_dose_gy: f64,
}

/// 侧别判定配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LateralityConfig {
    /// 右/左比值低于此值判定为左侧
    pub left_threshold: f64,
    /// 右/左比值高于此值判定为右侧
    pub right_threshold: f64,
    /// 每个剂量平面每侧取的百分位数
    pub percentile: f64,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别
    pub level: String,
}

impl RtConfig {
    /// 从文件加载配置，`RT_` 前缀的环境变量可覆盖文件中的值
    pub fn load(config_path: &str) -> Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(config_path))
            .add_source(Environment::with_prefix("RT").separator("__"))
            .build()
            .map_err(|e| RtError::Config(format!("无法读取配置文件 {}: {}", config_path, e)))?;

        let config: RtConfig = settings
            .try_deserialize()
            .map_err(|e| RtError::Config(format!("配置反序列化失败: {}", e)))?;

        ConfigValidator::new().validate(&config)?;

        info!("配置加载成功: {}", config_path);
        Ok(config)
    }

    /// 以指定根目录创建默认配置
    pub fn with_root<P: AsRef<Path>>(dicom_root: P) -> Self {
        Self {
            dicom_root: dicom_root.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// 将目录中的相对路径转换为本地路径
    pub fn local_path(&self, catalog_path: &str) -> PathBuf {
        self.dicom_root.join(catalog_path.trim_start_matches(['/', '\\']))
    }

    /// 将本地路径转换回目录中的相对路径（以 `/` 开头）
    pub fn catalog_path(&self, local_path: &Path) -> Option<String> {
        let relative = local_path.strip_prefix(&self.dicom_root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        Some(format!("/{}", parts.join("/")))
    }
}

impl Default for RtConfig {
    fn default() -> Self {
        Self {
            dicom_root: PathBuf::from("./data/dicom"),
            user: "cordial".to_string(),
            database_url: "sqlite://./data/catalog.db".to_string(),
            dose: DoseConfig::default(),
            laterality: LateralityConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DoseConfig {
    fn default() -> Self {
        Self {
            min_summed_max_dose_gy: 1.0,
        }
    }
}

impl Default for LateralityConfig {
    fn default() -> Self {
        Self {
            left_threshold: 0.8,
            right_threshold: 1.2,
            percentile: 95.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// 验证规则
struct ValidationRule {
    /// 字段路径
    field_path: &'static str,
    /// 验证函数
    validator: fn(&RtConfig) -> std::result::Result<(), String>,
}

/// 配置验证器
pub struct ConfigValidator {
    validation_rules: Vec<ValidationRule>,
}

impl ConfigValidator {
    /// 创建新的配置验证器
    pub fn new() -> Self {
        let validation_rules = vec![
            ValidationRule {
                field_path: "dicom_root",
                validator: |config| {
                    if config.dicom_root.as_os_str().is_empty() {
                        Err("DICOM根目录不能为空".to_string())
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "user",
                validator: |config| {
                    if config.user.trim().is_empty() {
                        Err("用户名不能为空".to_string())
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "laterality",
                validator: |config| {
                    let lat = &config.laterality;
                    if lat.left_threshold <= 0.0 || lat.left_threshold >= lat.right_threshold {
                        Err(format!(
                            "侧别阈值无效: left={} right={}",
                            lat.left_threshold, lat.right_threshold
                        ))
                    } else if !(0.0..=100.0).contains(&lat.percentile) {
                        Err(format!("百分位数必须在0到100之间: {}", lat.percentile))
                    } else {
                        Ok(())
                    }
                },
            },
            ValidationRule {
                field_path: "dose.min_summed_max_dose_gy",
                validator: |config| {
                    if config.dose.min_summed_max_dose_gy < 0.0 {
                        Err("最小剂量阈值不能为负".to_string())
                    } else {
                        Ok(())
                    }
                },
            },
        ];

        Self { validation_rules }
    }

    /// 验证配置
    pub fn validate(&self, config: &RtConfig) -> Result<()> {
        for rule in &self.validation_rules {
            if let Err(e) = (rule.validator)(config) {
                error!("配置验证失败 {}: {}", rule.field_path, e);
                return Err(RtError::Config(format!("{}: {}", rule.field_path, e)));
            }
        }
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}
