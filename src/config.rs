//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__EXECUTOR__MAX_RETRIES=5`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub backoff: BackoffSection,
    #[serde(default)]
    pub adjuster: AdjusterSection,
    #[serde(default)]
    pub reasoner: ReasonerSection,
}

/// [executor] 段：运行超时、并发上限、重试与检查点
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorSection {
    /// execute_plan 等待运行结束的上限（毫秒）
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试用尽后还能跳过几次尝试
    #[serde(default = "default_max_skips")]
    pub max_skips: u32,
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
    /// 调度轮询间隔（毫秒）
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,
    /// 单个动作的默认超时（毫秒）
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,
    /// extended_timeout 升级的上限（毫秒）
    #[serde(default = "default_max_action_timeout_ms")]
    pub max_action_timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    300_000
}

fn default_max_concurrent_tasks() -> usize {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_skips() -> u32 {
    2
}

fn default_checkpoint_interval_secs() -> u64 {
    60
}

fn default_tick_ms() -> u64 {
    100
}

fn default_max_checkpoints() -> usize {
    100
}

fn default_action_timeout_ms() -> u64 {
    60_000
}

fn default_max_action_timeout_ms() -> u64 {
    3_600_000
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_retries: default_max_retries(),
            max_skips: default_max_skips(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            tick_ms: default_tick_ms(),
            max_checkpoints: default_max_checkpoints(),
            action_timeout_ms: default_action_timeout_ms(),
            max_action_timeout_ms: default_max_action_timeout_ms(),
        }
    }
}

/// [backoff] 段：wait_and_retry 的指数退避
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffSection {
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_backoff_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_backoff_jitter_ms() -> u64 {
    500
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            max_ms: default_backoff_max_ms(),
            jitter_ms: default_backoff_jitter_ms(),
        }
    }
}

/// [adjuster] 段：计划调整的触发阈值
#[derive(Debug, Clone, Deserialize)]
pub struct AdjusterSection {
    /// failed / (failed + completed) 超过该值时简化剩余任务
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f64,
    #[serde(default = "default_slow_execution_ms")]
    pub slow_execution_ms: u64,
    #[serde(default = "default_rate_limit_max_concurrent")]
    pub rate_limit_max_concurrent: usize,
    #[serde(default = "default_rate_limit_delay_ms")]
    pub rate_limit_delay_ms: u64,
    #[serde(default = "default_high_memory_mb")]
    pub high_memory_mb: f64,
    #[serde(default = "default_high_cpu_percent")]
    pub high_cpu_percent: f64,
    /// 同一任务失败达到该次数时，观察中追加 repeated_failures 异常
    #[serde(default = "default_repeated_failure_threshold")]
    pub repeated_failure_threshold: usize,
}

fn default_failure_rate() -> f64 {
    0.30
}

fn default_slow_execution_ms() -> u64 {
    300_000
}

fn default_rate_limit_max_concurrent() -> usize {
    2
}

fn default_rate_limit_delay_ms() -> u64 {
    1000
}

fn default_high_memory_mb() -> f64 {
    2048.0
}

fn default_high_cpu_percent() -> f64 {
    90.0
}

fn default_repeated_failure_threshold() -> usize {
    2
}

impl Default for AdjusterSection {
    fn default() -> Self {
        Self {
            failure_rate: default_failure_rate(),
            slow_execution_ms: default_slow_execution_ms(),
            rate_limit_max_concurrent: default_rate_limit_max_concurrent(),
            rate_limit_delay_ms: default_rate_limit_delay_ms(),
            high_memory_mb: default_high_memory_mb(),
            high_cpu_percent: default_high_cpu_percent(),
            repeated_failure_threshold: default_repeated_failure_threshold(),
        }
    }
}

/// [reasoner] 段：推理预言机后端与超时
#[derive(Debug, Clone, Deserialize)]
pub struct ReasonerSection {
    /// mock / openai
    #[serde(default = "default_provider")]
    pub provider: String,
    pub base_url: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// complex / very_complex 任务使用的模型，未设置时与 model 相同
    pub advanced_model: Option<String>,
    #[serde(default = "default_reasoner_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider() -> String {
    "mock".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_reasoner_timeout_secs() -> u64 {
    30
}

impl Default for ReasonerSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: None,
            model: default_model(),
            advanced_model: None,
            timeout_secs: default_reasoner_timeout_secs(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.executor.timeout_ms, 300_000);
        assert_eq!(cfg.executor.max_concurrent_tasks, 5);
        assert_eq!(cfg.executor.max_retries, 3);
        assert_eq!(cfg.executor.checkpoint_interval_secs, 60);
        assert_eq!(cfg.backoff.max_ms, 30_000);
        assert!((cfg.adjuster.failure_rate - 0.30).abs() < f64::EPSILON);
        assert_eq!(cfg.reasoner.provider, "mock");
    }

    #[test]
    fn test_file_overrides_and_missing_keys_default() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[executor]\nmax_concurrent_tasks = 2\ntick_ms = 10\n\n[adjuster]\nfailure_rate = 0.5\n"
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.executor.max_concurrent_tasks, 2);
        assert_eq!(cfg.executor.tick_ms, 10);
        assert_eq!(cfg.executor.max_retries, 3);
        assert!((cfg.adjuster.failure_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.adjuster.rate_limit_max_concurrent, 2);
    }

    #[test]
    fn test_env_overrides_file() {
        std::env::set_var("HIVE__REASONER__ADVANCED_MODEL", "gpt-4o");
        let cfg = load_config(None).unwrap();
        std::env::remove_var("HIVE__REASONER__ADVANCED_MODEL");
        assert_eq!(cfg.reasoner.advanced_model.as_deref(), Some("gpt-4o"));
    }
}
