//! 配置模块
//!
//! 运行时常量与管理器配置都在这里定义，便于后期修改

use std::time::Duration;

use tracing::warn;

/// 运行时名称
pub const RUNTIME_NAME: &str = "gort";

/// 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 最大线程数环境变量
pub const ENV_MAX_THREADS: &str = "GORT_MAX_THREADS";

/// 最大进程数环境变量
pub const ENV_MAX_PROCESSES: &str = "GORT_MAX_PROCESSES";

/// 关闭超时（毫秒）环境变量
pub const ENV_SHUTDOWN_TIMEOUT_MS: &str = "GORT_SHUTDOWN_TIMEOUT_MS";

/// 进程协程运行上限（毫秒）环境变量
pub const ENV_PROCESS_TIMEOUT_MS: &str = "GORT_PROCESS_TIMEOUT_MS";

/// 协程管理器配置
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// 线程执行器的最大线程数
    pub max_threads: usize,
    /// 进程执行器同时存活的最大子进程数
    pub max_processes: usize,
    /// 空闲工作线程的存活时间
    pub thread_keep_alive: Duration,
    /// shutdown 等待在途协程的最长时间
    pub shutdown_timeout: Duration,
    /// 工作线程名前缀
    pub thread_name: String,
    /// 单个进程协程的运行上限，到期杀掉子进程并以 `Timeout` 结束；None 表示不限
    pub process_timeout: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            max_threads: num_cpus * 4,
            max_processes: num_cpus,
            thread_keep_alive: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            thread_name: format!("{}-worker", RUNTIME_NAME),
            process_timeout: None,
        }
    }
}

impl ManagerConfig {
    /// 默认配置叠加环境变量
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// 用给定的查找函数覆盖配置项，非法值忽略
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(n) = parse_positive(ENV_MAX_THREADS, lookup(ENV_MAX_THREADS)) {
            self.max_threads = n as usize;
        }
        if let Some(n) = parse_positive(ENV_MAX_PROCESSES, lookup(ENV_MAX_PROCESSES)) {
            self.max_processes = n as usize;
        }
        if let Some(ms) = parse_positive(ENV_SHUTDOWN_TIMEOUT_MS, lookup(ENV_SHUTDOWN_TIMEOUT_MS)) {
            self.shutdown_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_positive(ENV_PROCESS_TIMEOUT_MS, lookup(ENV_PROCESS_TIMEOUT_MS)) {
            self.process_timeout = Some(Duration::from_millis(ms));
        }
        self
    }
}

fn parse_positive(key: &str, raw: Option<String>) -> Option<u64> {
    let raw = raw?;
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            warn!(key, value = %raw, "ignoring invalid configuration value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();
        assert!(config.max_threads >= 4);
        assert!(config.max_processes >= 1);
        assert_eq!(config.thread_name, "gort-worker");
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_MAX_THREADS, "3"),
            (ENV_MAX_PROCESSES, "zero"),
            (ENV_SHUTDOWN_TIMEOUT_MS, "250"),
            (ENV_PROCESS_TIMEOUT_MS, "1500"),
        ]
        .into_iter()
        .collect();

        let base = ManagerConfig::default();
        let config = base.clone().with_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.max_threads, 3);
        assert_eq!(config.max_processes, base.max_processes);
        assert_eq!(config.shutdown_timeout, Duration::from_millis(250));
        assert_eq!(config.process_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(base.process_timeout, None);
    }

    #[test]
    fn test_zero_is_rejected() {
        let config = ManagerConfig::default().with_overrides(|k| {
            (k == ENV_MAX_THREADS).then(|| "0".to_string())
        });
        assert!(config.max_threads > 0);
    }
}
