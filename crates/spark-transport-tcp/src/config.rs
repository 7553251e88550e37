use serde::Deserialize;
use thiserror::Error;

/// 工作进程身份所在的环境变量。
pub const WORKER_ID_ENV: &str = "SPARK_CLUSTER_WORKER_ID";

/// 进程在集群中的角色。
///
/// Worker 的 Server 把绑定交给集群监听协调者；Primary 的 Server 始终直接绑定。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessRole {
    #[default]
    Primary,
    Worker { id: u32 },
}

impl ProcessRole {
    pub fn is_worker(&self) -> bool {
        matches!(self, Self::Worker { .. })
    }

    /// 从 [`WORKER_ID_ENV`] 推断当前进程的角色。
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var(WORKER_ID_ENV).ok().as_deref())
    }

    /// 环境变量存在即视为 Worker；无法解析为数字时以 0 作为编号。
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value {
            Some(raw) => Self::Worker {
                id: raw.trim().parse().unwrap_or_default(),
            },
            None => Self::Primary,
        }
    }
}

/// `error` 事件没有监听器时的处理策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhandledErrorPolicy {
    /// 视为致命错误：关闭流程结束后 panic；在 Tokio 任务内部记录错误并终止进程。
    #[default]
    Panic,
    /// 仅以 `tracing::error!` 记录。
    Log,
}

/// 传输层的全局配置。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把 Socket/Server 的默认主机、端口、backlog 与读缓冲大小集中声明，
///   由 [`Transport`](crate::Transport) 在构造时一次性注入，而不是散落为常量。
///
/// ## 契约 (What)
/// - 所有字段都有默认值，TOML 中缺省的字段沿用 [`TransportConfig::default`]；
/// - `default_server_host` 为空串表示绑定全部 IPv4 网卡；
/// - `read_buffer_size` 只影响 Tokio 实现的单次读取上限。
///
/// ## 注意事项 (Trade-offs)
/// - `role` 默认是 Primary；需要从环境推断时调用
///   `config.with_role(ProcessRole::from_env())`。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub default_host: String,
    pub default_server_host: String,
    pub default_port: u16,
    pub backlog: u32,
    pub read_buffer_size: usize,
    pub unhandled_error: UnhandledErrorPolicy,
    pub role: ProcessRole,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_host: "localhost".to_owned(),
            default_server_host: String::new(),
            default_port: 8080,
            backlog: 511,
            read_buffer_size: 64 * 1024,
            unhandled_error: UnhandledErrorPolicy::Panic,
            role: ProcessRole::Primary,
        }
    }
}

impl TransportConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(ConfigError::Parse)
    }

    pub fn with_role(mut self, role: ProcessRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_unhandled_error(mut self, policy: UnhandledErrorPolicy) -> Self {
        self.unhandled_error = policy;
        self
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid transport config: {0}")]
    Parse(#[source] toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config = TransportConfig::from_toml_str("default_port = 9891\n").unwrap();
        assert_eq!(config.default_port, 9891);
        assert_eq!(config.default_host, "localhost");
        assert_eq!(config.backlog, 511);
        assert_eq!(config.unhandled_error, UnhandledErrorPolicy::Panic);
    }

    #[test]
    fn role_and_policy_are_parsed() {
        let raw = r#"
            unhandled_error = "log"

            [role]
            kind = "worker"
            id = 3
        "#;
        let config = TransportConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.role, ProcessRole::Worker { id: 3 });
        assert_eq!(config.unhandled_error, UnhandledErrorPolicy::Log);
    }

    #[test]
    fn malformed_config_is_rejected() {
        let error = TransportConfig::from_toml_str("backlog = \"many\"").unwrap_err();
        assert!(error.to_string().contains("invalid transport config"));
    }

    #[test]
    fn worker_role_comes_from_environment_value() {
        assert_eq!(ProcessRole::from_env_value(None), ProcessRole::Primary);
        assert_eq!(
            ProcessRole::from_env_value(Some("7")),
            ProcessRole::Worker { id: 7 }
        );
        assert!(ProcessRole::from_env_value(Some("")).is_worker());
    }
}
