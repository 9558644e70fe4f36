//! 套接字层的静态配置。
//!
//! ## 意图（Why）
//! - 将缓冲区大小、超时与重连退避等常量显式建模，宿主可通过 TOML 文件覆盖，
//!   而无需在代码中散布魔法数字；
//!
//! ## 契约（What）
//! - 所有字段均有默认值（`#[serde(default)]`），空文档即得到默认配置；
//! - 未知字段会被拒绝（`deny_unknown_fields`），避免拼写错误被静默忽略；
//! - 加载入口在解析后统一调用 [`SocketConfig::validate`]。

use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::SocketError;

/// 套接字层配置。
///
/// ```toml
/// receive_buffer_size = 4096
/// write_timeout_ms = 500
/// reconnect = true
///
/// [reconnect_backoff]
/// initial_ms = 20
/// max_ms = 2000
/// multiplier = 2
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocketConfig {
    /// 读循环每次读取使用的缓冲区大小（字节）。
    pub receive_buffer_size: usize,
    /// 同步写的超时；`0` 表示不设超时。
    pub write_timeout_ms: u64,
    /// 单次建连尝试的超时。
    pub connect_timeout_ms: u64,
    /// 新建客户端默认是否在断线后自动重连。
    pub reconnect: bool,
    /// 重连退避策略。
    pub reconnect_backoff: BackoffConfig,
    /// 监听队列长度。
    pub listen_backlog: i32,
    /// 是否为 TCP 连接开启 `TCP_NODELAY`。
    pub nodelay: bool,
    /// 接受连接失败后的等待时长，避免监听器异常时空转。
    pub accept_error_backoff_ms: u64,
}

/// 重连退避参数，语义见 `ReconnectBackoff`。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            receive_buffer_size: 1000,
            write_timeout_ms: 1000,
            connect_timeout_ms: 1000,
            reconnect: true,
            reconnect_backoff: BackoffConfig::default(),
            listen_backlog: 128,
            nodelay: false,
            accept_error_backoff_ms: 100,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 10,
            max_ms: 1000,
            multiplier: 2,
        }
    }
}

impl SocketConfig {
    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(text: &str) -> Result<Self, SocketError> {
        let config: SocketConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载配置。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SocketError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| SocketError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// 校验字段间约束。
    ///
    /// # 契约（What）
    /// - `receive_buffer_size > 0`、`connect_timeout_ms > 0`、`listen_backlog > 0`；
    /// - `reconnect_backoff.multiplier >= 1` 且 `initial_ms <= max_ms`。
    pub fn validate(&self) -> Result<(), SocketError> {
        if self.receive_buffer_size == 0 {
            return Err(invalid("receive_buffer_size must be greater than 0"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(invalid("connect_timeout_ms must be greater than 0"));
        }
        if self.listen_backlog <= 0 {
            return Err(invalid("listen_backlog must be greater than 0"));
        }
        let backoff = &self.reconnect_backoff;
        if backoff.multiplier == 0 {
            return Err(invalid("reconnect_backoff.multiplier must be at least 1"));
        }
        if backoff.initial_ms > backoff.max_ms {
            return Err(invalid(
                "reconnect_backoff.initial_ms must not exceed reconnect_backoff.max_ms",
            ));
        }
        Ok(())
    }

    pub(crate) fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_ms > 0).then(|| Duration::from_millis(self.write_timeout_ms))
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub(crate) fn accept_error_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_error_backoff_ms)
    }
}

fn invalid(reason: &str) -> SocketError {
    SocketError::InvalidConfig(reason.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = SocketConfig::from_toml_str("").expect("空文档应解析为默认配置");
        assert_eq!(config, SocketConfig::default());
        assert_eq!(config.receive_buffer_size, 1000);
        assert_eq!(config.write_timeout(), Some(Duration::from_millis(1000)));
    }

    #[test]
    fn partial_document_overrides_selected_fields() {
        let config = SocketConfig::from_toml_str(
            r#"
            receive_buffer_size = 64
            reconnect = false

            [reconnect_backoff]
            max_ms = 50
            "#,
        )
        .expect("合法配置应解析成功");
        assert_eq!(config.receive_buffer_size, 64);
        assert!(!config.reconnect);
        assert_eq!(config.reconnect_backoff.initial_ms, 10);
        assert_eq!(config.reconnect_backoff.max_ms, 50);
    }

    #[test]
    fn zero_write_timeout_disables_it() {
        let config = SocketConfig {
            write_timeout_ms: 0,
            ..SocketConfig::default()
        };
        assert_eq!(config.write_timeout(), None);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = SocketConfig::from_toml_str("recieve_buffer_size = 10").unwrap_err();
        assert!(matches!(err, SocketError::ConfigParse(_)), "{err}");
    }

    #[test]
    fn inverted_backoff_bounds_fail_validation() {
        let err = SocketConfig::from_toml_str(
            r#"
            [reconnect_backoff]
            initial_ms = 500
            max_ms = 100
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, SocketError::InvalidConfig(_)), "{err}");
    }

    #[test]
    fn zero_buffer_fails_validation() {
        let config = SocketConfig {
            receive_buffer_size: 0,
            ..SocketConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = SocketConfig::load("/nonexistent/spark-socket.toml").unwrap_err();
        assert!(matches!(err, SocketError::ConfigRead { .. }));
        assert!(err.to_string().contains("spark-socket.toml"));
    }
}
