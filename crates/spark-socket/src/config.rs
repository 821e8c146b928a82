//! 端点与工厂配置。
//!
//! # 教案式说明
//! - **契约 (What)**：所有配置结构派生 `serde`，键名使用 `snake_case`；
//!   [`TransportKind`] 为封闭枚举，未知的传输标签在解析阶段即被拒绝；
//! - **执行逻辑 (How)**：[`SocketFactoryConfig::from_toml_str`] 解析后立即执行
//!   [`SocketFactoryConfig::validate`]；代码构造的配置可手动调用 `validate`；
//! - **约束**：配置一旦交给 Client/Server/Factory 即被克隆持有，之后不再变化。

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::quota::QuotaLimits;

/// 传输实现的类型标签。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// 原始字节流套接字。
    #[serde(alias = "net")]
    Tcp,
    /// TLS 字节流。
    Tls,
    /// WebSocket。
    #[serde(alias = "ws")]
    WebSocket,
    /// 进程内回环传输。
    Loopback,
}

impl TransportKind {
    /// 配置中使用的标签。
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tls => "tls",
            Self::WebSocket => "web-socket",
            Self::Loopback => "loopback",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 客户端与服务端共用的端点参数。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointOptions {
    /// 主机名或地址；出站连接的目标，或监听地址。
    pub host: Option<String>,
    /// 端口。
    pub port: u16,
    /// 无数据处理器时是否缓存到达的数据。
    pub buffer_data: bool,
    /// 是否使用加密传输（由具体传输实现解释）。
    pub secure: bool,
    /// 是否校验对端证书。
    pub reject_unauthorized: bool,
    /// PEM 证书。
    pub cert: Option<String>,
    /// PEM 私钥。
    pub key: Option<String>,
    /// PEM CA 证书。
    pub ca: Option<String>,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            host: None,
            port: 0,
            buffer_data: true,
            secure: false,
            reject_unauthorized: true,
            cert: None,
            key: None,
            ca: None,
        }
    }
}

impl EndpointOptions {
    /// 指定主机与端口，其余取默认值。
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port,
            ..Self::default()
        }
    }

    /// 覆盖 `buffer_data`。
    pub fn with_buffer_data(mut self, buffer_data: bool) -> Self {
        self.buffer_data = buffer_data;
        self
    }

    /// 覆盖 `secure`。
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// 主机名，缺省为 `localhost`。
    pub fn host_or_default(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }

    fn validate(&self, role: &str) -> Result<(), ConfigError> {
        if let Some(host) = &self.host
            && host.trim().is_empty()
        {
            return Err(ConfigError::Invalid(format!("{role}.host must not be empty")));
        }
        if self.key.is_some() != self.cert.is_some() {
            return Err(ConfigError::Invalid(format!(
                "{role}.cert and {role}.key must be given together"
            )));
        }
        Ok(())
    }
}

/// 服务端端点参数：在 [`EndpointOptions`] 之上增加监听专属选项。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    #[serde(flatten)]
    pub endpoint: EndpointOptions,
    /// IPv6 监听时是否拒绝 IPv4 映射地址。
    pub ipv6_only: bool,
    /// 是否要求客户端出示证书。
    pub request_cert: bool,
}

impl ServerOptions {
    /// 指定监听主机与端口。
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            endpoint: EndpointOptions::new(host, port),
            ..Self::default()
        }
    }
}

impl From<EndpointOptions> for ServerOptions {
    fn from(endpoint: EndpointOptions) -> Self {
        Self {
            endpoint,
            ..Self::default()
        }
    }
}

/// 工厂的出站角色配置。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub kind: TransportKind,
    #[serde(flatten)]
    pub options: EndpointOptions,
    /// 重连延迟（秒）；`<= 0` 表示不重连。
    #[serde(default)]
    pub reconnect_delay_seconds: f64,
}

impl ClientConfig {
    /// 构造不重连的出站配置。
    pub fn new(kind: TransportKind, options: EndpointOptions) -> Self {
        Self {
            kind,
            options,
            reconnect_delay_seconds: 0.0,
        }
    }

    /// 覆盖重连延迟。
    pub fn with_reconnect_delay(mut self, seconds: f64) -> Self {
        self.reconnect_delay_seconds = seconds;
        self
    }

    /// 生效的重连延迟；未启用时返回 `None`。
    pub fn reconnect_delay(&self) -> Option<Duration> {
        if self.reconnect_delay_seconds > 0.0 {
            Duration::try_from_secs_f64(self.reconnect_delay_seconds).ok()
        } else {
            None
        }
    }
}

/// 工厂的监听角色配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub kind: TransportKind,
    #[serde(flatten)]
    pub options: ServerOptions,
    /// 黑名单：命中即拒绝。
    #[serde(default)]
    pub denied_addresses: Vec<String>,
    /// 白名单：非空时只接纳名单内地址。
    #[serde(default)]
    pub allowed_addresses: Vec<String>,
}

impl ServerConfig {
    /// 构造无地址策略的监听配置。
    pub fn new(kind: TransportKind, options: impl Into<ServerOptions>) -> Self {
        Self {
            kind,
            options: options.into(),
            denied_addresses: Vec::new(),
            allowed_addresses: Vec::new(),
        }
    }

    /// 覆盖黑名单。
    pub fn with_denied<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.denied_addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    /// 覆盖白名单。
    pub fn with_allowed<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_addresses = addresses.into_iter().map(Into::into).collect();
        self
    }

    /// 地址是否在黑名单中。
    pub fn is_denied(&self, address: &str) -> bool {
        self.denied_addresses.iter().any(|entry| entry == address)
    }

    /// 白名单是否生效且地址不在其中。
    pub fn is_not_allowed(&self, address: &str) -> bool {
        !self.allowed_addresses.is_empty()
            && !self.allowed_addresses.iter().any(|entry| entry == address)
    }
}

/// [`SocketFactory`](crate::SocketFactory) 的完整配置。
///
/// ```toml
/// max_connections = 100
/// max_connections_per_ip = 4
///
/// [server]
/// kind = "tcp"
/// host = "0.0.0.0"
/// port = 7000
/// denied_addresses = ["10.0.0.1"]
///
/// [client]
/// kind = "tcp"
/// host = "upstream.internal"
/// port = 7001
/// reconnect_delay_seconds = 2.5
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SocketFactoryConfig {
    #[serde(default)]
    pub client: Option<ClientConfig>,
    #[serde(default)]
    pub server: Option<ServerConfig>,
    #[serde(flatten)]
    pub limits: QuotaLimits,
}

impl SocketFactoryConfig {
    /// 解析并校验 TOML 配置。
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件读取、解析并校验。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// 语义校验。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(client) = &self.client {
            client.options.validate("client")?;
            if !client.reconnect_delay_seconds.is_finite() {
                return Err(ConfigError::Invalid(
                    "client.reconnect_delay_seconds must be finite".to_owned(),
                ));
            }
            if client.reconnect_delay_seconds < 0.0 {
                return Err(ConfigError::Invalid(
                    "client.reconnect_delay_seconds must not be negative".to_owned(),
                ));
            }
        }
        if let Some(server) = &self.server {
            server.options.endpoint.validate("server")?;
            if let Some(address) = server
                .denied_addresses
                .iter()
                .find(|address| server.allowed_addresses.contains(address))
            {
                return Err(ConfigError::Invalid(format!(
                    "address `{address}` is both denied and allowed"
                )));
            }
        }
        Ok(())
    }
}
