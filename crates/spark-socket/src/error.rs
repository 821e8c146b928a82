//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义连接抽象层对外暴露的错误语义：传输失败、读取失败、工厂事件错误与配置错误；
//! - 传输层故障只会以 [`SocketError`] 值的形式出现在事件通道上，不会以 panic 或 `Err` 形式打断调用方。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，与 `std::error::Error` 生态兼容；
//! - [`SocketError`] 携带稳定错误码（见 [`codes`]），遵循 `spark.socket.<语义>` 命名；
//! - 需要广播给多个订阅者的错误类型实现 `Clone`。

use std::borrow::Cow;
use std::time::Duration;

use thiserror::Error;

/// 稳定错误码表。
///
/// 错误码一经发布不得修改语义；新增码值需追加在末尾。
pub mod codes {
    /// 出站连接建立失败（未细分原因）。
    pub const CONNECT_FAILED: &str = "spark.socket.connect_failed";
    /// 对端拒绝连接或目标地址无监听者。
    pub const CONNECTION_REFUSED: &str = "spark.socket.connection_refused";
    /// 连接被对端重置或中断。
    pub const CONNECTION_RESET: &str = "spark.socket.connection_reset";
    /// 监听失败（未细分原因）。
    pub const LISTEN_FAILED: &str = "spark.socket.listen_failed";
    /// 监听地址已被占用。
    pub const ADDRESS_IN_USE: &str = "spark.socket.address_in_use";
    /// 接受入站连接失败。
    pub const ACCEPT_FAILED: &str = "spark.socket.accept_failed";
    /// 写入失败。
    pub const SEND_FAILED: &str = "spark.socket.send_failed";
    /// 读取失败。
    pub const RECEIVE_FAILED: &str = "spark.socket.receive_failed";
    /// 请求的传输实现未注册。
    pub const TRANSPORT_UNAVAILABLE: &str = "spark.socket.transport_unavailable";
    /// 端点配置非法。
    pub const INVALID_CONFIG: &str = "spark.socket.invalid_config";
    /// 连接已关闭，无法继续操作。
    pub const CLOSED: &str = "spark.socket.closed";
    /// 准入策略拒绝：地址命中黑名单。
    pub const REFUSED_DENIED: &str = "spark.socket.refused.denied";
    /// 准入策略拒绝：地址不在白名单内。
    pub const REFUSED_NOT_ALLOWED: &str = "spark.socket.refused.not_allowed";
    /// 准入策略拒绝：连接配额溢出。
    pub const REFUSED_OVERFLOW: &str = "spark.socket.refused.overflow";
}

/// 传输层错误的统一值类型。
///
/// # 教案式说明
/// - **契约 (What)**：`code` 为 [`codes`] 中的稳定字符串，`message` 面向排障人员；
///   值语义、可克隆，可同时投递给多个错误处理器。
/// - **执行逻辑 (How)**：传输实现在失败时构造本类型并通过
///   [`ClientHooks::error`](crate::ClientHooks::error) /
///   [`ServerHooks::error`](crate::ServerHooks::error) 上报，抽象层原样转发。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("[{code}] {message}")]
pub struct SocketError {
    code: &'static str,
    message: Cow<'static, str>,
}

impl SocketError {
    /// 以错误码与描述构造错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// 请求的传输实现未在注册表中提供。
    pub fn transport_unavailable(kind: impl std::fmt::Display) -> Self {
        Self::new(
            codes::TRANSPORT_UNAVAILABLE,
            format!("transport `{kind}` is not available"),
        )
    }

    /// 端点配置非法。
    pub fn invalid_config(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::INVALID_CONFIG, message)
    }

    /// 连接已关闭。
    pub fn closed(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::CLOSED, message)
    }

    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 人类可读描述。
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// [`ByteSize`](crate::ByteSize) 读取失败的原因。
///
/// `Reused` 属于编程契约错误，在 `read` 调用处同步返回；其余变体通过读取 Future 的结果交付。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ByteSizeError {
    /// 同一个 `ByteSize` 实例被第二次调用 `read`。
    #[error("byte size reader is single-use and has already been started")]
    Reused,
    /// 在超时时间内未收齐目标字节数。
    #[error("timed out after {waited:?} waiting for data")]
    Timeout { waited: Duration },
    /// 读取完成前底层连接已关闭。
    #[error("socket closed before the read was satisfied")]
    SocketClosed,
    /// 会话被丢弃（连接句柄全部释放），结果永远不会到达。
    #[error("read was abandoned before it settled")]
    Abandoned,
}

/// 工厂错误事件的来源分类。
///
/// [`as_str`](Self::as_str) 返回的名称即通用 `error` 事件中携带的“来源事件名”。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FactoryErrorKind {
    /// 出站传输构造或启动失败。
    ClientInit,
    /// 出站连接在建立前失败。
    ClientConnect,
    /// 已建立的出站连接上报的传输错误。
    Client,
    /// 监听器构造失败。
    ServerInit,
    /// 监听失败或监听器运行期错误。
    ServerListen,
    /// 入站连接被准入策略拒绝。
    ClientIpRefuse,
}

impl FactoryErrorKind {
    /// 来源事件名。
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientInit => "client-init-error",
            Self::ClientConnect => "client-connect-error",
            Self::Client => "client-error",
            Self::ServerInit => "server-init-error",
            Self::ServerListen => "server-listen-error",
            Self::ClientIpRefuse => "client-ip-refuse",
        }
    }
}

impl std::fmt::Display for FactoryErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 通用 `error` 事件的载荷：来源事件名 + 原始错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{kind}: {error}")]
pub struct FactoryError {
    pub kind: FactoryErrorKind,
    #[source]
    pub error: SocketError,
}

/// 配置解析与校验错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML 语法或结构错误（包括未知的传输类型标签）。
    #[error("failed to parse socket factory config: {0}")]
    Parse(#[from] toml::de::Error),
    /// 配置文件读取失败。
    #[error("failed to read socket factory config: {0}")]
    Io(#[from] std::io::Error),
    /// 语义校验失败。
    #[error("invalid socket factory config: {0}")]
    Invalid(String),
}
