//! 传输实现注册表。
//!
//! # 教案式说明
//! - **意图 (Why)**：传输可用性是构造工厂时显式注入的能力集合，而非运行期探测环境；
//! - **契约 (What)**：[`TransportKind`] 到构造函数的映射，客户端与服务端角色分别登记；
//!   未登记的类型返回 `spark.socket.transport_unavailable` 错误，由工厂转换为 init-error 事件；
//! - **注意 (Trade-offs)**：构造函数只负责创建传输句柄，不应发起 I/O；连接与监听由
//!   [`Client::connect`](crate::Client::connect) / [`Server::listen`](crate::Server::listen) 触发。

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::client::ClientTransport;
use crate::config::{EndpointOptions, ServerOptions, TransportKind};
use crate::error::SocketError;
use crate::server::ServerTransport;

type ClientConstructor = Rc<dyn Fn(&EndpointOptions) -> Result<Box<dyn ClientTransport>, SocketError>>;
type ServerConstructor = Rc<dyn Fn(&ServerOptions) -> Result<Box<dyn ServerTransport>, SocketError>>;

/// 按传输类型分派的构造函数表。克隆共享同一组构造函数。
#[derive(Clone, Default)]
pub struct TransportRegistry {
    clients: HashMap<TransportKind, ClientConstructor>,
    servers: HashMap<TransportKind, ServerConstructor>,
}

impl TransportRegistry {
    /// 空注册表：任何类型都不可用。
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记客户端构造函数；同类型重复登记时后者覆盖前者。
    pub fn with_client<F>(mut self, kind: TransportKind, constructor: F) -> Self
    where
        F: Fn(&EndpointOptions) -> Result<Box<dyn ClientTransport>, SocketError> + 'static,
    {
        self.clients.insert(kind, Rc::new(constructor));
        self
    }

    /// 登记服务端构造函数。
    pub fn with_server<F>(mut self, kind: TransportKind, constructor: F) -> Self
    where
        F: Fn(&ServerOptions) -> Result<Box<dyn ServerTransport>, SocketError> + 'static,
    {
        self.servers.insert(kind, Rc::new(constructor));
        self
    }

    /// 合并另一张注册表，`other` 中的条目优先。
    pub fn merge(mut self, other: TransportRegistry) -> Self {
        self.clients.extend(other.clients);
        self.servers.extend(other.servers);
        self
    }

    /// 构造客户端传输。
    pub fn create_client(
        &self,
        kind: TransportKind,
        options: &EndpointOptions,
    ) -> Result<Box<dyn ClientTransport>, SocketError> {
        let constructor = self
            .clients
            .get(&kind)
            .ok_or_else(|| SocketError::transport_unavailable(kind))?;
        constructor(options)
    }

    /// 构造服务端传输。
    pub fn create_server(
        &self,
        kind: TransportKind,
        options: &ServerOptions,
    ) -> Result<Box<dyn ServerTransport>, SocketError> {
        let constructor = self
            .servers
            .get(&kind)
            .ok_or_else(|| SocketError::transport_unavailable(kind))?;
        constructor(options)
    }

    /// 是否提供该类型的客户端实现。
    pub fn supports_client(&self, kind: TransportKind) -> bool {
        self.clients.contains_key(&kind)
    }

    /// 是否提供该类型的服务端实现。
    pub fn supports_server(&self, kind: TransportKind) -> bool {
        self.servers.contains_key(&kind)
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut clients: Vec<_> = self.clients.keys().map(TransportKind::as_str).collect();
        let mut servers: Vec<_> = self.servers.keys().map(TransportKind::as_str).collect();
        clients.sort_unstable();
        servers.sort_unstable();
        f.debug_struct("TransportRegistry")
            .field("clients", &clients)
            .field("servers", &servers)
            .finish()
    }
}
