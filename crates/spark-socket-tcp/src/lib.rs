#![deny(unsafe_code)]
#![doc = r#"
# spark-socket-tcp

## 设计动机（Why）
- **定位**：为 `spark-socket` 的 [`ClientTransport`](spark_socket::ClientTransport) /
  [`ServerTransport`](spark_socket::ServerTransport) 契约提供基于 Tokio 的原始 TCP 实现；
- **架构角色**：作为传输实现层的参照实现，TLS/WebSocket 适配可按同样的方式接入注册表。

## 核心契约（What）
- [`TcpClientTransport`]：出站连接或包装已接受的流；
- [`TcpServerTransport`]：`socket2` 构造的监听套接字 + Tokio accept 循环；
- [`TokioTimeDriver`]：`spawn_local` + `sleep` 的计时驱动器；
- [`register`]：把 `TransportKind::Tcp` 的两种角色登记到注册表。

## 实现策略（How）
- 读写各占一个本地任务，I/O 结果通过钩子回到单线程的连接状态；
- I/O 错误按操作映射为带稳定错误码的 [`SocketError`](spark_socket::SocketError)。

## 风险与考量（Trade-offs）
- 所有类型都是 `!Send`，必须在 Tokio `LocalSet` 中使用；
- 写通道无界，发送方需自行控制写入速率。
"#]

mod client;
mod error;
mod listener;
mod time;

pub use client::TcpClientTransport;
pub use listener::TcpServerTransport;
pub use time::TokioTimeDriver;

use spark_socket::{ClientTransport, ServerTransport, TransportKind, TransportRegistry};

/// 登记 TCP 的客户端与服务端构造函数。
pub fn register(registry: TransportRegistry) -> TransportRegistry {
    registry
        .with_client(TransportKind::Tcp, |options| {
            TcpClientTransport::new(options)
                .map(|transport| Box::new(transport) as Box<dyn ClientTransport>)
        })
        .with_server(TransportKind::Tcp, |options| {
            TcpServerTransport::new(options)
                .map(|transport| Box::new(transport) as Box<dyn ServerTransport>)
        })
}
