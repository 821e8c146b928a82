#![deny(unsafe_code)]
#![doc = r#"
# spark-socket

## 设计动机（Why）
- **定位**：与具体传输无关的连接抽象与准入控制引擎。TCP、TLS、WebSocket 等实现只需满足
  [`ClientTransport`] / [`ServerTransport`] 两个小契约，即可获得统一的事件缓存语义、
  定长读取与工厂级准入策略。
- **核心难点**：在单线程回调模型下保证确定性的事件顺序，并允许数据处理器摘下再挂上而不丢字节；
  同时在不了解底层传输的前提下执行跨实例的连接配额与地址策略。

## 核心契约（What）
- [`EventChannel`]：每个事件名一个处理器列表 + 待投递队列，挂载时按到达顺序回放；
- [`Client`] / [`Server`]：包装传输句柄，暴露 send/close/unread 与生命周期事件；
- [`ByteSize`]：恰好读取 N 字节，多余部分回读到连接；
- [`SocketFactory`]：组合一个出站连接与一个监听器，执行黑白名单、配额与重连；
- [`LoopbackLink`] / [`LoopbackNetwork`]：进程内回环传输，供测试驱动完整契约。

## 实现策略（How）
- 状态全部基于 `Rc`/`RefCell`/`Cell`，调用用户回调或传输钩子前释放所有借用；
- 计时统一经由注入的 [`TimeDriver`]，测试使用确定性的 [`ManualTimeDriver`]；
- 传输可用性通过 [`TransportRegistry`] 在构造工厂时显式注入。

## 风险与考量（Trade-offs）
- 所有句柄均为 `!Send`，需在单线程执行器（例如 Tokio `LocalSet`）中使用；
- 出站连接建立后的配额复查与服务端准入交错执行，仅提供尽力而为的保证。
"#]

pub mod byte_size;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod factory;
pub mod loopback;
pub mod quota;
pub mod registry;
pub mod server;
pub mod time;

pub use byte_size::{ByteSize, ByteSizeRead, DEFAULT_READ_TIMEOUT, ReadTarget};
pub use client::{Client, ClientHooks, ClientTransport, ConnectionId, WeakClient};
pub use config::{
    ClientConfig, EndpointOptions, ServerConfig, ServerOptions, SocketFactoryConfig, TransportKind,
};
pub use error::{ByteSizeError, ConfigError, FactoryError, FactoryErrorKind, SocketError, codes};
pub use event::{EventChannel, HandlerId, Placement};
pub use factory::{
    ClientState, Connection, FactoryEvents, FactoryState, RefuseReason, Refusal, ServerState,
    SocketFactory,
};
pub use loopback::{LoopbackConnector, LoopbackEndpoint, LoopbackLink, LoopbackListener, LoopbackNetwork};
pub use quota::{GLOBAL_BUCKET, QuotaLease, QuotaLimits, QuotaStats};
pub use registry::TransportRegistry;
pub use server::{Server, ServerHooks, ServerTransport};
pub use time::{ManualTimeDriver, TimeDriver, TimerHandle, TimerTask};
