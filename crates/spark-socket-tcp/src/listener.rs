use std::cell::{Cell, RefCell};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::{Rc, Weak};

use socket2::{Domain, Protocol, Socket, Type};
use spark_socket::{ServerHooks, ServerOptions, ServerTransport, SocketError};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::client::{TcpClientTransport, ip_text};
use crate::error::{self, map_io_error};

const BACKLOG: i32 = 1024;

struct ListenerShared {
    options: ServerOptions,
    hooks: RefCell<Option<ServerHooks>>,
    local: Cell<Option<SocketAddr>>,
    accept_task: RefCell<Option<JoinHandle<()>>>,
    closed: Cell<bool>,
}

/// 基于 Tokio `TcpListener` 的 [`ServerTransport`]。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 绑定阶段需要 `IPV6_V6ONLY` 与 `SO_REUSEADDR` 等选项，Tokio 的 `bind` 不暴露这些开关，
///   因此先用 `socket2` 构造并配置套接字，再转交 Tokio。
///
/// ## 逻辑 (How)
/// - `listen`：同步解析地址并绑定，失败立即以 `Err` 返回；成功后派生本地 accept 循环；
/// - 每个接受的流包装为 [`TcpClientTransport::accepted`] 交给 `hooks.connection`；
/// - accept 失败只上报 `error`，循环继续运行。
///
/// ## 契约 (What)
/// - `close` 幂等：中止 accept 循环（随之释放监听套接字）并同步上报一次 `closed`；
/// - **前置条件**：`listen` 必须在 Tokio `LocalSet` 中调用。
pub struct TcpServerTransport {
    shared: Rc<ListenerShared>,
}

impl TcpServerTransport {
    /// 构造监听传输；不进行任何 I/O。
    pub fn new(options: &ServerOptions) -> Result<Self, SocketError> {
        if options.endpoint.secure || options.request_cert {
            return Err(SocketError::invalid_config(
                "raw tcp listener does not provide encryption",
            ));
        }
        Ok(Self {
            shared: Rc::new(ListenerShared {
                options: options.clone(),
                hooks: RefCell::new(None),
                local: Cell::new(None),
                accept_task: RefCell::new(None),
                closed: Cell::new(false),
            }),
        })
    }

    /// 实际绑定地址。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local.get()
    }
}

fn resolve(options: &ServerOptions) -> Result<SocketAddr, SocketError> {
    let host = options.endpoint.host.as_deref().unwrap_or("0.0.0.0");
    (host, options.endpoint.port)
        .to_socket_addrs()
        .map_err(|err| map_io_error(error::BIND, err))?
        .next()
        .ok_or_else(|| SocketError::invalid_config(format!("`{host}` did not resolve to an address")))
}

fn bind(addr: SocketAddr, options: &ServerOptions) -> Result<std::net::TcpListener, SocketError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|err| map_io_error(error::BIND, err))?;
    if addr.is_ipv6() {
        socket
            .set_only_v6(options.ipv6_only)
            .map_err(|err| map_io_error(error::BIND, err))?;
    }
    socket
        .set_reuse_address(true)
        .map_err(|err| map_io_error(error::BIND, err))?;
    socket
        .set_nonblocking(true)
        .map_err(|err| map_io_error(error::BIND, err))?;
    socket
        .bind(&addr.into())
        .map_err(|err| map_io_error(error::BIND, err))?;
    socket
        .listen(BACKLOG)
        .map_err(|err| map_io_error(error::LISTEN, err))?;
    Ok(socket.into())
}

async fn accept_loop(shared: Weak<ListenerShared>, listener: TcpListener) {
    loop {
        let outcome = listener.accept().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.closed.get() {
            return;
        }
        let hooks = shared.hooks.borrow().clone();
        let Some(hooks) = hooks else {
            return;
        };
        match outcome {
            Ok((stream, peer)) => {
                debug!(%peer, "tcp accepted");
                hooks.connection(Box::new(TcpClientTransport::accepted(stream)));
            }
            Err(err) => {
                warn!(error = %err, "tcp accept failed");
                hooks.error(map_io_error(error::ACCEPT, err));
            }
        }
    }
}

impl ServerTransport for TcpServerTransport {
    fn hook(&self, hooks: ServerHooks) {
        *self.shared.hooks.borrow_mut() = Some(hooks);
    }

    fn listen(&self) -> Result<(), SocketError> {
        if self.shared.closed.get() {
            return Err(SocketError::closed("tcp listener is closed"));
        }
        if self.shared.accept_task.borrow().is_some() {
            return Ok(());
        }
        let addr = resolve(&self.shared.options)?;
        let std_listener = bind(addr, &self.shared.options)?;
        let listener = TcpListener::from_std(std_listener)
            .map_err(|err| map_io_error(error::LISTEN, err))?;
        let local = listener
            .local_addr()
            .map_err(|err| map_io_error(error::LISTEN, err))?;
        self.shared.local.set(Some(local));
        debug!(%local, "tcp listening");

        let task = tokio::task::spawn_local(accept_loop(Rc::downgrade(&self.shared), listener));
        *self.shared.accept_task.borrow_mut() = Some(task);
        Ok(())
    }

    fn close(&self) {
        if self.shared.closed.replace(true) {
            return;
        }
        let task = self.shared.accept_task.borrow_mut().take();
        if let Some(task) = task {
            task.abort();
        }
        let hooks = self.shared.hooks.borrow().clone();
        if let Some(hooks) = hooks {
            hooks.closed();
        }
    }

    fn local_address(&self) -> Option<String> {
        self.shared.local.get().map(ip_text)
    }

    fn local_port(&self) -> Option<u16> {
        self.shared.local.get().map(|addr| addr.port())
    }
}

impl fmt::Debug for TcpServerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServerTransport")
            .field("local", &self.shared.local.get())
            .field("closed", &self.shared.closed.get())
            .finish()
    }
}
