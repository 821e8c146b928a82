use std::cell::{Cell, RefCell};
use std::fmt;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use bytes::{Bytes, BytesMut};
use spark_socket::{ClientHooks, ClientTransport, EndpointOptions, SocketError, codes};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{self, map_io_error};

const READ_CHUNK: usize = 8 * 1024;

/// 地址的 IP 文本；IPv4 映射的 IPv6 地址还原为 IPv4，双栈监听下黑白名单才能按 IPv4 匹配。
pub(crate) fn ip_text(addr: SocketAddr) -> String {
    addr.ip().to_canonical().to_string()
}

struct TcpShared {
    target: Option<(String, u16)>,
    hooks: RefCell<Option<ClientHooks>>,
    accepted: RefCell<Option<TcpStream>>,
    writer: RefCell<Option<mpsc::UnboundedSender<Bytes>>>,
    queued: RefCell<Vec<Bytes>>,
    connect_task: RefCell<Option<JoinHandle<()>>>,
    read_task: RefCell<Option<JoinHandle<()>>>,
    local: Cell<Option<SocketAddr>>,
    peer: Cell<Option<SocketAddr>>,
    started: Cell<bool>,
    closed: Cell<bool>,
    close_reported: Cell<bool>,
}

/// 基于 Tokio `TcpStream` 的 [`ClientTransport`]。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把 Tokio 的异步读写翻译为 [`ClientHooks`] 回调，使抽象层无需感知运行时；
///
/// ## 逻辑 (How)
/// - 出站：`connect` 派生本地任务执行 `TcpStream::connect`，成功后启动读写任务并上报 `connected`；
/// - 入站：[`TcpClientTransport::accepted`] 持有已建立的流，`hook` 时即启动读写任务；
/// - 读任务循环 `read_buf`，每个非空块上报一次 `data`；EOF 上报 `closed(false)`，错误上报 `error` + `closed(true)`；
/// - 写任务消费无界通道，连接建立前的写入暂存在队列中，建立后按序冲刷。
///
/// ## 契约 (What)
/// - `close` 幂等：停止读任务、关闭写通道（已排队数据写完后半关闭），并同步上报一次 `closed(false)`；
/// - `remote_address` 仅返回规范化的 IP 字符串，便于与黑白名单直接比较；
/// - **前置条件**：必须在 Tokio `LocalSet` 中使用。
pub struct TcpClientTransport {
    shared: Rc<TcpShared>,
}

impl TcpClientTransport {
    /// 构造出站传输；参数非法时返回 `invalid_config`。
    pub fn new(options: &EndpointOptions) -> Result<Self, SocketError> {
        if options.secure {
            return Err(SocketError::invalid_config(
                "raw tcp transport does not provide encryption",
            ));
        }
        if options.port == 0 {
            return Err(SocketError::invalid_config("tcp connect requires a non-zero port"));
        }
        Ok(Self::build(Some((options.host_or_default().to_owned(), options.port))))
    }

    /// 包装监听器接受的连接。
    pub fn accepted(stream: TcpStream) -> Self {
        let transport = Self::build(None);
        transport.shared.local.set(stream.local_addr().ok());
        transport.shared.peer.set(stream.peer_addr().ok());
        transport.shared.started.set(true);
        *transport.shared.accepted.borrow_mut() = Some(stream);
        transport
    }

    fn build(target: Option<(String, u16)>) -> Self {
        Self {
            shared: Rc::new(TcpShared {
                target,
                hooks: RefCell::new(None),
                accepted: RefCell::new(None),
                writer: RefCell::new(None),
                queued: RefCell::new(Vec::new()),
                connect_task: RefCell::new(None),
                read_task: RefCell::new(None),
                local: Cell::new(None),
                peer: Cell::new(None),
                started: Cell::new(false),
                closed: Cell::new(false),
                close_reported: Cell::new(false),
            }),
        }
    }
}

impl TcpShared {
    fn hooks(&self) -> Option<ClientHooks> {
        self.hooks.borrow().clone()
    }

    fn report_closed(&self, had_error: bool) {
        if self.close_reported.replace(true) {
            return;
        }
        self.closed.set(true);
        self.writer.borrow_mut().take();
        if let Some(hooks) = self.hooks() {
            hooks.closed(had_error);
        }
    }

    fn fail(&self, error: SocketError) {
        if self.close_reported.get() {
            return;
        }
        warn!(%error, peer = ?self.peer.get(), "tcp connection failed");
        if let Some(hooks) = self.hooks() {
            hooks.error(error);
        }
        self.report_closed(true);
    }

    /// 拆分读写半部并启动两个本地任务。
    fn start(self: &Rc<Self>, stream: TcpStream) {
        if let Err(error) = stream.set_nodelay(true) {
            debug!(%error, "tcp set_nodelay failed");
        }
        self.local.set(stream.local_addr().ok());
        self.peer.set(stream.peer_addr().ok());
        let (reader, writer) = stream.into_split();

        let (sender, receiver) = mpsc::unbounded_channel();
        for data in std::mem::take(&mut *self.queued.borrow_mut()) {
            let _ = sender.send(data);
        }
        *self.writer.borrow_mut() = Some(sender);

        let read_task = tokio::task::spawn_local(read_loop(Rc::downgrade(self), reader));
        *self.read_task.borrow_mut() = Some(read_task);
        tokio::task::spawn_local(write_loop(Rc::downgrade(self), writer, receiver));
    }
}

async fn read_loop(shared: Weak<TcpShared>, mut reader: OwnedReadHalf) {
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);
    loop {
        buffer.reserve(READ_CHUNK);
        let outcome = reader.read_buf(&mut buffer).await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match outcome {
            Ok(0) => {
                debug!(peer = ?shared.peer.get(), "tcp peer closed");
                shared.report_closed(false);
                return;
            }
            Ok(_) => {
                let chunk = buffer.split().freeze();
                if let Some(hooks) = shared.hooks() {
                    hooks.data(chunk);
                }
            }
            Err(error) => {
                shared.fail(map_io_error(error::READ, error));
                return;
            }
        }
    }
}

async fn write_loop(
    shared: Weak<TcpShared>,
    mut writer: OwnedWriteHalf,
    mut receiver: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(data) = receiver.recv().await {
        if let Err(error) = writer.write_all(&data).await {
            if let Some(shared) = shared.upgrade() {
                shared.fail(map_io_error(error::WRITE, error));
            }
            return;
        }
    }
    let _ = writer.shutdown().await;
}

impl ClientTransport for TcpClientTransport {
    fn hook(&self, hooks: ClientHooks) {
        *self.shared.hooks.borrow_mut() = Some(hooks);
        let accepted = self.shared.accepted.borrow_mut().take();
        if let Some(stream) = accepted {
            self.shared.start(stream);
        }
    }

    fn connect(&self) -> Result<(), SocketError> {
        let Some((host, port)) = self.shared.target.clone() else {
            return Err(SocketError::new(
                codes::CONNECT_FAILED,
                "accepted tcp connection cannot connect again",
            ));
        };
        if self.shared.closed.get() {
            return Err(SocketError::closed("tcp transport is closed"));
        }
        if self.shared.started.replace(true) {
            return Err(SocketError::new(codes::CONNECT_FAILED, "tcp connect already started"));
        }

        let weak = Rc::downgrade(&self.shared);
        let task = tokio::task::spawn_local(async move {
            let outcome = TcpStream::connect((host.as_str(), port)).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if shared.closed.get() {
                return;
            }
            match outcome {
                Ok(stream) => {
                    debug!(%host, port, "tcp connected");
                    shared.start(stream);
                    if let Some(hooks) = shared.hooks() {
                        hooks.connected();
                    }
                }
                Err(error) => shared.fail(map_io_error(error::CONNECT, error)),
            }
        });
        *self.shared.connect_task.borrow_mut() = Some(task);
        Ok(())
    }

    fn send(&self, data: Bytes) {
        if self.shared.closed.get() {
            return;
        }
        let writer = self.shared.writer.borrow();
        match writer.as_ref() {
            Some(sender) => {
                if let Err(mpsc::error::SendError(data)) = sender.send(data) {
                    trace!(len = data.len(), peer = ?self.shared.peer.get(), "tcp writer gone, dropping send");
                }
            }
            None => self.shared.queued.borrow_mut().push(data),
        }
    }

    fn close(&self) {
        if self.shared.closed.replace(true) {
            return;
        }
        self.shared.writer.borrow_mut().take();
        self.shared.queued.borrow_mut().clear();
        // 写任务在写完已排队数据后自行退出。
        let pending = [
            self.shared.connect_task.borrow_mut().take(),
            self.shared.read_task.borrow_mut().take(),
        ];
        for task in pending.into_iter().flatten() {
            task.abort();
        }
        self.shared.report_closed(false);
    }

    fn local_address(&self) -> Option<String> {
        self.shared.local.get().map(ip_text)
    }

    fn remote_address(&self) -> Option<String> {
        self.shared.peer.get().map(ip_text)
    }

    fn local_port(&self) -> Option<u16> {
        self.shared.local.get().map(|addr| addr.port())
    }

    fn remote_port(&self) -> Option<u16> {
        self.shared
            .peer
            .get()
            .map(|addr| addr.port())
            .or_else(|| self.shared.target.as_ref().map(|(_, port)| *port))
    }
}

impl fmt::Debug for TcpClientTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpClientTransport")
            .field("target", &self.shared.target)
            .field("peer", &self.shared.peer.get())
            .field("closed", &self.shared.closed.get())
            .finish()
    }
}
