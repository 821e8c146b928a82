//! 定长读取：在 [`Client`] 的数据/关闭事件与“回读”原语之上，精确读取 N 个字节。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 帧头、长度前缀等协议字段需要“恰好 N 字节”，而传输层按任意块边界投递数据；
//! - 多余的字节必须原样放回连接，保证下一位消费者（新的 `ByteSize` 或普通处理器）最先看到它们。
//!
//! ## 执行逻辑（How）
//! 1. `read` 依次挂载关闭处理器、启动超时定时器、挂载数据处理器（挂载时会回放已缓存数据）；
//! 2. 每个数据块追加进累积缓冲，满足目标即切出结果；
//! 3. 任一出口（满足、超时、连接关闭）都执行同一收尾：摘除两个处理器、取消定时器、
//!    把剩余字节回读到数据通道队首，再交付结果。
//!
//! ## 契约（What）
//! - 每个实例恰好交付一次：成功、超时或连接关闭三者之一；
//! - 第二次调用 `read` 同步返回 [`ByteSizeError::Reused`]，不产生任何副作用；
//! - [`ReadTarget::Exact`]`(0)` 立即以空字节完成，不触碰连接；
//! - [`ReadTarget::Available`] 在累积为空时不会完成。

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::channel::oneshot;
use tracing::trace;

use crate::client::{Client, WeakClient};
use crate::error::ByteSizeError;
use crate::event::HandlerId;
use crate::time::{TimeDriver, TimerHandle};

/// 默认读取超时。
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(3000);

/// 读取目标。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadTarget {
    /// 恰好 N 字节。
    Exact(usize),
    /// 当前已累积的全部字节（至少一个）。
    Available,
}

impl From<usize> for ReadTarget {
    fn from(len: usize) -> Self {
        Self::Exact(len)
    }
}

type ReadResult = Result<Bytes, ByteSizeError>;

/// 一次性定长读取器。
pub struct ByteSize {
    client: Client,
    time: Rc<dyn TimeDriver>,
    started: Cell<bool>,
}

impl ByteSize {
    /// 绑定到一个连接。
    pub fn new(client: &Client, time: Rc<dyn TimeDriver>) -> Self {
        Self {
            client: client.clone(),
            time,
            started: Cell::new(false),
        }
    }

    /// 以默认超时读取。
    pub fn read_default(&self, target: impl Into<ReadTarget>) -> Result<ByteSizeRead, ByteSizeError> {
        self.read(target, Some(DEFAULT_READ_TIMEOUT))
    }

    /// 开始读取；`timeout` 为 `None` 时不设超时。
    ///
    /// 返回的 [`ByteSizeRead`] 在读取结束时就绪。
    pub fn read(
        &self,
        target: impl Into<ReadTarget>,
        timeout: Option<Duration>,
    ) -> Result<ByteSizeRead, ByteSizeError> {
        if self.started.replace(true) {
            return Err(ByteSizeError::Reused);
        }
        let target = target.into();
        let (sender, receiver) = oneshot::channel();
        let read = ByteSizeRead { receiver };

        if target == ReadTarget::Exact(0) {
            let _ = sender.send(Ok(Bytes::new()));
            return Ok(read);
        }

        let session = Rc::new(Session {
            client: self.client.downgrade(),
            target,
            buffer: RefCell::new(BytesMut::new()),
            data_id: Cell::new(None),
            close_id: Cell::new(None),
            timer: RefCell::new(None),
            settled: Cell::new(false),
            sender: RefCell::new(Some(sender)),
        });
        let events = self.client.events();

        let close_id = events.close.attach({
            let session = Rc::clone(&session);
            move |_| session.settle(Err(ByteSizeError::SocketClosed))
        });
        session.close_id.set(Some(close_id));

        if let Some(waited) = timeout {
            let weak: Weak<Session> = Rc::downgrade(&session);
            let handle = self.time.schedule(
                waited,
                Box::new(move || {
                    if let Some(session) = weak.upgrade() {
                        trace!(?waited, "byte size read timed out");
                        session.settle(Err(ByteSizeError::Timeout { waited }));
                    }
                }),
            );
            *session.timer.borrow_mut() = Some(handle);
        }

        events.data.attach_with(|id| {
            session.data_id.set(Some(id));
            let session = Rc::clone(&session);
            move |chunk: Bytes| session.on_data(chunk)
        });

        if !session.settled.get() && self.client.is_closed() {
            session.settle(Err(ByteSizeError::SocketClosed));
        }
        Ok(read)
    }

    /// 是否已调用过 `read`。
    pub fn is_started(&self) -> bool {
        self.started.get()
    }
}

impl fmt::Debug for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteSize")
            .field("client", &self.client.id())
            .field("started", &self.started.get())
            .finish()
    }
}

struct Session {
    client: WeakClient,
    target: ReadTarget,
    buffer: RefCell<BytesMut>,
    data_id: Cell<Option<HandlerId>>,
    close_id: Cell<Option<HandlerId>>,
    timer: RefCell<Option<TimerHandle>>,
    settled: Cell<bool>,
    sender: RefCell<Option<oneshot::Sender<ReadResult>>>,
}

impl Session {
    fn on_data(&self, chunk: Bytes) {
        if self.settled.get() {
            return;
        }
        let ready = {
            let mut buffer = self.buffer.borrow_mut();
            buffer.extend_from_slice(&chunk);
            match self.target {
                ReadTarget::Exact(len) if buffer.len() >= len => Some(buffer.split_to(len).freeze()),
                ReadTarget::Available if !buffer.is_empty() => Some(buffer.split().freeze()),
                _ => None,
            }
        };
        if let Some(head) = ready {
            self.settle(Ok(head));
        }
    }

    fn settle(&self, result: ReadResult) {
        if self.settled.replace(true) {
            return;
        }
        if let Some(client) = self.client.upgrade() {
            let events = client.events();
            if let Some(id) = self.data_id.take() {
                events.data.detach(id);
            }
            if let Some(id) = self.close_id.take() {
                events.close.detach(id);
            }
            let rest = self.buffer.borrow_mut().split().freeze();
            client.unread(rest);
        }
        let timer = self.timer.borrow_mut().take();
        if let Some(timer) = timer {
            timer.cancel();
        }
        let sender = self.sender.borrow_mut().take();
        if let Some(sender) = sender {
            let _ = sender.send(result);
        }
    }
}

/// 读取结果的 Future。
///
/// 会话在交付前被丢弃（连接的所有句柄都已释放）时输出 [`ByteSizeError::Abandoned`]。
#[must_use = "the read result is only observable by polling"]
#[derive(Debug)]
pub struct ByteSizeRead {
    receiver: oneshot::Receiver<ReadResult>,
}

impl Future for ByteSizeRead {
    type Output = ReadResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(ByteSizeError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}
