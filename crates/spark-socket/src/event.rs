//! 事件通道：单个事件名的处理器列表 + 待投递队列。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - Client/Server/Factory 的每个事件名各自持有一个 [`EventChannel`]，统一“无人订阅时缓存、
//!   订阅时按序回放”的规则；
//! - 允许所有者暂时摘下数据处理器（例如把活动连接移交给另一位所有者），期间到达的字节进入
//!   待投递队列，等待下一次 `attach`。
//!
//! ## 契约（What）
//! - 待投递项只在处理器列表为空且允许缓存时保留；
//! - `attach` 时若列表原本为空，先把队列内容按到达顺序交给新处理器，再清空队列，最后追加处理器；
//! - `dispatch(.., Placement::Head)` 是唯一的插队路径，供“回读（unread）”使用。
//!
//! ## 实现策略（How）
//! - 状态放在 `RefCell` 中，调用任意处理器前都会释放借用，处理器内部可以重入
//!   `attach`/`detach`/`emit`；
//! - 回放逐项出队：回放期间新入队（包括队首回读）的数据按队列顺序继续交给同一处理器；
//!   若处理器在回放中摘除自身，回放立即停止，剩余数据留在队列中；
//! - 回放中的处理器此时尚未进入列表，若它在回调里再 `attach` 一个处理器，新处理器接手剩余队列，
//!   外层回放随后发现队列已空。

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

/// 事件处理器的身份标识，由 [`EventChannel::attach`] 返回，用于 [`EventChannel::detach`]。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// 缓存数据在队列中的插入位置。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placement {
    /// 追加到队尾（正常到达）。
    Tail,
    /// 插入到队首（回读）。
    Head,
}

type Handler<T> = Rc<dyn Fn(T)>;

struct ChannelState<T> {
    handlers: Vec<(HandlerId, Handler<T>)>,
    pending: VecDeque<T>,
    /// 正在执行回放的处理器。
    attaching: Vec<HandlerId>,
    /// 回放期间被摘除的处理器。
    retired: Vec<HandlerId>,
    next_id: u64,
}

/// 单个事件名的处理器列表与待投递队列。
pub struct EventChannel<T> {
    buffering: bool,
    state: RefCell<ChannelState<T>>,
}

impl<T: Clone + 'static> EventChannel<T> {
    /// 创建通道；`buffering` 决定无人订阅时 `emit` 的数据是否入队。
    pub fn new(buffering: bool) -> Self {
        Self {
            buffering,
            state: RefCell::new(ChannelState {
                handlers: Vec::new(),
                pending: VecDeque::new(),
                attaching: Vec::new(),
                retired: Vec::new(),
                next_id: 0,
            }),
        }
    }

    /// 该通道是否默认缓存。
    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    /// 注册处理器，必要时先回放队列。
    pub fn attach(&self, handler: impl Fn(T) + 'static) -> HandlerId {
        self.attach_with(|_| handler)
    }

    /// 注册处理器；`make` 在回放开始前拿到处理器自己的 [`HandlerId`]。
    ///
    /// 回放阶段就可能需要摘除自身的一次性消费者（例如定长读取）依赖这个入口。
    pub fn attach_with<F>(&self, make: impl FnOnce(HandlerId) -> F) -> HandlerId
    where
        F: Fn(T) + 'static,
    {
        let (id, replay) = {
            let mut state = self.state.borrow_mut();
            let id = HandlerId(state.next_id);
            state.next_id += 1;
            // 回放中的处理器尚未进入列表，嵌套 attach 同样视为首个处理器，接手剩余队列。
            let replay = state.handlers.is_empty();
            if replay {
                state.attaching.push(id);
            }
            (id, replay)
        };
        let handler: Handler<T> = Rc::new(make(id));

        if replay {
            loop {
                let item = {
                    let mut state = self.state.borrow_mut();
                    if state.retired.contains(&id) {
                        None
                    } else {
                        state.pending.pop_front()
                    }
                };
                match item {
                    Some(item) => handler(item),
                    None => break,
                }
            }
            let mut state = self.state.borrow_mut();
            state.attaching.retain(|candidate| *candidate != id);
            if let Some(index) = state.retired.iter().position(|candidate| *candidate == id) {
                state.retired.swap_remove(index);
                return id;
            }
        }

        self.state.borrow_mut().handlers.push((id, handler));
        id
    }

    /// 摘除处理器；对待投递队列无影响。未知 id 静默忽略。
    pub fn detach(&self, id: HandlerId) {
        let mut state = self.state.borrow_mut();
        state.handlers.retain(|(candidate, _)| *candidate != id);
        if state.attaching.contains(&id) && !state.retired.contains(&id) {
            state.retired.push(id);
        }
    }

    /// 按通道默认策略投递：有处理器则立即回调，否则按需入队尾。
    pub fn emit(&self, data: T) {
        self.dispatch(data, self.buffering, Placement::Tail);
    }

    /// 强制缓存并插入队首；有处理器时等价于立即投递。
    pub fn emit_front(&self, data: T) {
        self.dispatch(data, true, Placement::Head);
    }

    /// 通用投递入口。
    ///
    /// - 处理器列表非空：按注册顺序逐个回调，不入队；
    /// - 列表为空且 `buffer` 为真：按 `placement` 入队；
    /// - 否则丢弃。
    pub fn dispatch(&self, data: T, buffer: bool, placement: Placement) {
        let handlers: Vec<Handler<T>> = {
            let mut state = self.state.borrow_mut();
            if state.handlers.is_empty() {
                if buffer {
                    match placement {
                        Placement::Tail => state.pending.push_back(data),
                        Placement::Head => state.pending.push_front(data),
                    }
                }
                return;
            }
            state.handlers.iter().map(|(_, handler)| Rc::clone(handler)).collect()
        };

        let last = handlers.len() - 1;
        let mut data = Some(data);
        for (index, handler) in handlers.iter().enumerate() {
            let item = if index == last {
                data.take()
            } else {
                data.clone()
            };
            if let Some(item) = item {
                handler(item);
            }
        }
    }

    /// 当前注册的处理器数量。
    pub fn handler_count(&self) -> usize {
        self.state.borrow().handlers.len()
    }

    /// 当前缓存的待投递项数量。
    pub fn pending_len(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// 丢弃全部待投递项。
    pub fn clear_pending(&self) {
        self.state.borrow_mut().pending.clear();
    }
}

impl<T> fmt::Debug for EventChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("EventChannel")
            .field("buffering", &self.buffering)
            .field("handlers", &state.handlers.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn recorder<T: Clone + 'static>() -> (Rc<RefCell<Vec<T>>>, impl Fn(T) + 'static) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        (seen, move |item| sink.borrow_mut().push(item))
    }

    #[test]
    fn live_emit_reaches_handlers_in_registration_order() {
        let channel = EventChannel::new(true);
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in ["a", "b"] {
            let order = Rc::clone(&order);
            channel.attach(move |value: u32| order.borrow_mut().push((tag, value)));
        }
        channel.emit(7);
        assert_eq!(*order.borrow(), vec![("a", 7), ("b", 7)]);
        assert_eq!(channel.pending_len(), 0);
    }

    #[test]
    fn buffered_items_replay_once_before_live_items() {
        let channel = EventChannel::new(true);
        let (first, handler) = recorder();
        let id = channel.attach(handler);
        channel.emit(1);
        channel.detach(id);
        channel.emit(2);
        channel.emit(3);

        let (second, handler) = recorder();
        channel.attach(handler);
        channel.emit(4);

        assert_eq!(*first.borrow(), vec![1]);
        assert_eq!(*second.borrow(), vec![2, 3, 4]);
        assert_eq!(channel.pending_len(), 0);
    }

    #[test]
    fn non_buffering_channel_drops_unobserved_items() {
        let channel = EventChannel::new(false);
        channel.emit(1);
        let (seen, handler) = recorder();
        channel.attach(handler);
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn head_placement_jumps_the_queue() {
        let channel = EventChannel::new(true);
        channel.emit(2);
        channel.emit(3);
        channel.emit_front(1);
        let (seen, handler) = recorder();
        channel.attach(handler);
        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn second_attach_does_not_replay() {
        let channel = EventChannel::new(true);
        let (first, handler) = recorder();
        channel.attach(handler);
        let (second, handler) = recorder();
        channel.attach(handler);
        channel.emit(9);
        assert_eq!(*first.borrow(), vec![9]);
        assert_eq!(*second.borrow(), vec![9]);
    }

    #[test]
    fn self_detach_during_replay_keeps_the_rest_pending() {
        let channel = Rc::new(EventChannel::new(true));
        channel.emit(1);
        channel.emit(2);
        channel.emit(3);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let id = channel.attach_with({
            let channel = Rc::clone(&channel);
            let seen = Rc::clone(&seen);
            move |id| {
                move |item: u32| {
                    seen.borrow_mut().push(item);
                    channel.detach(id);
                }
            }
        });

        assert_eq!(*seen.borrow(), vec![1]);
        assert_eq!(channel.handler_count(), 0);
        assert_eq!(channel.pending_len(), 2);

        channel.detach(id);
        let (rest, handler) = recorder();
        channel.attach(handler);
        assert_eq!(*rest.borrow(), vec![2, 3]);
    }

    #[test]
    fn handoff_during_replay_passes_the_rest_of_the_queue() {
        let channel = Rc::new(EventChannel::new(true));
        channel.emit(1);
        channel.emit(2);

        let (second, second_handler) = recorder();
        let second_handler = RefCell::new(Some(second_handler));
        let first = Rc::new(RefCell::new(Vec::new()));
        channel.attach_with({
            let channel = Rc::clone(&channel);
            let first = Rc::clone(&first);
            move |id| {
                move |item: u32| {
                    first.borrow_mut().push(item);
                    channel.detach(id);
                    let next = second_handler.borrow_mut().take();
                    if let Some(next) = next {
                        channel.attach(next);
                    }
                }
            }
        });
        channel.emit(3);

        assert_eq!(*first.borrow(), vec![1]);
        assert_eq!(*second.borrow(), vec![2, 3]);
        assert_eq!(channel.pending_len(), 0);
        assert_eq!(channel.handler_count(), 1);
    }

    #[test]
    fn nested_attach_without_detach_drains_the_queue_first() {
        let channel = Rc::new(EventChannel::new(true));
        channel.emit(1);
        channel.emit(2);
        channel.emit(3);

        let (inner, inner_handler) = recorder();
        let inner_handler = RefCell::new(Some(inner_handler));
        let outer = Rc::new(RefCell::new(Vec::new()));
        channel.attach({
            let channel = Rc::clone(&channel);
            let outer = Rc::clone(&outer);
            move |item: u32| {
                outer.borrow_mut().push(item);
                let next = inner_handler.borrow_mut().take();
                if let Some(next) = next {
                    channel.attach(next);
                }
            }
        });

        assert_eq!(*outer.borrow(), vec![1]);
        assert_eq!(*inner.borrow(), vec![2, 3]);
        assert_eq!(channel.handler_count(), 2);

        channel.emit(4);
        assert_eq!(*outer.borrow(), vec![1, 4]);
        assert_eq!(*inner.borrow(), vec![2, 3, 4]);
    }

    #[test]
    fn unread_from_replaying_handler_is_seen_next() {
        let channel = Rc::new(EventChannel::new(true));
        channel.emit(10);
        channel.emit(20);

        let seen = Rc::new(RefCell::new(Vec::new()));
        channel.attach({
            let channel = Rc::clone(&channel);
            let seen = Rc::clone(&seen);
            move |item: u32| {
                seen.borrow_mut().push(item);
                if item == 10 {
                    channel.emit_front(15);
                }
            }
        });

        assert_eq!(*seen.borrow(), vec![10, 15, 20]);
        assert_eq!(channel.handler_count(), 1);
    }
}
