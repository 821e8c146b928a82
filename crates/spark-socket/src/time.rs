//! 计时能力契约：重连延迟、定长读取超时与回环传输的模拟时延都经由 [`TimeDriver`] 调度。
//!
//! # 教案级注释
//!
//! ## 契约（What）
//! - `schedule(delay, task)` 在 `delay` 之后于同一线程执行 `task`，返回 [`TimerHandle`]；
//! - [`TimerHandle::cancel`] 幂等，调用后任务保证不会执行；
//! - 任务执行前驱动器会通过 [`TimerHandle::fire`] 领取执行权，已取消或已执行的句柄不会再次运行。
//!
//! ## 实现（How）
//! - [`ManualTimeDriver`]：确定性虚拟时钟，测试通过 `advance` 推进；
//! - Tokio 实现位于 `spark-socket-tcp`，基于 `spawn_local` + `sleep`。

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

/// 延迟任务。
pub type TimerTask = Box<dyn FnOnce()>;

/// 单线程计时驱动器。
pub trait TimeDriver {
    /// 在 `delay` 之后执行 `task`。
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

#[derive(Default)]
struct TimerState {
    cancelled: Cell<bool>,
    fired: Cell<bool>,
    on_cancel: RefCell<Option<Box<dyn FnOnce()>>>,
}

/// 已调度任务的句柄。
#[derive(Clone, Default)]
pub struct TimerHandle {
    state: Rc<TimerState>,
}

impl TimerHandle {
    /// 创建一个尚未执行、未取消的句柄。
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册取消回调（例如中止底层运行时任务）；已取消时立即执行。
    pub fn on_cancel(&self, hook: impl FnOnce() + 'static) {
        if self.state.cancelled.get() {
            hook();
            return;
        }
        *self.state.on_cancel.borrow_mut() = Some(Box::new(hook));
    }

    /// 取消任务。幂等；任务已执行时无效果。
    pub fn cancel(&self) {
        if self.state.fired.get() || self.state.cancelled.replace(true) {
            return;
        }
        let hook = self.state.on_cancel.borrow_mut().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// 由驱动器在执行任务前调用；返回 `true` 表示任务应当执行。
    pub fn fire(&self) -> bool {
        if self.state.cancelled.get() || self.state.fired.get() {
            return false;
        }
        self.state.fired.set(true);
        self.state.on_cancel.borrow_mut().take();
        true
    }

    /// 是否已取消。
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.get()
    }

    /// 是否仍在等待执行。
    pub fn is_pending(&self) -> bool {
        !self.state.cancelled.get() && !self.state.fired.get()
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancelled", &self.state.cancelled.get())
            .field("fired", &self.state.fired.get())
            .finish()
    }
}

struct ScheduledTask {
    handle: TimerHandle,
    task: TimerTask,
}

#[derive(Default)]
struct ManualState {
    now: Duration,
    seq: u64,
    queue: BTreeMap<(Duration, u64), ScheduledTask>,
}

/// 确定性虚拟时钟。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - 时间只在 [`advance`](Self::advance) 时前进，起点为 0；
/// - 到期任务按截止时间执行，截止时间相同者按调度顺序执行；
/// - 推进期间新调度且在目标时间内到期的任务同样会被执行；
/// - `advance(Duration::ZERO)` 执行所有“当前时刻已到期”的任务。
///
/// ## 注意事项（Trade-offs）
/// - 克隆共享同一时间线；
/// - 已取消任务在到期前仍占用队列条目，执行时被跳过。
#[derive(Clone, Default)]
pub struct ManualTimeDriver {
    state: Rc<RefCell<ManualState>>,
}

impl ManualTimeDriver {
    /// 创建时间为 0 的时钟。
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前虚拟时间。
    pub fn now(&self) -> Duration {
        self.state.borrow().now
    }

    /// 推进时钟并执行期间到期的任务，返回执行的任务数。
    pub fn advance(&self, delta: Duration) -> usize {
        let target = self.state.borrow().now.saturating_add(delta);
        let mut ran = 0;
        loop {
            let next = {
                let mut state = self.state.borrow_mut();
                let due = state
                    .queue
                    .first_key_value()
                    .is_some_and(|((deadline, _), _)| *deadline <= target);
                if !due {
                    break;
                }
                state.queue.pop_first().map(|((deadline, _), scheduled)| {
                    state.now = deadline;
                    scheduled
                })
            };
            let Some(scheduled) = next else {
                break;
            };
            if scheduled.handle.fire() {
                (scheduled.task)();
                ran += 1;
            }
        }
        self.state.borrow_mut().now = target;
        ran
    }

    /// 仍在等待执行（未取消）的任务数。
    pub fn pending(&self) -> usize {
        self.state
            .borrow()
            .queue
            .values()
            .filter(|scheduled| scheduled.handle.is_pending())
            .count()
    }
}

impl TimeDriver for ManualTimeDriver {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let handle = TimerHandle::new();
        let mut state = self.state.borrow_mut();
        let deadline = state.now.saturating_add(delay);
        let seq = state.seq;
        state.seq += 1;
        state.queue.insert(
            (deadline, seq),
            ScheduledTask {
                handle: handle.clone(),
                task,
            },
        );
        handle
    }
}

impl fmt::Debug for ManualTimeDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("ManualTimeDriver")
            .field("now", &state.now)
            .field("queued", &state.queue.len())
            .finish()
    }
}
