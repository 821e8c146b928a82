use std::time::Duration;

use spark_socket::{TimeDriver, TimerHandle, TimerTask};

/// 基于 Tokio 的计时驱动器。
///
/// # 教案式注释
///
/// ## 契约 (What)
/// - 每次 `schedule` 派生一个本地任务：`sleep(delay)` 后领取执行权并运行回调；
/// - 取消时中止该任务，回调保证不会执行；
/// - **前置条件**：必须在 Tokio `LocalSet` 内调用，回调与连接状态同处一个线程。
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioTimeDriver;

impl TokioTimeDriver {
    pub fn new() -> Self {
        Self
    }
}

impl TimeDriver for TokioTimeDriver {
    fn schedule(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let handle = TimerHandle::new();
        let fire = handle.clone();
        let join = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            if fire.fire() {
                task();
            }
        });
        handle.on_cancel(move || join.abort());
        handle
    }
}
