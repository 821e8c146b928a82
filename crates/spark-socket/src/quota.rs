//! 连接配额计数。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 多个 [`SocketFactory`](crate::SocketFactory) 可以共享同一个 [`QuotaStats`]，实现跨实例的
//!   全局/单地址连接上限；
//! - 计数的增减必须严格配对：每次准入得到一个 [`QuotaLease`]，租约在释放或 `Drop` 时归还，且只归还一次。
//!
//! ## 契约（What）
//! - 桶名为地址字符串，`"*"`（[`GLOBAL_BUCKET`]）为全局桶；
//! - 计数归零的桶会被移除，[`QuotaStats::snapshot`] 只包含活跃桶；
//! - 单线程协作式模型下增减之间不存在抢占，无需原子操作或锁。

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// 全局桶名。
pub const GLOBAL_BUCKET: &str = "*";

/// 连接上限；`None` 或 `0` 表示不限制。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    /// 全局连接上限（`"*"` 桶）。
    pub max_connections: Option<u32>,
    /// 单地址连接上限。
    pub max_connections_per_ip: Option<u32>,
}

impl QuotaLimits {
    /// 不设上限。
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// 覆盖全局上限。
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// 覆盖单地址上限。
    pub fn with_max_connections_per_ip(mut self, max: u32) -> Self {
        self.max_connections_per_ip = Some(max);
        self
    }
}

fn effective(limit: Option<u32>) -> Option<u32> {
    limit.filter(|max| *max > 0)
}

/// 可共享的连接计数表。克隆得到指向同一计数表的句柄。
#[derive(Clone, Default)]
pub struct QuotaStats {
    counters: Rc<RefCell<HashMap<String, u32>>>,
}

impl QuotaStats {
    /// 创建空计数表。
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定桶的当前计数。
    pub fn count(&self, bucket: &str) -> u32 {
        self.counters.borrow().get(bucket).copied().unwrap_or(0)
    }

    /// 全局桶的当前计数。
    pub fn global(&self) -> u32 {
        self.count(GLOBAL_BUCKET)
    }

    /// 所有活跃桶的有序快照。
    pub fn snapshot(&self) -> BTreeMap<String, u32> {
        self.counters
            .borrow()
            .iter()
            .map(|(bucket, count)| (bucket.clone(), *count))
            .collect()
    }

    /// 两个句柄是否指向同一计数表。
    pub fn shares_with(&self, other: &QuotaStats) -> bool {
        Rc::ptr_eq(&self.counters, &other.counters)
    }

    /// 再接纳一个来自 `address` 的连接是否会突破上限。
    ///
    /// 地址缺失（非 IP 传输）时只检查全局上限。
    pub fn would_overflow(&self, address: Option<&str>, limits: &QuotaLimits) -> bool {
        if let Some(max) = effective(limits.max_connections)
            && self.global() >= max
        {
            return true;
        }
        if let (Some(max), Some(address)) = (effective(limits.max_connections_per_ip), address)
            && self.count(address) >= max
        {
            return true;
        }
        false
    }

    /// 计入一个连接：地址桶（若有）与全局桶各加一，返回归还用的租约。
    pub fn admit(&self, address: Option<&str>) -> QuotaLease {
        {
            let mut counters = self.counters.borrow_mut();
            if let Some(address) = address {
                *counters.entry(address.to_owned()).or_insert(0) += 1;
            }
            *counters.entry(GLOBAL_BUCKET.to_owned()).or_insert(0) += 1;
        }
        QuotaLease {
            stats: self.clone(),
            address: address.map(str::to_owned),
            released: false,
        }
    }

    fn release(&self, address: Option<&str>) {
        let mut counters = self.counters.borrow_mut();
        if let Some(address) = address {
            decrement(&mut counters, address);
        }
        decrement(&mut counters, GLOBAL_BUCKET);
    }
}

fn decrement(counters: &mut HashMap<String, u32>, bucket: &str) {
    if let Some(count) = counters.get_mut(bucket) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            counters.remove(bucket);
        }
    }
}

impl fmt::Debug for QuotaStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.snapshot()).finish()
    }
}

/// 一次准入占用的配额，`release` 或 `Drop` 时归还。
#[must_use = "dropping the lease releases the quota immediately"]
pub struct QuotaLease {
    stats: QuotaStats,
    address: Option<String>,
    released: bool,
}

impl QuotaLease {
    /// 归还配额。
    pub fn release(mut self) {
        self.release_once();
    }

    /// 占用的地址桶。
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.stats.release(self.address.as_deref());
        }
    }
}

impl Drop for QuotaLease {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl fmt::Debug for QuotaLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaLease")
            .field("address", &self.address)
            .field("released", &self.released)
            .finish()
    }
}
