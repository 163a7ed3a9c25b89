//! Handler 回调能力掩码与按类型缓存。
//!
//! # 设计背景（Why）
//! - 大量 Handler 只关心少数回调，其余回调是纯转发；若每个事件都逐节点虚调用一次
//!   “默认转发”，热路径将为无意义的跳板付出可观成本。
//! - 以能力掩码标注“该 Handler 类型真正处理哪些回调”，调度器据此在遍历时整段跳过
//!   纯转发节点；掩码按具体类型恰好计算一次，进程级缓存按 `TypeId` 命中。
//!
//! # 逻辑解析（How）
//! - 入站 9 个回调、出站 8 个操作各占一位；[`ExecMask`] 提供并、差与包含测试。
//! - 缓存使用 `spin::RwLock<BTreeMap<TypeId, u32>>`：读多写一，且在 `no_std + alloc`
//!   环境同样可用，无需隐藏的线程本地单例。
//!
//! # 契约说明（What）
//! - Handler 类型通过 `inbound_mask` / `outbound_mask` 声明能力，默认“全部处理”，
//!   即不跳过任何回调——声明是纯粹的优化提示，漏声明只损失性能，不改变语义。
//! - 掩码一经缓存即视为该类型的不变属性；按实例动态变化的声明不受支持。

use core::any::TypeId;

use alloc::collections::BTreeMap;
use spin::RwLock;

/// 回调能力掩码。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecMask(u32);

impl ExecMask {
    /// 空掩码。
    pub const NONE: Self = Self(0);

    /// 通道完成注册。
    pub const CHANNEL_REGISTERED: Self = Self(1 << 0);
    /// 通道解除注册。
    pub const CHANNEL_UNREGISTERED: Self = Self(1 << 1);
    /// 通道变为活跃。
    pub const CHANNEL_ACTIVE: Self = Self(1 << 2);
    /// 通道变为非活跃。
    pub const CHANNEL_INACTIVE: Self = Self(1 << 3);
    /// 收到一条读消息。
    pub const CHANNEL_READ: Self = Self(1 << 4);
    /// 本轮读取结束。
    pub const CHANNEL_READ_COMPLETE: Self = Self(1 << 5);
    /// 可写性发生变化。
    pub const WRITABILITY_CHANGED: Self = Self(1 << 6);
    /// 用户自定义事件。
    pub const USER_EVENT: Self = Self(1 << 7);
    /// 异常捕获。
    pub const EXCEPTION_CAUGHT: Self = Self(1 << 8);

    /// 绑定本地地址。
    pub const BIND: Self = Self(1 << 9);
    /// 连接对端。
    pub const CONNECT: Self = Self(1 << 10);
    /// 断开连接。
    pub const DISCONNECT: Self = Self(1 << 11);
    /// 关闭通道。
    pub const CLOSE: Self = Self(1 << 12);
    /// 解除注册。
    pub const DEREGISTER: Self = Self(1 << 13);
    /// 声明读意向。
    pub const READ: Self = Self(1 << 14);
    /// 写入消息。
    pub const WRITE: Self = Self(1 << 15);
    /// 冲刷缓冲。
    pub const FLUSH: Self = Self(1 << 16);

    /// 全部入站回调。
    pub const ALL_INBOUND: Self = Self(0x1FF);
    /// 全部出站操作。
    pub const ALL_OUTBOUND: Self = Self(0xFF << 9);

    /// 是否完整包含 `other` 的所有位。
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// 位并。
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// 位差：声明“不处理某回调”时使用。
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

/// 进程级掩码缓存，按 Handler 具体类型命中。
static MASK_CACHE: RwLock<BTreeMap<TypeId, u32>> = RwLock::new(BTreeMap::new());

/// 返回 `key` 对应类型的掩码；未缓存时调用 `compute` 并写入缓存。
pub(crate) fn cached_mask(key: TypeId, compute: impl FnOnce() -> ExecMask) -> ExecMask {
    if let Some(mask) = MASK_CACHE.read().get(&key) {
        return ExecMask(*mask);
    }
    let mask = compute();
    MASK_CACHE.write().insert(key, mask.0);
    mask
}
