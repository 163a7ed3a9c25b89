use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// 进程内单调递增的通道标识分配器。
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// 通道唯一标识。
///
/// # 契约说明（What）
/// - 进程生命周期内唯一且不可变，用于日志关联与注册表索引。
/// - `Display` 输出固定宽度十六进制，便于日志对齐与检索。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(u64);

impl ChannelId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// 暴露原始数值，供调试工具或索引结构使用。
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}
