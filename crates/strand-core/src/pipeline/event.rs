use alloc::sync::Arc;
use core::{any::Any, fmt};

/// 流水线内广播的用户事件。
///
/// # 设计背景（Why）
/// - 框架内部的带外信号（如输出侧半关）与业务自定义事件共用一条广播通道，
///   避免为每类信号单独扩充 Handler 契约。
///
/// # 契约说明（What）
/// - `OutputShutdown`：输出侧已半关，后续写入将失败，读方向不受影响。
/// - `Custom`：业务自定义事件，以 `Any` 承载并在消费端下转型。
pub enum UserEvent {
    /// 输出侧已半关。
    OutputShutdown,
    /// 业务自定义事件。
    Custom(Arc<dyn Any + Send + Sync>),
}

impl UserEvent {
    /// 包装业务自定义事件。
    pub fn custom<T: Any + Send + Sync>(value: T) -> Self {
        Self::Custom(Arc::new(value))
    }

    /// 尝试将自定义事件下转型为具体类型。
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<&T> {
        match self {
            Self::Custom(value) => value.downcast_ref::<T>(),
            Self::OutputShutdown => None,
        }
    }
}

impl Clone for UserEvent {
    fn clone(&self) -> Self {
        match self {
            Self::OutputShutdown => Self::OutputShutdown,
            Self::Custom(value) => Self::Custom(Arc::clone(value)),
        }
    }
}

impl fmt::Debug for UserEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutputShutdown => f.write_str("OutputShutdown"),
            Self::Custom(_) => f.debug_tuple("Custom").field(&"<erased>").finish(),
        }
    }
}
