use alloc::{boxed::Box, sync::Arc};
use core::{any::Any, fmt};

use super::shared::SharedBuf;

/// 业务消息的默认估算尺寸：长度未知时按固定开销计入背压账目。
const UNKNOWN_USER_SIZE: usize = 8;

/// `PipelineMessage` 统一承载网络层字节与业务层对象。
///
/// # 设计背景（Why）
/// - 借鉴 Netty `ChannelPipeline`、Akka Stream `ByteString`、NATS `Message` 的复合消息模式，
///   确保在一个通道内安全穿梭不同层级的数据。
/// - 流水线与出站缓冲需要在编解码、背压、取消之间传递异构数据，因此通过 trait 对象屏蔽具体类型。
///
/// # 逻辑解析（How）
/// - `Buffer` 变体封装 [`SharedBuf`]，承载 L4/L5 字节流，适配零拷贝与池化策略。
/// - `User` 变体封装任意 `Send + Sync` 对象，对应 L7 业务语义；通过 `Any` 支持运行时下转型。
///
/// # 所有权纪律（Ownership）
/// - 消息是移动语义的线性资源：任何持有方要么原样向下游转移，要么调用 [`release`](Self::release)
///   （等价于析构）归还引用，二者必居其一且恰好一次。
/// - 真正的扇出点使用 [`retain`](Self::retain) 复制句柄，底层引用计数相应加一。
///
/// # 设计考量（Trade-offs & Gotchas）
/// - **对象擦除**：采用 `Any` 和 trait 对象实现，对比泛型消息牺牲了一定编译期优化，
///   但能支持动态协议装配。
/// - **调试输出**：`Debug` 实现刻意隐藏内部细节，避免在日志中泄漏敏感数据。
pub enum PipelineMessage {
    /// L4/L5 字节缓冲。
    Buffer(Box<dyn SharedBuf>),
    /// L7 业务消息。
    User(Arc<dyn Any + Send + Sync>),
}

impl PipelineMessage {
    /// 以引用计数缓冲构造消息。
    pub fn from_buffer(buf: Box<dyn SharedBuf>) -> Self {
        Self::Buffer(buf)
    }

    /// 以业务对象构造消息。
    pub fn from_user<T: Any + Send + Sync>(value: T) -> Self {
        Self::User(Arc::new(value))
    }

    /// 返回当前可读字节数；业务消息返回 0。
    pub fn readable_bytes(&self) -> usize {
        match self {
            Self::Buffer(buf) => buf.readable_bytes(),
            Self::User(_) => 0,
        }
    }

    /// 估算消息占用的待发送字节，用于背压记账。
    ///
    /// 字节缓冲取真实可读长度；业务消息长度未知，按固定常数计入，
    /// 确保大量小消息同样能推动水位线。
    pub fn size_estimate(&self) -> usize {
        match self {
            Self::Buffer(buf) => buf.readable_bytes(),
            Self::User(_) => UNKNOWN_USER_SIZE,
        }
    }

    /// 访问底层字节缓冲。
    pub fn as_buffer(&self) -> Option<&dyn SharedBuf> {
        match self {
            Self::Buffer(buf) => Some(buf.as_ref()),
            Self::User(_) => None,
        }
    }

    /// 以可变方式访问底层字节缓冲，供按块写出的传输推进读指针。
    pub fn as_buffer_mut(&mut self) -> Option<&mut (dyn SharedBuf + 'static)> {
        match self {
            Self::Buffer(buf) => Some(buf.as_mut()),
            Self::User(_) => None,
        }
    }

    /// 尝试将业务消息下转型为具体类型。
    pub fn downcast_user<T: Any + Send + Sync>(&self) -> Option<&T> {
        match self {
            Self::User(value) => value.downcast_ref::<T>(),
            Self::Buffer(_) => None,
        }
    }

    /// 在扇出点复制消息：字节缓冲增加一次引用，业务消息克隆共享指针。
    pub fn retain(&self) -> Self {
        match self {
            Self::Buffer(buf) => Self::Buffer(buf.clone_retained()),
            Self::User(value) => Self::User(Arc::clone(value)),
        }
    }

    /// 显式归还消息。
    ///
    /// 等价于析构；以具名方法标注“此处是所有权的退出路径”，
    /// 使取消、失败分支的资源流向在代码中可见。
    pub fn release(self) {
        drop(self);
    }
}

impl fmt::Debug for PipelineMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer(buf) => f
                .debug_tuple("Buffer")
                .field(&buf.readable_bytes())
                .finish(),
            Self::User(_) => f.debug_tuple("User").field(&"<erased-user>").finish(),
        }
    }
}
