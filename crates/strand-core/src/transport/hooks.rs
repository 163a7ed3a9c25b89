use alloc::sync::Arc;

use super::addr::TransportSocketAddr;
use crate::{
    error::{StrandError, codes},
    executor::EventExecutor,
    outbound::OutboundBuffer,
    sealed::Sealed,
};

/// `Transport` 定义具体通道子类型必须落地的传输钩子。
///
/// # 设计背景（Why）
/// - 综合 Netty `AbstractChannel` 钩子族与 mio 轮询适配层的经验，
///   将“核心驱动生命周期、传输只做系统调用”的分工固化为契约。
/// - 钩子以 `&self` 暴露、实现自理内部可变性：核心保证所有生命周期钩子都在通道的
///   所属执行器线程上调用（或注册前的装配线程），实现内部用普通单元格即可，
///   无需跨线程互斥；状态查询（`is_open` 等）则可能来自任意线程，须保持原子语义。
///
/// # 契约说明（What）
/// - `do_register` / `do_deregister`：与事件轮询设施建立/解除关联；
///   解除注册默认是空操作，轮询型传输按需覆写。
/// - `do_bind` / `do_connect` / `do_disconnect`：地址生命周期；无连接语义的传输
///   保留 `do_connect` 默认的 [`codes::TRANSPORT_UNSUPPORTED`] 失败。
/// - `do_close`：释放底层资源，进入终态；幂等性由核心的关闭闸门保证。
/// - `do_shutdown_output`：半关输出侧，默认退化为 `do_close`。
/// - `do_begin_read`：向轮询设施声明读意向。
/// - `do_write`：从出站缓冲批量取走已冲刷条目并写出；写出进度通过
///   [`OutboundBuffer::remove`]、[`OutboundBuffer::remove_bytes`] 回馈给缓冲，
///   每轮写出的消息数量应尊重通道配置的上限。
/// - `is_open` / `is_active`：分别指示资源是否仍然持有、连接是否可读写。
/// - `is_compatible`：注册前的执行器类型检查，例如轮询型传输要求带 I/O 能力的执行器。
/// - `prepare_to_close`：需要阻塞式关闭的传输（如配置了 linger 的套接字）返回专用执行器，
///   核心会把真正的 `do_close` 调度过去，避免阻塞事件线程。
///
/// # 错误语义
/// - 钩子返回的错误由核心捕获并转入相应 Promise 或异常捕获事件，绝不向调用栈外抛；
///   IO 类故障请使用 [`StrandError::io`] 标记，以驱动自动关闭策略。
pub trait Transport: Send + Sync + 'static + Sealed {
    /// 与事件轮询设施建立关联。
    fn do_register(&self) -> Result<(), StrandError>;

    /// 绑定本地地址。
    fn do_bind(&self, addr: &TransportSocketAddr) -> Result<(), StrandError>;

    /// 建立到对端的连接；无连接传输保留默认失败。
    fn do_connect(
        &self,
        _remote: &TransportSocketAddr,
        _local: Option<&TransportSocketAddr>,
    ) -> Result<(), StrandError> {
        Err(StrandError::new(
            codes::TRANSPORT_UNSUPPORTED,
            "transport does not support connect",
        ))
    }

    /// 断开与对端的连接，保持通道注册状态。
    fn do_disconnect(&self) -> Result<(), StrandError>;

    /// 关闭底层资源。
    fn do_close(&self) -> Result<(), StrandError>;

    /// 解除与事件轮询设施的关联，默认空操作。
    fn do_deregister(&self) -> Result<(), StrandError> {
        Ok(())
    }

    /// 声明读意向。
    fn do_begin_read(&self) -> Result<(), StrandError>;

    /// 写出已冲刷的出站条目。
    fn do_write(&self, buffer: &OutboundBuffer) -> Result<(), StrandError>;

    /// 半关输出侧，默认退化为完整关闭。
    fn do_shutdown_output(&self) -> Result<(), StrandError> {
        self.do_close()
    }

    /// 返回本地地址。
    fn local_addr(&self) -> Option<TransportSocketAddr>;

    /// 返回对端地址。
    fn remote_addr(&self) -> Option<TransportSocketAddr>;

    /// 底层资源是否仍然持有。
    fn is_open(&self) -> bool;

    /// 连接是否处于可读写状态。
    fn is_active(&self) -> bool;

    /// 注册前检查执行器类型是否与本传输兼容。
    fn is_compatible(&self, executor: &dyn EventExecutor) -> bool;

    /// 需要阻塞式关闭时返回专用执行器，默认无需。
    fn prepare_to_close(&self) -> Option<Arc<dyn EventExecutor>> {
        None
    }
}
