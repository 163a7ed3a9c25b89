use alloc::sync::Arc;
use core::any::TypeId;

use super::{context::HandlerContext, event::UserEvent, mask, mask::ExecMask};
use crate::{
    buffer::PipelineMessage, error::StrandError, promise::ChannelPromise, sealed::Sealed,
    transport::TransportSocketAddr,
};

/// Handler 公共生命周期契约。
///
/// # 契约说明（What）
/// - `handler_added`：节点装配完成后的首个回调；通道尚未注册时推迟到注册瞬间、
///   早于任何其他流水线事件执行。
/// - `handler_removed`：节点摘除后的最后一个回调；此后该 Handler 不会再被调用。
/// - 两个回调返回的错误都会被调度层捕获并转入异常捕获事件，不会向外抛出。
pub trait ChannelHandler: Send + Sync + 'static + Sealed {
    /// 节点装配完成。
    fn handler_added(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        let _ = ctx;
        Ok(())
    }

    /// 节点已摘除。
    fn handler_removed(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        let _ = ctx;
        Ok(())
    }
}

/// 入站事件处理契约，面向从传输层到业务层的正向数据流。
///
/// # 设计背景（Why）
/// - 汇总 Netty `ChannelInboundHandler`、Envoy Stream Filter、Tower `Service`
///   调用链的经验，确保 Handler 能以细粒度响应事件。
///
/// # 契约说明（What）
/// - 所有方法均在节点所属执行器线程上调用，必须无阻塞或将耗时操作移交执行器。
/// - 默认实现一律转发给下一个符合条件的节点；覆写即表示“在此拦截”。
/// - `channel_read` 获得消息所有权：要么转发（`ctx.fire_channel_read(msg)`），
///   要么释放（`msg.release()`），恰好其一。
/// - 返回 `Err` 会在调用现场被转入本节点的异常捕获路径，不会回抛给事件发起方。
///
/// # 风险提示（Trade-offs）
/// - 请避免在 Handler 内部长期持有 `Arc<HandlerContext>`；若确有需要，需确保不会导致引用循环。
pub trait InboundHandler: ChannelHandler {
    /// 声明本类型真正处理的入站回调集合，默认全部处理（不跳过）。
    fn inbound_mask(&self) -> ExecMask {
        ExecMask::ALL_INBOUND
    }

    /// 通道完成注册。
    fn channel_registered(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        ctx.fire_channel_registered();
        Ok(())
    }

    /// 通道解除注册。
    fn channel_unregistered(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        ctx.fire_channel_unregistered();
        Ok(())
    }

    /// 通道变为活跃。
    fn channel_active(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        ctx.fire_channel_active();
        Ok(())
    }

    /// 通道变为非活跃。
    fn channel_inactive(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        ctx.fire_channel_inactive();
        Ok(())
    }

    /// 处理读到的消息。
    fn channel_read(
        &self,
        ctx: &Arc<HandlerContext>,
        msg: PipelineMessage,
    ) -> Result<(), StrandError> {
        ctx.fire_channel_read(msg);
        Ok(())
    }

    /// 一批读取完成。
    fn channel_read_complete(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        ctx.fire_channel_read_complete();
        Ok(())
    }

    /// 可写性变化。
    fn writability_changed(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        ctx.fire_writability_changed();
        Ok(())
    }

    /// 用户事件。
    fn user_event(&self, ctx: &Arc<HandlerContext>, event: UserEvent) -> Result<(), StrandError> {
        ctx.fire_user_event(event);
        Ok(())
    }

    /// 异常处理。
    fn exception_caught(
        &self,
        ctx: &Arc<HandlerContext>,
        cause: Arc<StrandError>,
    ) -> Result<(), StrandError> {
        ctx.fire_exception_caught(cause);
        Ok(())
    }
}

/// 出站操作处理契约，负责从业务层到传输层的逆向数据流。
///
/// # 契约说明（What）
/// - 默认实现一律转发给上一个符合条件的节点，最终抵达头节点并落入通道内部操作。
/// - `write` 获得消息所有权；返回 `Err` 时由调度层以该错误失败 `promise`，
///   消息的释放责任在出错的实现侧。
/// - `read` / `flush` 无 Promise 随行，错误转入异常捕获事件。
pub trait OutboundHandler: ChannelHandler {
    /// 声明本类型真正处理的出站操作集合，默认全部处理（不跳过）。
    fn outbound_mask(&self) -> ExecMask {
        ExecMask::ALL_OUTBOUND
    }

    /// 绑定本地地址。
    fn bind(
        &self,
        ctx: &Arc<HandlerContext>,
        addr: TransportSocketAddr,
        promise: ChannelPromise,
    ) -> Result<(), StrandError> {
        ctx.bind(addr, promise);
        Ok(())
    }

    /// 连接对端。
    fn connect(
        &self,
        ctx: &Arc<HandlerContext>,
        remote: TransportSocketAddr,
        local: Option<TransportSocketAddr>,
        promise: ChannelPromise,
    ) -> Result<(), StrandError> {
        ctx.connect(remote, local, promise);
        Ok(())
    }

    /// 断开连接。
    fn disconnect(
        &self,
        ctx: &Arc<HandlerContext>,
        promise: ChannelPromise,
    ) -> Result<(), StrandError> {
        ctx.disconnect(promise);
        Ok(())
    }

    /// 关闭通道。
    fn close(
        &self,
        ctx: &Arc<HandlerContext>,
        promise: ChannelPromise,
    ) -> Result<(), StrandError> {
        ctx.close(promise);
        Ok(())
    }

    /// 解除注册。
    fn deregister(
        &self,
        ctx: &Arc<HandlerContext>,
        promise: ChannelPromise,
    ) -> Result<(), StrandError> {
        ctx.deregister(promise);
        Ok(())
    }

    /// 声明读意向。
    fn read(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        ctx.read();
        Ok(())
    }

    /// 写入消息。
    fn write(
        &self,
        ctx: &Arc<HandlerContext>,
        msg: PipelineMessage,
        promise: ChannelPromise,
    ) -> Result<(), StrandError> {
        ctx.write(msg, promise);
        Ok(())
    }

    /// 冲刷缓冲。
    fn flush(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        ctx.flush();
        Ok(())
    }
}

/// 节点装配描述：类型擦除后的 Handler 能力集合。
///
/// # 教案式说明
/// - **意图（Why）**：链路节点需要在不知道具体 Handler 类型的情况下派发事件，
///   同时保留“该类型处理哪些回调”的静态信息以支撑跳过优化。
/// - **逻辑（How）**：构造函数在泛型上下文中完成 `Arc` 的双向上转型与掩码缓存查询，
///   此后链路只与本结构交互。
/// - **契约（What）**：`inbound` / `outbound` 至少其一为 `Some`；`mask` 是两个方向
///   声明掩码的并集，且在节点生命周期内不变。
pub struct HandlerSpec {
    base: Arc<dyn ChannelHandler>,
    inbound: Option<Arc<dyn InboundHandler>>,
    outbound: Option<Arc<dyn OutboundHandler>>,
    mask: ExecMask,
}

impl HandlerSpec {
    pub(crate) fn base(&self) -> &Arc<dyn ChannelHandler> {
        &self.base
    }

    pub(crate) fn inbound(&self) -> Option<&Arc<dyn InboundHandler>> {
        self.inbound.as_ref()
    }

    pub(crate) fn outbound(&self) -> Option<&Arc<dyn OutboundHandler>> {
        self.outbound.as_ref()
    }

    pub(crate) fn mask(&self) -> ExecMask {
        self.mask
    }
}

/// 将入站 Handler 装配为节点描述。
pub fn inbound_handler<H: InboundHandler>(handler: H) -> HandlerSpec {
    let handler = Arc::new(handler);
    let mask = mask::cached_mask(TypeId::of::<H>(), || handler.inbound_mask());
    let inbound: Arc<dyn InboundHandler> = handler.clone();
    HandlerSpec {
        base: handler,
        inbound: Some(inbound),
        outbound: None,
        mask,
    }
}

/// 将出站 Handler 装配为节点描述。
pub fn outbound_handler<H: OutboundHandler>(handler: H) -> HandlerSpec {
    let handler = Arc::new(handler);
    let mask = mask::cached_mask(TypeId::of::<H>(), || handler.outbound_mask());
    let outbound: Arc<dyn OutboundHandler> = handler.clone();
    HandlerSpec {
        base: handler,
        inbound: None,
        outbound: Some(outbound),
        mask,
    }
}

/// 将全双工 Handler 装配为节点描述，两个方向共享同一实例。
pub fn duplex_handler<H: InboundHandler + OutboundHandler>(handler: H) -> HandlerSpec {
    let handler = Arc::new(handler);
    let mask = mask::cached_mask(TypeId::of::<H>(), || {
        handler.inbound_mask().union(handler.outbound_mask())
    });
    let inbound: Arc<dyn InboundHandler> = handler.clone();
    let outbound: Arc<dyn OutboundHandler> = handler.clone();
    HandlerSpec {
        base: handler,
        inbound: Some(inbound),
        outbound: Some(outbound),
        mask,
    }
}
