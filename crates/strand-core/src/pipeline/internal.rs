//! 流水线首尾哨兵节点。
//!
//! # 设计背景（Why）
//! - 链路两端各固定一个哨兵：头节点是出站操作的终点（落入通道内部操作）与入站事件的
//!   起点；尾节点是入站事件的终点，负责兜底未被消费的消息与未被处理的异常。
//! - 哨兵本身就是普通 Handler，复用统一的调度与掩码机制，不做特殊分支。
//!
//! # 契约说明（What）
//! - 头节点在“通道活跃”“读取完成”后按配置自动补读（auto-read）；
//!   在已关闭通道解除注册后触发链路拆除，保证 Handler 的移除回调最终执行。
//! - 尾节点吞掉抵达链路末端的入站事件：消息释放并告警一次；
//!   未处理异常记录错误日志后防御性关闭通道。

use alloc::sync::Arc;

use super::{
    context::HandlerContext,
    event::UserEvent,
    handler::{ChannelHandler, InboundHandler, OutboundHandler},
};
use crate::{
    buffer::PipelineMessage,
    error::StrandError,
    promise::ChannelPromise,
    transport::TransportSocketAddr,
};

/// 头节点：出站操作的汇聚点。
pub(crate) struct HeadHandler;

impl HeadHandler {
    /// 配置允许时，在事件推进后自动声明下一轮读意向。
    fn read_if_auto_read(ctx: &Arc<HandlerContext>) {
        if let Some(channel) = ctx.try_channel()
            && channel.options().auto_read()
        {
            channel.read();
        }
    }
}

impl ChannelHandler for HeadHandler {}

impl InboundHandler for HeadHandler {
    fn channel_active(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        ctx.fire_channel_active();
        Self::read_if_auto_read(ctx);
        Ok(())
    }

    fn channel_read_complete(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        ctx.fire_channel_read_complete();
        Self::read_if_auto_read(ctx);
        Ok(())
    }

    fn channel_unregistered(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        ctx.fire_channel_unregistered();
        // 终态通道完成最后一次解除注册后拆除链路，驱动所有移除回调。
        if let Some(channel) = ctx.try_channel()
            && !channel.is_open()
        {
            ctx.pipeline().destroy();
        }
        Ok(())
    }
}

impl OutboundHandler for HeadHandler {
    fn bind(
        &self,
        ctx: &Arc<HandlerContext>,
        addr: TransportSocketAddr,
        promise: ChannelPromise,
    ) -> Result<(), StrandError> {
        match ctx.try_channel() {
            Some(channel) => channel.internal_bind(&addr, promise),
            None => {
                promise.try_failure(StrandError::closed());
            }
        }
        Ok(())
    }

    fn connect(
        &self,
        ctx: &Arc<HandlerContext>,
        remote: TransportSocketAddr,
        local: Option<TransportSocketAddr>,
        promise: ChannelPromise,
    ) -> Result<(), StrandError> {
        match ctx.try_channel() {
            Some(channel) => channel.internal_connect(&remote, local.as_ref(), promise),
            None => {
                promise.try_failure(StrandError::closed());
            }
        }
        Ok(())
    }

    fn disconnect(
        &self,
        ctx: &Arc<HandlerContext>,
        promise: ChannelPromise,
    ) -> Result<(), StrandError> {
        match ctx.try_channel() {
            Some(channel) => channel.internal_disconnect(promise),
            None => {
                promise.try_failure(StrandError::closed());
            }
        }
        Ok(())
    }

    fn close(
        &self,
        ctx: &Arc<HandlerContext>,
        promise: ChannelPromise,
    ) -> Result<(), StrandError> {
        match ctx.try_channel() {
            Some(channel) => channel.internal_close_with(promise, None),
            None => {
                promise.try_failure(StrandError::closed());
            }
        }
        Ok(())
    }

    fn deregister(
        &self,
        ctx: &Arc<HandlerContext>,
        promise: ChannelPromise,
    ) -> Result<(), StrandError> {
        match ctx.try_channel() {
            Some(channel) => channel.internal_deregister(promise, false),
            None => {
                promise.try_failure(StrandError::closed());
            }
        }
        Ok(())
    }

    fn read(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        if let Some(channel) = ctx.try_channel() {
            channel.internal_begin_read();
        }
        Ok(())
    }

    fn write(
        &self,
        ctx: &Arc<HandlerContext>,
        msg: PipelineMessage,
        promise: ChannelPromise,
    ) -> Result<(), StrandError> {
        match ctx.try_channel() {
            Some(channel) => channel.internal_write(msg, promise),
            None => {
                msg.release();
                promise.try_failure(StrandError::closed());
            }
        }
        Ok(())
    }

    fn flush(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        if let Some(channel) = ctx.try_channel() {
            channel.internal_flush();
        }
        Ok(())
    }
}

/// 尾节点：入站事件的兜底消费者。
pub(crate) struct TailHandler;

impl ChannelHandler for TailHandler {}

impl InboundHandler for TailHandler {
    fn channel_registered(&self, _ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        Ok(())
    }

    fn channel_unregistered(&self, _ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        Ok(())
    }

    fn channel_active(&self, _ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        Ok(())
    }

    fn channel_inactive(&self, _ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        Ok(())
    }

    fn channel_read(
        &self,
        ctx: &Arc<HandlerContext>,
        msg: PipelineMessage,
    ) -> Result<(), StrandError> {
        if let Some(channel) = ctx.try_channel() {
            channel
                .logger()
                .warn("discarded inbound message that reached the tail of the pipeline");
        }
        msg.release();
        Ok(())
    }

    fn channel_read_complete(&self, _ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        Ok(())
    }

    fn writability_changed(&self, _ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        Ok(())
    }

    fn user_event(
        &self,
        _ctx: &Arc<HandlerContext>,
        _event: UserEvent,
    ) -> Result<(), StrandError> {
        Ok(())
    }

    fn exception_caught(
        &self,
        ctx: &Arc<HandlerContext>,
        cause: Arc<StrandError>,
    ) -> Result<(), StrandError> {
        if let Some(channel) = ctx.try_channel() {
            channel.logger().error(
                "unhandled exception reached the tail of the pipeline; closing channel",
                Some(cause.as_ref()),
            );
            let _ = channel.close();
        }
        Ok(())
    }
}
