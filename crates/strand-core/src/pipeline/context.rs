//! 流水线节点与事件调度。
//!
//! # 模块定位（Why）
//! - [`HandlerContext`] 是链路中的一个拦截节点：持有 Handler 能力集合、生命周期状态、
//!   前后向链接与可选的执行器绑定，是入站/出站两个方向所有派发逻辑的载体。
//!
//! # 调度模型（How）
//! - **方向遍历**：入站事件沿 `next` 前行、出站操作沿 `prev` 回溯；遍历用能力掩码
//!   整段跳过纯转发节点。
//! - **执行器亲和**：解析出目标节点后，若当前线程即其执行器线程则同步内联调用，
//!   否则打包为任务提交——单次任务提交即一次跨执行器跳跃，FIFO 语义保证
//!   同一通道的事件在每个 Handler 眼中严格有序。
//! - **错误重定向**：入站回调返回的错误在调用现场转入本节点的异常捕获路径；
//!   出站操作的错误改为失败其随行 Promise。任何一条路径都不会把错误抛回事件发起方。
//!
//! # 生命周期（What）
//! - 节点状态机：`Init → AddPending → AddComplete → RemoveComplete`。
//! - 仅 `AddComplete` 的节点才会真正执行回调（绑定到无序执行器的节点放宽到
//!   `AddPending`，避免并发装配期间的死锁）；`RemoveComplete` 的节点退化为
//!   透明转发，飞行中的事件落到它身上时直接穿透到下一个合格节点。

use alloc::{
    borrow::Cow,
    boxed::Box,
    sync::{Arc, Weak},
};
use core::sync::atomic::{AtomicU8, Ordering};

use spin::RwLock;

use super::{
    Pipeline,
    event::UserEvent,
    handler::HandlerSpec,
    mask::ExecMask,
};
use crate::{
    buffer::PipelineMessage,
    channel::Channel,
    error::StrandError,
    executor::EventExecutor,
    outbound::ENTRY_OVERHEAD,
    promise::ChannelPromise,
};

const STATE_INIT: u8 = 0;
const STATE_ADD_PENDING: u8 = 1;
const STATE_ADD_COMPLETE: u8 = 2;
const STATE_REMOVE_COMPLETE: u8 = 3;

/// 链路节点：一个 Handler 及其调度元数据。
pub struct HandlerContext {
    name: Cow<'static, str>,
    spec: HandlerSpec,
    state: AtomicU8,
    executor_override: Option<Arc<dyn EventExecutor>>,
    channel: RwLock<Weak<Channel>>,
    pipeline: RwLock<Weak<Pipeline>>,
    prev: RwLock<Weak<HandlerContext>>,
    next: RwLock<Option<Arc<HandlerContext>>>,
}

impl HandlerContext {
    pub(crate) fn new(
        name: Cow<'static, str>,
        spec: HandlerSpec,
        executor_override: Option<Arc<dyn EventExecutor>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            spec,
            state: AtomicU8::new(STATE_INIT),
            executor_override,
            channel: RwLock::new(Weak::new()),
            pipeline: RwLock::new(Weak::new()),
            prev: RwLock::new(Weak::new()),
            next: RwLock::new(None),
        })
    }

    /// 节点在流水线内的唯一名称。
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 返回所属通道。
    ///
    /// # Panics
    /// 节点尚未装配进通道（或通道已被整体释放）时 panic；Handler 回调期间恒有效。
    pub fn channel(&self) -> Arc<Channel> {
        self.channel
            .read()
            .upgrade()
            .expect("handler context used outside of a live channel")
    }

    /// 返回所属流水线。
    pub fn pipeline(&self) -> Arc<Pipeline> {
        self.pipeline
            .read()
            .upgrade()
            .expect("handler context used outside of a live pipeline")
    }

    /// 返回节点生效的执行器：显式绑定优先，否则继承通道执行器。
    pub fn executor(&self) -> Option<Arc<dyn EventExecutor>> {
        self.executor_override
            .clone()
            .or_else(|| self.try_channel().and_then(|channel| channel.executor()))
    }

    /// 构造绑定本通道的常规 Promise。
    pub fn new_promise(&self) -> ChannelPromise {
        self.channel().new_promise()
    }

    /// 返回本通道的 void Promise。
    pub fn void_promise(&self) -> ChannelPromise {
        self.channel().void_promise()
    }

    /// 节点是否已摘除。
    pub fn is_removed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_REMOVE_COMPLETE
    }

    pub(crate) fn try_channel(&self) -> Option<Arc<Channel>> {
        self.channel.read().upgrade()
    }

    pub(crate) fn spec(&self) -> &HandlerSpec {
        &self.spec
    }

    pub(crate) fn attach(&self, channel: Weak<Channel>, pipeline: Weak<Pipeline>) {
        *self.channel.write() = channel;
        *self.pipeline.write() = pipeline;
    }

    // ---- 生命周期状态机 ----

    pub(crate) fn set_add_pending(&self) {
        let _ = self.state.compare_exchange(
            STATE_INIT,
            STATE_ADD_PENDING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// 迁移到 `AddComplete`；节点已是 `RemoveComplete` 时返回 `false`。
    pub(crate) fn set_add_complete(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                if state == STATE_REMOVE_COMPLETE {
                    None
                } else {
                    Some(STATE_ADD_COMPLETE)
                }
            })
            .is_ok()
    }

    pub(crate) fn set_remove_complete(&self) {
        self.state.store(STATE_REMOVE_COMPLETE, Ordering::Release);
    }

    /// 当前节点是否允许执行回调。
    ///
    /// 绑定到无序执行器的节点放宽到 `AddPending`：否则“装配任务”与“装配完成
    /// 才能跑的事件任务”可能在同一个无序池中互相等待。
    fn invoke_allowed(&self) -> bool {
        let state = self.state.load(Ordering::Acquire);
        state == STATE_ADD_COMPLETE
            || (state == STATE_ADD_PENDING && !self.executor_is_ordered())
    }

    fn executor_is_ordered(&self) -> bool {
        self.executor()
            .map(|executor| executor.is_ordered())
            .unwrap_or(true)
    }

    // ---- 链接与遍历 ----

    pub(crate) fn next_ctx(&self) -> Option<Arc<HandlerContext>> {
        self.next.read().clone()
    }

    pub(crate) fn prev_ctx(&self) -> Option<Arc<HandlerContext>> {
        self.prev.read().upgrade()
    }

    pub(crate) fn set_next(&self, next: Option<Arc<HandlerContext>>) {
        *self.next.write() = next;
    }

    pub(crate) fn set_prev(&self, prev: Weak<HandlerContext>) {
        *self.prev.write() = prev;
    }

    fn find_next_inbound(&self, flag: ExecMask) -> Option<Arc<HandlerContext>> {
        let mut cursor = self.next_ctx();
        while let Some(ctx) = cursor {
            if ctx.spec.inbound().is_some() && ctx.spec.mask().contains(flag) {
                return Some(ctx);
            }
            cursor = ctx.next_ctx();
        }
        None
    }

    fn find_prev_outbound(&self, flag: ExecMask) -> Option<Arc<HandlerContext>> {
        let mut cursor = self.prev_ctx();
        while let Some(ctx) = cursor {
            if ctx.spec.outbound().is_some() && ctx.spec.mask().contains(flag) {
                return Some(ctx);
            }
            cursor = ctx.prev_ctx();
        }
        None
    }

    /// 执行器亲和分发：同线程内联，跨线程打包提交。
    fn execute_or_inline(
        ctx: Arc<HandlerContext>,
        run: impl FnOnce(&Arc<HandlerContext>) + Send + 'static,
    ) {
        match ctx.executor() {
            Some(executor) if !executor.in_event_loop() => {
                executor.execute(Box::new(move || run(&ctx)));
            }
            _ => run(&ctx),
        }
    }

    // ---- 入站派发 ----

    pub(crate) fn invoke_channel_registered(ctx: Arc<HandlerContext>) {
        Self::execute_or_inline(ctx, |ctx| {
            if !ctx.invoke_allowed() {
                ctx.fire_channel_registered();
                return;
            }
            let Some(handler) = ctx.spec.inbound().cloned() else {
                ctx.fire_channel_registered();
                return;
            };
            if let Err(err) = handler.channel_registered(ctx) {
                Self::enter_exception_caught(ctx, Arc::new(err));
            }
        });
    }

    pub(crate) fn invoke_channel_unregistered(ctx: Arc<HandlerContext>) {
        Self::execute_or_inline(ctx, |ctx| {
            if !ctx.invoke_allowed() {
                ctx.fire_channel_unregistered();
                return;
            }
            let Some(handler) = ctx.spec.inbound().cloned() else {
                ctx.fire_channel_unregistered();
                return;
            };
            if let Err(err) = handler.channel_unregistered(ctx) {
                Self::enter_exception_caught(ctx, Arc::new(err));
            }
        });
    }

    pub(crate) fn invoke_channel_active(ctx: Arc<HandlerContext>) {
        Self::execute_or_inline(ctx, |ctx| {
            if !ctx.invoke_allowed() {
                ctx.fire_channel_active();
                return;
            }
            let Some(handler) = ctx.spec.inbound().cloned() else {
                ctx.fire_channel_active();
                return;
            };
            if let Err(err) = handler.channel_active(ctx) {
                Self::enter_exception_caught(ctx, Arc::new(err));
            }
        });
    }

    pub(crate) fn invoke_channel_inactive(ctx: Arc<HandlerContext>) {
        Self::execute_or_inline(ctx, |ctx| {
            if !ctx.invoke_allowed() {
                ctx.fire_channel_inactive();
                return;
            }
            let Some(handler) = ctx.spec.inbound().cloned() else {
                ctx.fire_channel_inactive();
                return;
            };
            if let Err(err) = handler.channel_inactive(ctx) {
                Self::enter_exception_caught(ctx, Arc::new(err));
            }
        });
    }

    pub(crate) fn invoke_channel_read(ctx: Arc<HandlerContext>, msg: PipelineMessage) {
        Self::execute_or_inline(ctx, move |ctx| {
            if !ctx.invoke_allowed() {
                ctx.fire_channel_read(msg);
                return;
            }
            let Some(handler) = ctx.spec.inbound().cloned() else {
                ctx.fire_channel_read(msg);
                return;
            };
            if let Err(err) = handler.channel_read(ctx, msg) {
                Self::enter_exception_caught(ctx, Arc::new(err));
            }
        });
    }

    pub(crate) fn invoke_channel_read_complete(ctx: Arc<HandlerContext>) {
        Self::execute_or_inline(ctx, |ctx| {
            if !ctx.invoke_allowed() {
                ctx.fire_channel_read_complete();
                return;
            }
            let Some(handler) = ctx.spec.inbound().cloned() else {
                ctx.fire_channel_read_complete();
                return;
            };
            if let Err(err) = handler.channel_read_complete(ctx) {
                Self::enter_exception_caught(ctx, Arc::new(err));
            }
        });
    }

    pub(crate) fn invoke_writability_changed(ctx: Arc<HandlerContext>) {
        Self::execute_or_inline(ctx, |ctx| {
            if !ctx.invoke_allowed() {
                ctx.fire_writability_changed();
                return;
            }
            let Some(handler) = ctx.spec.inbound().cloned() else {
                ctx.fire_writability_changed();
                return;
            };
            if let Err(err) = handler.writability_changed(ctx) {
                Self::enter_exception_caught(ctx, Arc::new(err));
            }
        });
    }

    pub(crate) fn invoke_user_event(ctx: Arc<HandlerContext>, event: UserEvent) {
        Self::execute_or_inline(ctx, move |ctx| {
            if !ctx.invoke_allowed() {
                ctx.fire_user_event(event);
                return;
            }
            let Some(handler) = ctx.spec.inbound().cloned() else {
                ctx.fire_user_event(event);
                return;
            };
            if let Err(err) = handler.user_event(ctx, event) {
                Self::enter_exception_caught(ctx, Arc::new(err));
            }
        });
    }

    pub(crate) fn invoke_exception_caught(ctx: Arc<HandlerContext>, cause: Arc<StrandError>) {
        Self::execute_or_inline(ctx, move |ctx| Self::enter_exception_caught(ctx, cause));
    }

    /// 异常进入某个节点：可处理则交给其回调，否则继续向后寻找。
    ///
    /// 异常回调自身再失败时仅记录一次日志——这是兜底路径，不允许递归放大。
    fn enter_exception_caught(ctx: &Arc<HandlerContext>, cause: Arc<StrandError>) {
        let eligible = ctx.invoke_allowed()
            && ctx.spec.inbound().is_some()
            && ctx.spec.mask().contains(ExecMask::EXCEPTION_CAUGHT);
        if eligible {
            let handler = ctx
                .spec
                .inbound()
                .cloned()
                .expect("eligibility implies an inbound handler");
            if let Err(secondary) = handler.exception_caught(ctx, cause) {
                if let Some(channel) = ctx.try_channel() {
                    channel.logger().error(
                        "exception handler failed; secondary cause discarded",
                        Some(&secondary),
                    );
                }
            }
        } else {
            ctx.fire_exception_caught(cause);
        }
    }

    // ---- 入站转发（Handler 视角的 fire_*） ----

    /// 将“通道完成注册”转发给下一个合格节点。
    pub fn fire_channel_registered(self: &Arc<Self>) {
        if let Some(next) = self.find_next_inbound(ExecMask::CHANNEL_REGISTERED) {
            Self::invoke_channel_registered(next);
        }
    }

    /// 将“通道解除注册”转发给下一个合格节点。
    pub fn fire_channel_unregistered(self: &Arc<Self>) {
        if let Some(next) = self.find_next_inbound(ExecMask::CHANNEL_UNREGISTERED) {
            Self::invoke_channel_unregistered(next);
        }
    }

    /// 将“通道活跃”转发给下一个合格节点。
    pub fn fire_channel_active(self: &Arc<Self>) {
        if let Some(next) = self.find_next_inbound(ExecMask::CHANNEL_ACTIVE) {
            Self::invoke_channel_active(next);
        }
    }

    /// 将“通道非活跃”转发给下一个合格节点。
    pub fn fire_channel_inactive(self: &Arc<Self>) {
        if let Some(next) = self.find_next_inbound(ExecMask::CHANNEL_INACTIVE) {
            Self::invoke_channel_inactive(next);
        }
    }

    /// 将消息转发给下一个合格节点；链路尽头无人接收时释放消息。
    pub fn fire_channel_read(self: &Arc<Self>, msg: PipelineMessage) {
        match self.find_next_inbound(ExecMask::CHANNEL_READ) {
            Some(next) => Self::invoke_channel_read(next, msg),
            None => msg.release(),
        }
    }

    /// 将“读取完成”转发给下一个合格节点。
    pub fn fire_channel_read_complete(self: &Arc<Self>) {
        if let Some(next) = self.find_next_inbound(ExecMask::CHANNEL_READ_COMPLETE) {
            Self::invoke_channel_read_complete(next);
        }
    }

    /// 将“可写性变化”转发给下一个合格节点。
    pub fn fire_writability_changed(self: &Arc<Self>) {
        if let Some(next) = self.find_next_inbound(ExecMask::WRITABILITY_CHANGED) {
            Self::invoke_writability_changed(next);
        }
    }

    /// 将用户事件转发给下一个合格节点。
    pub fn fire_user_event(self: &Arc<Self>, event: UserEvent) {
        if let Some(next) = self.find_next_inbound(ExecMask::USER_EVENT) {
            Self::invoke_user_event(next, event);
        }
    }

    /// 将异常转发给下一个合格节点。
    pub fn fire_exception_caught(self: &Arc<Self>, cause: Arc<StrandError>) {
        if let Some(next) = self.find_next_inbound(ExecMask::EXCEPTION_CAUGHT) {
            Self::invoke_exception_caught(next, cause);
        }
    }

    // ---- 出站操作 ----

    /// 发起绑定，沿出站方向回溯。
    pub fn bind(self: &Arc<Self>, addr: crate::transport::TransportSocketAddr, promise: ChannelPromise) {
        let Some(next) = self.find_prev_outbound(ExecMask::BIND) else {
            promise.try_failure(StrandError::closed());
            return;
        };
        Self::execute_or_inline(next, move |ctx| {
            if !ctx.invoke_allowed() {
                ctx.bind(addr, promise);
                return;
            }
            let Some(handler) = ctx.spec.outbound().cloned() else {
                ctx.bind(addr, promise);
                return;
            };
            if let Err(err) = handler.bind(ctx, addr, promise.clone()) {
                promise.try_failure(err);
            }
        });
    }

    /// 发起连接。
    pub fn connect(
        self: &Arc<Self>,
        remote: crate::transport::TransportSocketAddr,
        local: Option<crate::transport::TransportSocketAddr>,
        promise: ChannelPromise,
    ) {
        let Some(next) = self.find_prev_outbound(ExecMask::CONNECT) else {
            promise.try_failure(StrandError::closed());
            return;
        };
        Self::execute_or_inline(next, move |ctx| {
            if !ctx.invoke_allowed() {
                ctx.connect(remote, local, promise);
                return;
            }
            let Some(handler) = ctx.spec.outbound().cloned() else {
                ctx.connect(remote, local, promise);
                return;
            };
            if let Err(err) = handler.connect(ctx, remote, local, promise.clone()) {
                promise.try_failure(err);
            }
        });
    }

    /// 发起断连。
    pub fn disconnect(self: &Arc<Self>, promise: ChannelPromise) {
        let Some(next) = self.find_prev_outbound(ExecMask::DISCONNECT) else {
            promise.try_failure(StrandError::closed());
            return;
        };
        Self::execute_or_inline(next, move |ctx| {
            if !ctx.invoke_allowed() {
                ctx.disconnect(promise);
                return;
            }
            let Some(handler) = ctx.spec.outbound().cloned() else {
                ctx.disconnect(promise);
                return;
            };
            if let Err(err) = handler.disconnect(ctx, promise.clone()) {
                promise.try_failure(err);
            }
        });
    }

    /// 发起关闭。
    pub fn close(self: &Arc<Self>, promise: ChannelPromise) {
        let Some(next) = self.find_prev_outbound(ExecMask::CLOSE) else {
            promise.try_failure(StrandError::closed());
            return;
        };
        Self::execute_or_inline(next, move |ctx| {
            if !ctx.invoke_allowed() {
                ctx.close(promise);
                return;
            }
            let Some(handler) = ctx.spec.outbound().cloned() else {
                ctx.close(promise);
                return;
            };
            if let Err(err) = handler.close(ctx, promise.clone()) {
                promise.try_failure(err);
            }
        });
    }

    /// 发起解除注册。
    pub fn deregister(self: &Arc<Self>, promise: ChannelPromise) {
        let Some(next) = self.find_prev_outbound(ExecMask::DEREGISTER) else {
            promise.try_failure(StrandError::closed());
            return;
        };
        Self::execute_or_inline(next, move |ctx| {
            if !ctx.invoke_allowed() {
                ctx.deregister(promise);
                return;
            }
            let Some(handler) = ctx.spec.outbound().cloned() else {
                ctx.deregister(promise);
                return;
            };
            if let Err(err) = handler.deregister(ctx, promise.clone()) {
                promise.try_failure(err);
            }
        });
    }

    /// 声明读意向。
    pub fn read(self: &Arc<Self>) {
        let Some(next) = self.find_prev_outbound(ExecMask::READ) else {
            return;
        };
        Self::execute_or_inline(next, |ctx| {
            if !ctx.invoke_allowed() {
                ctx.read();
                return;
            }
            let Some(handler) = ctx.spec.outbound().cloned() else {
                ctx.read();
                return;
            };
            if let Err(err) = handler.read(ctx) {
                Self::enter_exception_caught(ctx, Arc::new(err));
            }
        });
    }

    /// 写入消息（不冲刷）。
    pub fn write(self: &Arc<Self>, msg: PipelineMessage, promise: ChannelPromise) {
        self.write_with_flush(msg, promise, false);
    }

    /// 写入消息并立即冲刷。
    pub fn write_and_flush(self: &Arc<Self>, msg: PipelineMessage, promise: ChannelPromise) {
        self.write_with_flush(msg, promise, true);
    }

    /// 冲刷写缓冲。
    pub fn flush(self: &Arc<Self>) {
        let Some(next) = self.find_prev_outbound(ExecMask::FLUSH) else {
            return;
        };
        Self::execute_or_inline(next, |ctx| Self::do_flush(ctx));
    }

    fn write_with_flush(self: &Arc<Self>, msg: PipelineMessage, promise: ChannelPromise, flush: bool) {
        let flag = if flush {
            ExecMask::WRITE.union(ExecMask::FLUSH)
        } else {
            ExecMask::WRITE
        };
        let Some(next) = self.find_prev_outbound(flag) else {
            msg.release();
            promise.try_failure(StrandError::closed());
            return;
        };
        match next.executor() {
            Some(executor) if !executor.in_event_loop() => {
                // 跨执行器写任务：在提交现场预记账，背压先于任务执行生效；
                // 任务运行时结清预记账，真正入队的字节由出站缓冲重新计入。
                let size = msg.size_estimate().saturating_add(ENTRY_OVERHEAD);
                let accounted = next.try_channel();
                if let Some(channel) = &accounted {
                    channel.outbound().increment_pending(size, true);
                }
                let ctx = Arc::clone(&next);
                executor.execute(Box::new(move || {
                    if let Some(channel) = accounted {
                        channel.outbound().decrement_pending(size, true, true);
                    }
                    Self::do_write(&ctx, msg, promise, flush);
                }));
            }
            _ => Self::do_write(&next, msg, promise, flush),
        }
    }

    fn do_write(ctx: &Arc<HandlerContext>, msg: PipelineMessage, promise: ChannelPromise, flush: bool) {
        if !ctx.invoke_allowed() {
            if flush {
                ctx.write_and_flush(msg, promise);
            } else {
                ctx.write(msg, promise);
            }
            return;
        }
        let Some(handler) = ctx.spec.outbound().cloned() else {
            if flush {
                ctx.write_and_flush(msg, promise);
            } else {
                ctx.write(msg, promise);
            }
            return;
        };
        if let Err(err) = handler.write(ctx, msg, promise.clone()) {
            promise.try_failure(err);
        }
        if flush
            && let Err(err) = handler.flush(ctx)
        {
            Self::enter_exception_caught(ctx, Arc::new(err));
        }
    }

    fn do_flush(ctx: &Arc<HandlerContext>) {
        if !ctx.invoke_allowed() {
            ctx.flush();
            return;
        }
        let Some(handler) = ctx.spec.outbound().cloned() else {
            ctx.flush();
            return;
        };
        if let Err(err) = handler.flush(ctx) {
            Self::enter_exception_caught(ctx, Arc::new(err));
        }
    }
}
