//! Handler 流水线：有序、可运行期变更的拦截链。
//!
//! # 模块定位（Why）
//! - 每个通道恰好持有一条流水线；入站事件自头向尾、出站操作自尾向头流经全部合格节点。
//! - 综合 Netty `ChannelPipeline`、Envoy FilterChain、Tower Stack 的经验：
//!   拦截链在运行期可插拔，且变更绝不打断事件顺序、不泄漏资源。
//!
//! # 结构总览（How）
//! - 双向链表以固定的头/尾哨兵锚定；结构变更在互斥锁内完成指针缝合，
//!   “前驱的 `next` 指针”最后写入，保证并发遍历者要么看到旧链、要么看到完整新节点，
//!   绝不见到半挂接状态。
//! - 通道注册前加入的 Handler 进入挂起队列；注册瞬间先排空全部 `handler_added`
//!   回调，再广播注册事件——Handler 必须先感知自身装配完毕，才可能收到其它事件。
//! - 被摘除的节点保留自身前后向指针：仍在飞行途中的事件穿透它继续前进；
//!   其 Handler 自 `RemoveComplete` 起不再被调用。
//!
//! # 线程契约（What）
//! - 结构变更接口可从任意线程调用；回调一律被调度到对应节点的执行器上执行。

pub mod context;
pub mod event;
pub mod handler;
pub mod mask;

mod internal;

use alloc::{borrow::Cow, sync::Arc, sync::Weak, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, RwLock};

pub use context::HandlerContext;
pub use event::UserEvent;
pub use handler::{
    ChannelHandler, HandlerSpec, InboundHandler, OutboundHandler, duplex_handler,
    inbound_handler, outbound_handler,
};
pub use mask::ExecMask;

use self::internal::{HeadHandler, TailHandler};
use crate::{
    arc_swap::ArcSwap,
    buffer::PipelineMessage,
    channel::Channel,
    error::{StrandError, codes},
    executor::EventExecutor,
    promise::ChannelPromise,
    transport::TransportSocketAddr,
};

/// 注册前挂起的生命周期回调。
enum PendingCallback {
    Added(Arc<HandlerContext>),
    Removed(Arc<HandlerContext>),
}

/// 一条通道的拦截链。
///
/// # 契约说明（What）
/// - `add_*` / `remove`：运行期结构变更；名称在链内唯一。
/// - `fire_*`：自头节点注入入站事件。
/// - `bind` / `connect` / `write` / `flush` 等：自尾节点发起出站操作。
/// - 所有回调的线程亲和、顺序与异常语义见 [`context`] 模块。
pub struct Pipeline {
    head: Arc<HandlerContext>,
    tail: Arc<HandlerContext>,
    channel: RwLock<Weak<Channel>>,
    mutation: Mutex<()>,
    pending: Mutex<Vec<PendingCallback>>,
    registered_once: AtomicBool,
    self_ref: ArcSwap<Weak<Pipeline>>,
}

impl Pipeline {
    /// 构造带头尾哨兵的空链。
    pub(crate) fn new() -> Arc<Self> {
        let head = HandlerContext::new(
            Cow::Borrowed("head"),
            handler::duplex_handler(HeadHandler),
            None,
        );
        let tail = HandlerContext::new(
            Cow::Borrowed("tail"),
            handler::inbound_handler(TailHandler),
            None,
        );
        head.set_next(Some(Arc::clone(&tail)));
        tail.set_prev(Arc::downgrade(&head));
        let _ = head.set_add_complete();
        let _ = tail.set_add_complete();

        let pipeline = Arc::new(Self {
            head,
            tail,
            channel: RwLock::new(Weak::new()),
            mutation: Mutex::new(()),
            pending: Mutex::new(Vec::new()),
            registered_once: AtomicBool::new(false),
            self_ref: ArcSwap::from_pointee(Weak::new()),
        });
        // 构造完成后立即写入弱自引用：后续上下文与任务均通过 upgrade 取回强引用。
        pipeline.self_ref.store(Arc::new(Arc::downgrade(&pipeline)));
        pipeline
    }

    /// 绑定所属通道；构造期一次性装配。
    pub(crate) fn bind_channel(&self, channel: Weak<Channel>) {
        *self.channel.write() = channel.clone();
        let this = self.self_ref.load_full().as_ref().clone();
        self.head.attach(channel.clone(), this.clone());
        self.tail.attach(channel, this);
    }

    fn self_arc(&self) -> Arc<Pipeline> {
        self.self_ref
            .load_full()
            .upgrade()
            .expect("pipeline self reference must be initialized")
    }

    // ---- 结构变更 ----

    /// 追加到链尾（尾哨兵之前）。
    pub fn add_last(
        &self,
        name: impl Into<Cow<'static, str>>,
        spec: HandlerSpec,
    ) -> Result<(), StrandError> {
        self.insert(name.into(), spec, None, InsertAt::Last)
    }

    /// 追加到链尾并绑定独立执行器。
    pub fn add_last_on(
        &self,
        executor: Arc<dyn EventExecutor>,
        name: impl Into<Cow<'static, str>>,
        spec: HandlerSpec,
    ) -> Result<(), StrandError> {
        self.insert(name.into(), spec, Some(executor), InsertAt::Last)
    }

    /// 插入到链首（头哨兵之后）。
    pub fn add_first(
        &self,
        name: impl Into<Cow<'static, str>>,
        spec: HandlerSpec,
    ) -> Result<(), StrandError> {
        self.insert(name.into(), spec, None, InsertAt::First)
    }

    /// 插入到指定节点之前。
    pub fn add_before(
        &self,
        anchor: &str,
        name: impl Into<Cow<'static, str>>,
        spec: HandlerSpec,
    ) -> Result<(), StrandError> {
        self.insert(name.into(), spec, None, InsertAt::Before(anchor))
    }

    /// 插入到指定节点之后。
    pub fn add_after(
        &self,
        anchor: &str,
        name: impl Into<Cow<'static, str>>,
        spec: HandlerSpec,
    ) -> Result<(), StrandError> {
        self.insert(name.into(), spec, None, InsertAt::After(anchor))
    }

    fn insert(
        &self,
        name: Cow<'static, str>,
        spec: HandlerSpec,
        executor: Option<Arc<dyn EventExecutor>>,
        position: InsertAt<'_>,
    ) -> Result<(), StrandError> {
        let ctx = HandlerContext::new(name, spec, executor);
        ctx.attach(
            self.channel.read().clone(),
            self.self_ref.load_full().as_ref().clone(),
        );
        {
            let _guard = self.mutation.lock();
            if self.lookup(ctx.name()).is_some() {
                return Err(StrandError::new(
                    codes::PIPELINE_DUPLICATE_NAME,
                    alloc::format!("duplicate handler name: {}", ctx.name()),
                ));
            }
            let anchor = match position {
                InsertAt::Last => Arc::clone(&self.tail),
                InsertAt::First => self
                    .head
                    .next_ctx()
                    .expect("head sentinel always has a successor"),
                InsertAt::Before(anchor_name) => self.lookup(anchor_name).ok_or_else(|| {
                    StrandError::new(
                        codes::PIPELINE_UNKNOWN_HANDLER,
                        alloc::format!("unknown anchor handler: {anchor_name}"),
                    )
                })?,
                InsertAt::After(anchor_name) => {
                    let found = self.lookup(anchor_name).ok_or_else(|| {
                        StrandError::new(
                            codes::PIPELINE_UNKNOWN_HANDLER,
                            alloc::format!("unknown anchor handler: {anchor_name}"),
                        )
                    })?;
                    found
                        .next_ctx()
                        .expect("non-tail node always has a successor")
                }
            };
            Self::link_before(&anchor, &ctx);
            if !self.registered_once.load(Ordering::Acquire) {
                ctx.set_add_pending();
                self.pending.lock().push(PendingCallback::Added(ctx));
                return Ok(());
            }
        }
        self.schedule_handler_added(ctx);
        Ok(())
    }

    /// 在 `anchor` 之前缝合新节点；前驱的 `next` 最后写入作为发布点。
    fn link_before(anchor: &Arc<HandlerContext>, ctx: &Arc<HandlerContext>) {
        let prev = anchor
            .prev_ctx()
            .expect("anchor node always has a predecessor");
        ctx.set_prev(Arc::downgrade(&prev));
        ctx.set_next(Some(Arc::clone(anchor)));
        anchor.set_prev(Arc::downgrade(ctx));
        prev.set_next(Some(Arc::clone(ctx)));
    }

    /// 摘除一个命名节点。
    ///
    /// 节点的 `handler_removed` 回调在其执行器上运行；回调完成后节点进入
    /// `RemoveComplete`，此后任何事件不再抵达该 Handler。
    pub fn remove(&self, name: &str) -> Result<(), StrandError> {
        let ctx = {
            let _guard = self.mutation.lock();
            let ctx = self.lookup(name).ok_or_else(|| {
                StrandError::new(
                    codes::PIPELINE_UNKNOWN_HANDLER,
                    alloc::format!("unknown handler: {name}"),
                )
            })?;
            Self::unlink(&ctx);
            if !self.registered_once.load(Ordering::Acquire) {
                self.pending.lock().push(PendingCallback::Removed(ctx));
                return Ok(());
            }
            ctx
        };
        self.schedule_handler_removed(ctx);
        Ok(())
    }

    /// 摘除链路上的全部用户节点；已关闭通道最终解除注册时由头节点触发。
    pub(crate) fn destroy(&self) {
        loop {
            let ctx = {
                let _guard = self.mutation.lock();
                let Some(candidate) = self.tail.prev_ctx() else {
                    break;
                };
                if Arc::ptr_eq(&candidate, &self.head) {
                    break;
                }
                Self::unlink(&candidate);
                candidate
            };
            self.schedule_handler_removed(ctx);
        }
    }

    fn unlink(ctx: &Arc<HandlerContext>) {
        let prev = ctx
            .prev_ctx()
            .expect("linked node always has a predecessor");
        let next = ctx.next_ctx().expect("linked node always has a successor");
        prev.set_next(Some(Arc::clone(&next)));
        next.set_prev(Arc::downgrade(&prev));
        // 节点自身指针保留：飞行中的事件可继续穿透已摘除节点。
    }

    /// 按名称查找当前链上的用户节点。
    pub fn context(&self, name: &str) -> Option<Arc<HandlerContext>> {
        self.lookup(name)
    }

    fn lookup(&self, name: &str) -> Option<Arc<HandlerContext>> {
        let mut cursor = self.head.next_ctx();
        while let Some(ctx) = cursor {
            if Arc::ptr_eq(&ctx, &self.tail) {
                return None;
            }
            if ctx.name() == name {
                return Some(ctx);
            }
            cursor = ctx.next_ctx();
        }
        None
    }

    /// 当前链上用户节点的名称快照，顺序与执行顺序一致。
    pub fn names(&self) -> Vec<Cow<'static, str>> {
        let mut names = Vec::new();
        let mut cursor = self.head.next_ctx();
        while let Some(ctx) = cursor {
            if Arc::ptr_eq(&ctx, &self.tail) {
                break;
            }
            names.push(Cow::Owned(ctx.name().into()));
            cursor = ctx.next_ctx();
        }
        names
    }

    // ---- 生命周期回调调度 ----

    fn schedule_handler_added(&self, ctx: Arc<HandlerContext>) {
        match ctx.executor() {
            Some(executor) if !executor.in_event_loop() => {
                ctx.set_add_pending();
                let pipeline = self.self_arc();
                executor.execute(alloc::boxed::Box::new(move || {
                    pipeline.call_handler_added(&ctx);
                }));
            }
            _ => self.call_handler_added(&ctx),
        }
    }

    fn schedule_handler_removed(&self, ctx: Arc<HandlerContext>) {
        match ctx.executor() {
            Some(executor) if !executor.in_event_loop() => {
                let pipeline = self.self_arc();
                executor.execute(alloc::boxed::Box::new(move || {
                    pipeline.call_handler_removed(&ctx);
                }));
            }
            _ => self.call_handler_removed(&ctx),
        }
    }

    fn call_handler_added(&self, ctx: &Arc<HandlerContext>) {
        if !ctx.set_add_complete() {
            return;
        }
        if let Err(err) = ctx.spec().base().handler_added(ctx) {
            {
                let _guard = self.mutation.lock();
                Self::unlink(ctx);
            }
            ctx.set_remove_complete();
            self.fire_exception_caught(Arc::new(err));
        }
    }

    fn call_handler_removed(&self, ctx: &Arc<HandlerContext>) {
        if ctx.is_removed() {
            return;
        }
        let result = ctx.spec().base().handler_removed(ctx);
        ctx.set_remove_complete();
        if let Err(err) = result {
            self.fire_exception_caught(Arc::new(err));
        }
    }

    /// 首次注册时排空挂起的生命周期回调。
    ///
    /// 排序要求：Handler 必须先完成自身的 `handler_added`，之后才可能观察到
    /// 注册事件——调用方保证本方法先于 `fire_channel_registered` 执行。
    pub(crate) fn invoke_handler_added_if_needed(&self) {
        if self.registered_once.swap(true, Ordering::AcqRel) {
            return;
        }
        let callbacks = core::mem::take(&mut *self.pending.lock());
        for callback in callbacks {
            match callback {
                PendingCallback::Added(ctx) => self.schedule_handler_added(ctx),
                PendingCallback::Removed(ctx) => self.schedule_handler_removed(ctx),
            }
        }
    }

    // ---- 入站事件入口（自头节点注入） ----

    /// 广播“通道完成注册”。
    pub fn fire_channel_registered(&self) {
        HandlerContext::invoke_channel_registered(Arc::clone(&self.head));
    }

    /// 广播“通道解除注册”。
    pub fn fire_channel_unregistered(&self) {
        HandlerContext::invoke_channel_unregistered(Arc::clone(&self.head));
    }

    /// 广播“通道活跃”。
    pub fn fire_channel_active(&self) {
        HandlerContext::invoke_channel_active(Arc::clone(&self.head));
    }

    /// 广播“通道非活跃”。
    pub fn fire_channel_inactive(&self) {
        HandlerContext::invoke_channel_inactive(Arc::clone(&self.head));
    }

    /// 注入一条读到的消息。
    pub fn fire_channel_read(&self, msg: PipelineMessage) {
        HandlerContext::invoke_channel_read(Arc::clone(&self.head), msg);
    }

    /// 宣告一轮读取结束。
    pub fn fire_channel_read_complete(&self) {
        HandlerContext::invoke_channel_read_complete(Arc::clone(&self.head));
    }

    /// 广播可写性变化。
    pub fn fire_writability_changed(&self) {
        HandlerContext::invoke_writability_changed(Arc::clone(&self.head));
    }

    /// 广播用户事件。
    pub fn fire_user_event(&self, event: UserEvent) {
        HandlerContext::invoke_user_event(Arc::clone(&self.head), event);
    }

    /// 广播异常。
    pub fn fire_exception_caught(&self, cause: Arc<StrandError>) {
        HandlerContext::invoke_exception_caught(Arc::clone(&self.head), cause);
    }

    // ---- 出站操作入口（自尾节点发起） ----

    /// 发起绑定。
    pub fn bind(&self, addr: TransportSocketAddr, promise: ChannelPromise) {
        self.tail.bind(addr, promise);
    }

    /// 发起连接。
    pub fn connect(
        &self,
        remote: TransportSocketAddr,
        local: Option<TransportSocketAddr>,
        promise: ChannelPromise,
    ) {
        self.tail.connect(remote, local, promise);
    }

    /// 发起断连。
    pub fn disconnect(&self, promise: ChannelPromise) {
        self.tail.disconnect(promise);
    }

    /// 发起关闭。
    pub fn close(&self, promise: ChannelPromise) {
        self.tail.close(promise);
    }

    /// 发起解除注册。
    pub fn deregister(&self, promise: ChannelPromise) {
        self.tail.deregister(promise);
    }

    /// 声明读意向。
    pub fn read(&self) {
        self.tail.read();
    }

    /// 写入消息（不冲刷）。
    pub fn write(&self, msg: PipelineMessage, promise: ChannelPromise) {
        self.tail.write(msg, promise);
    }

    /// 写入消息并立即冲刷。
    pub fn write_and_flush(&self, msg: PipelineMessage, promise: ChannelPromise) {
        self.tail.write_and_flush(msg, promise);
    }

    /// 冲刷写缓冲。
    pub fn flush(&self) {
        self.tail.flush();
    }
}

enum InsertAt<'a> {
    First,
    Last,
    Before(&'a str),
    After(&'a str),
}
