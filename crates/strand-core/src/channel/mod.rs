//! 通道：一个网络端点的生命周期协调者。
//!
//! # 模块定位（Why）
//! - 通道持有身份、生命周期状态与两个子对象（流水线、出站缓冲），
//!   对外暴露以流水线为载体的生命周期与读写操作。
//! - 对齐 Netty `Channel`/`AbstractChannel` 的职责切分：公开操作全部委托流水线，
//!   真正落到传输钩子的内部操作只允许所属执行器线程驱动（外加一小组任意线程白名单：
//!   地址查询、强制关闭、注册、解除注册、void Promise 获取）。
//!
//! # 生命周期（What）
//! - 构造（未注册）→ 注册（绑定执行器）→ 活跃 → 非活跃 → 关闭（终态）。
//! - 通道可在解除注册后重新注册到另一执行器而不丢失身份；
//!   `channel_active` 只在首次注册观察到活跃时广播一次。
//! - 一旦关闭：出站缓冲脱离，任何后续写入立即以“通道已关闭”失败，绝不阻塞。

mod id;
mod internal;
mod options;

use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
};
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, RwLock};

pub use id::ChannelId;
pub use options::ChannelOptions;

use crate::{
    buffer::PipelineMessage,
    error::StrandError,
    executor::{EventExecutor, Task},
    observability::Logger,
    outbound::OutboundBuffer,
    pipeline::Pipeline,
    promise::{ChannelFuture, ChannelPromise},
    transport::{Transport, TransportSocketAddr},
};

/// 一个网络端点。
///
/// # 契约说明（What）
/// - 公开生命周期操作（`bind`/`connect`/`disconnect`/`close`/`deregister`）与读写
///   （`write`/`write_and_flush`/`flush`/`read`）全部经流水线传播，结果经 Promise 返回。
/// - 注册（[`register`](Self::register)）与强制关闭（[`close_forcibly`](Self::close_forcibly)）
///   属于任意线程白名单。
/// - 状态查询（`is_open`/`is_active`/`is_writable` 与地址访问）线程安全。
pub struct Channel {
    id: ChannelId,
    parent: Option<Weak<Channel>>,
    options: ChannelOptions,
    logger: Arc<dyn Logger>,
    transport: Box<dyn Transport>,
    pipeline: Arc<Pipeline>,
    outbound: OutboundBuffer,
    executor: RwLock<Option<Arc<dyn EventExecutor>>>,
    registered: AtomicBool,
    never_registered: AtomicBool,
    close_initiated: AtomicBool,
    close_promise: ChannelPromise,
    initial_close_cause: Mutex<Option<Arc<StrandError>>>,
    local_cache: Mutex<Option<TransportSocketAddr>>,
    remote_cache: Mutex<Option<TransportSocketAddr>>,
    in_flush: AtomicBool,
}

impl Channel {
    /// 构造顶层通道。
    pub fn new(
        transport: Box<dyn Transport>,
        options: ChannelOptions,
        logger: Arc<dyn Logger>,
    ) -> Arc<Self> {
        Self::build(None, transport, options, logger)
    }

    /// 构造派生子通道（如由监听端点派生的连接端点），保留对父通道的弱引用。
    pub fn with_parent(
        parent: &Arc<Channel>,
        transport: Box<dyn Transport>,
        options: ChannelOptions,
        logger: Arc<dyn Logger>,
    ) -> Arc<Self> {
        Self::build(Some(Arc::downgrade(parent)), transport, options, logger)
    }

    fn build(
        parent: Option<Weak<Channel>>,
        transport: Box<dyn Transport>,
        options: ChannelOptions,
        logger: Arc<dyn Logger>,
    ) -> Arc<Self> {
        let outbound = OutboundBuffer::new(&options);
        let channel = Arc::new(Self {
            id: ChannelId::next(),
            parent,
            options,
            logger,
            transport,
            pipeline: Pipeline::new(),
            outbound,
            executor: RwLock::new(None),
            registered: AtomicBool::new(false),
            never_registered: AtomicBool::new(true),
            close_initiated: AtomicBool::new(false),
            close_promise: ChannelPromise::new(),
            initial_close_cause: Mutex::new(None),
            local_cache: Mutex::new(None),
            remote_cache: Mutex::new(None),
            in_flush: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&channel);
        channel.pipeline.bind_channel(weak.clone());
        channel.outbound.bind_channel(weak);
        channel
    }

    // ---- 身份与子对象 ----

    /// 通道唯一标识。
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// 父通道（若本通道是派生端点）。
    pub fn parent(&self) -> Option<Arc<Channel>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// 通道配置。
    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// 所属流水线。
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// 出站缓冲。
    pub fn outbound(&self) -> &OutboundBuffer {
        &self.outbound
    }

    /// 注入的日志出口。
    pub fn logger(&self) -> &dyn Logger {
        self.logger.as_ref()
    }

    pub(crate) fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    // ---- 状态查询（任意线程） ----

    /// 当前绑定的执行器。
    pub fn executor(&self) -> Option<Arc<dyn EventExecutor>> {
        self.executor.read().clone()
    }

    /// 是否已注册到执行器。
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// 底层资源是否仍然持有。
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// 连接是否处于可读写状态。
    pub fn is_active(&self) -> bool {
        self.transport.is_active()
    }

    /// 当前是否可写；出站缓冲脱离（关闭进行中）后恒为不可写。
    pub fn is_writable(&self) -> bool {
        !self.outbound.is_detached() && self.outbound.is_writable()
    }

    /// 本地地址，懒解析并缓存；注册态变化时缓存失效。
    pub fn local_addr(&self) -> Option<TransportSocketAddr> {
        if let Some(addr) = *self.local_cache.lock() {
            return Some(addr);
        }
        let addr = self.transport.local_addr();
        if let Some(resolved) = addr {
            *self.local_cache.lock() = Some(resolved);
        }
        addr
    }

    /// 对端地址，懒解析并缓存。
    pub fn remote_addr(&self) -> Option<TransportSocketAddr> {
        if let Some(addr) = *self.remote_cache.lock() {
            return Some(addr);
        }
        let addr = self.transport.remote_addr();
        if let Some(resolved) = addr {
            *self.remote_cache.lock() = Some(resolved);
        }
        addr
    }

    /// 距离进入“不可写”还可缓冲的字节数。
    pub fn bytes_before_unwritable(&self) -> usize {
        self.outbound.bytes_before_unwritable()
    }

    /// 距离恢复“可写”还需排空的字节数。
    pub fn bytes_before_writable(&self) -> usize {
        self.outbound.bytes_before_writable()
    }

    /// 关闭原因快照：关闭发起后即可读取。
    pub fn initial_close_cause(&self) -> Option<Arc<StrandError>> {
        self.initial_close_cause.lock().clone()
    }

    /// 通道终态 Future；关闭完成后解析。
    pub fn close_future(&self) -> ChannelFuture {
        self.close_promise.future()
    }

    // ---- Promise 工厂 ----

    /// 构造绑定本通道执行器的常规 Promise。
    pub fn new_promise(&self) -> ChannelPromise {
        let promise = ChannelPromise::new();
        if let Some(executor) = self.executor() {
            promise.attach_executor(executor);
        }
        promise
    }

    /// 返回本通道的 void Promise：免分配的“发后不理”完成端。
    pub fn void_promise(self: &Arc<Self>) -> ChannelPromise {
        ChannelPromise::new_void(Arc::downgrade(self))
    }

    // ---- 生命周期操作（流水线委托） ----

    /// 绑定本地地址。
    pub fn bind(self: &Arc<Self>, addr: TransportSocketAddr) -> ChannelFuture {
        let promise = self.new_promise();
        self.pipeline.bind(addr, promise.clone());
        promise.future()
    }

    /// 绑定本地地址，结果写入调用方提供的 Promise。
    pub fn bind_with(self: &Arc<Self>, addr: TransportSocketAddr, promise: ChannelPromise) {
        self.pipeline.bind(addr, promise);
    }

    /// 连接对端。
    pub fn connect(
        self: &Arc<Self>,
        remote: TransportSocketAddr,
        local: Option<TransportSocketAddr>,
    ) -> ChannelFuture {
        let promise = self.new_promise();
        self.pipeline.connect(remote, local, promise.clone());
        promise.future()
    }

    /// 断开连接。
    pub fn disconnect(self: &Arc<Self>) -> ChannelFuture {
        let promise = self.new_promise();
        self.pipeline.disconnect(promise.clone());
        promise.future()
    }

    /// 关闭通道。并发调用安全：首个调用发起关闭，后续调用等待同一结果。
    pub fn close(self: &Arc<Self>) -> ChannelFuture {
        let promise = self.new_promise();
        self.pipeline.close(promise.clone());
        promise.future()
    }

    /// 关闭通道，结果写入调用方提供的 Promise。
    pub fn close_with(self: &Arc<Self>, promise: ChannelPromise) {
        self.pipeline.close(promise);
    }

    /// 解除注册，之后可重新注册到其它执行器。
    pub fn deregister(self: &Arc<Self>) -> ChannelFuture {
        let promise = self.new_promise();
        self.pipeline.deregister(promise.clone());
        promise.future()
    }

    /// 声明读意向。
    pub fn read(&self) {
        self.pipeline.read();
    }

    /// 写入消息（不冲刷）。
    pub fn write(self: &Arc<Self>, msg: PipelineMessage) -> ChannelFuture {
        let promise = self.new_promise();
        self.pipeline.write(msg, promise.clone());
        promise.future()
    }

    /// 写入消息，结果写入调用方提供的 Promise。
    pub fn write_with(self: &Arc<Self>, msg: PipelineMessage, promise: ChannelPromise) {
        self.pipeline.write(msg, promise);
    }

    /// 写入并立即冲刷。
    pub fn write_and_flush(self: &Arc<Self>, msg: PipelineMessage) -> ChannelFuture {
        let promise = self.new_promise();
        self.pipeline.write_and_flush(msg, promise.clone());
        promise.future()
    }

    /// 冲刷写缓冲。
    pub fn flush(&self) {
        self.pipeline.flush();
    }

    // ---- 任务调度辅助 ----

    /// 将任务提交到本通道的执行器；尚未注册时退化为就地执行。
    pub(crate) fn invoke_later(&self, task: Task) {
        match self.executor() {
            Some(executor) => executor.execute(task),
            None => task(),
        }
    }
}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("registered", &self.is_registered())
            .field("open", &self.is_open())
            .field("active", &self.is_active())
            .finish()
    }
}
