//! 通道内部操作集：注册、关闭、写出与错误升级。
//!
//! # 模块定位（Why）
//! - 这里是出站操作穿过流水线头节点之后的最终落点，也是生命周期算法的唯一实现处。
//! - 除注册与强制关闭属于任意线程白名单外，本模块的方法只应由所属执行器线程驱动；
//!   所有“必须不重入当前调用栈”的后续动作统一表达为向执行器提交续延任务。
//!
//! # 失败语义（What）
//! - 注册、绑定、断连、关闭、解除注册的结果只经 Promise 报告；
//!   内部错误一律捕获并转为 Promise 失败，绝不同步抛出（编程错误除外）。
//! - 写出失败按错误类别与 `auto_close` 配置二选一：升级为整通道关闭（缓冲写入全部
//!   以同一原因失败），或仅半关输出侧并广播 [`UserEvent::OutputShutdown`]。

use alloc::{boxed::Box, format, sync::Arc};
use core::sync::atomic::Ordering;

use super::Channel;
use crate::{
    buffer::PipelineMessage,
    error::{StrandError, codes},
    executor::EventExecutor,
    pipeline::UserEvent,
    promise::ChannelPromise,
    transport::TransportSocketAddr,
};

impl Channel {
    // ---- 注册 ----

    /// 将通道注册到执行器（任意线程白名单操作）。
    ///
    /// # 算法（How）
    /// 1. 校验未注册、执行器类型兼容；任一失败都以 Promise 失败报告。
    /// 2. 绑定执行器（每个注册纪元恰好设置一次）。
    /// 3. 当前线程已是该执行器时同步执行注册步骤，否则打包提交。
    pub fn register(self: &Arc<Self>, executor: Arc<dyn EventExecutor>, promise: ChannelPromise) {
        if self.is_registered() {
            promise.try_failure(StrandError::new(
                codes::CHANNEL_ALREADY_REGISTERED,
                "channel is already registered to an executor",
            ));
            return;
        }
        if !self.transport().is_compatible(executor.as_ref()) {
            promise.try_failure(StrandError::new(
                codes::EXECUTOR_INCOMPATIBLE,
                "executor type is not compatible with this transport",
            ));
            return;
        }
        *self.executor.write() = Some(Arc::clone(&executor));
        self.close_promise.attach_executor(Arc::clone(&executor));
        promise.attach_executor(Arc::clone(&executor));
        if executor.in_event_loop() {
            self.register0(promise);
        } else {
            let channel = Arc::clone(self);
            executor.execute(Box::new(move || channel.register0(promise)));
        }
    }

    /// 便捷入口：注册并返回 Future。
    pub fn register_future(
        self: &Arc<Self>,
        executor: Arc<dyn EventExecutor>,
    ) -> crate::promise::ChannelFuture {
        let promise = ChannelPromise::new();
        let future = promise.future();
        self.register(executor, promise);
        future
    }

    /// 注册步骤：只在所属执行器线程上运行。
    ///
    /// # 顺序要求（What）
    /// - 并发关闭抢先时快速失败（注册或者完整执行、或者被短路，二者必居其一）。
    /// - 挂起的 `handler_added` 回调先于注册事件排空：Handler 必须先对自身装配
    ///   作出反应，才可能收到任何其它流水线事件。
    /// - `channel_active` 只在首次注册观察到活跃时广播；再注册只按配置恢复读意向。
    fn register0(self: &Arc<Self>, promise: ChannelPromise) {
        if !promise.set_uncancellable() || !self.ensure_open(&promise) {
            return;
        }
        let first_registration = self.never_registered.swap(false, Ordering::AcqRel);
        if let Err(err) = self.transport().do_register() {
            self.close_forcibly();
            self.close_promise.try_success();
            promise.try_failure(err);
            return;
        }
        self.registered.store(true, Ordering::Release);
        self.pipeline.invoke_handler_added_if_needed();
        promise.try_success();
        self.pipeline.fire_channel_registered();
        if self.is_active() {
            if first_registration {
                self.pipeline.fire_channel_active();
            } else if self.options.auto_read() {
                self.read();
            }
        }
    }

    /// 通道已关闭时以初始关闭原因（或标准关闭错误）失败 Promise。
    fn ensure_open(&self, promise: &ChannelPromise) -> bool {
        if self.is_open() {
            return true;
        }
        let cause = self
            .initial_close_cause()
            .unwrap_or_else(|| Arc::new(StrandError::closed()));
        promise.try_failure_shared(cause);
        false
    }

    // ---- 绑定 / 连接 / 断连 ----

    pub(crate) fn internal_bind(
        self: &Arc<Self>,
        addr: &TransportSocketAddr,
        promise: ChannelPromise,
    ) {
        if !promise.set_uncancellable() || !self.ensure_open(&promise) {
            return;
        }
        let was_active = self.is_active();
        if let Err(err) = self.transport().do_bind(addr) {
            promise.try_failure(err);
            self.close_if_closed();
            return;
        }
        self.invalidate_addr_cache();
        if !was_active && self.is_active() {
            let channel = Arc::clone(self);
            self.invoke_later(Box::new(move || {
                channel.pipeline.fire_channel_active();
            }));
        }
        promise.try_success();
    }

    pub(crate) fn internal_connect(
        self: &Arc<Self>,
        remote: &TransportSocketAddr,
        local: Option<&TransportSocketAddr>,
        promise: ChannelPromise,
    ) {
        if !promise.set_uncancellable() || !self.ensure_open(&promise) {
            return;
        }
        let was_active = self.is_active();
        if let Err(err) = self.transport().do_connect(remote, local) {
            promise.try_failure(err);
            self.close_if_closed();
            return;
        }
        self.invalidate_addr_cache();
        if !was_active && self.is_active() {
            let channel = Arc::clone(self);
            self.invoke_later(Box::new(move || {
                channel.pipeline.fire_channel_active();
            }));
        }
        promise.try_success();
    }

    pub(crate) fn internal_disconnect(self: &Arc<Self>, promise: ChannelPromise) {
        if !promise.set_uncancellable() {
            return;
        }
        let was_active = self.is_active();
        if let Err(err) = self.transport().do_disconnect() {
            promise.try_failure(err);
            self.close_if_closed();
            return;
        }
        self.invalidate_addr_cache();
        if was_active && !self.is_active() {
            let channel = Arc::clone(self);
            self.invoke_later(Box::new(move || {
                channel.pipeline.fire_channel_inactive();
            }));
        }
        promise.try_success();
        self.close_if_closed();
    }

    // ---- 关闭 ----

    /// 用户发起的关闭：标准关闭原因。
    pub(crate) fn internal_close_with(
        self: &Arc<Self>,
        promise: ChannelPromise,
        cause: Option<Arc<StrandError>>,
    ) {
        let cause = cause.unwrap_or_else(|| Arc::new(StrandError::closed()));
        self.internal_close(promise, cause, false);
    }

    /// 关闭算法。
    ///
    /// # 算法（How）
    /// 1. 一次性闸门：并发关闭只有首个调用真正执行，其余挂到既有关闭 Future 上。
    /// 2. 记录初始关闭原因；出站缓冲立即脱离——此后写入快速失败。
    /// 3. 传输要求阻塞式关闭时，真正的 `do_close` 调度到其专用执行器；否则就地执行。
    /// 4. 缓冲中的全部写入以同一原因失败；随后在所属执行器上异步广播
    ///    `channel_inactive`（仅当从活跃转为非活跃）并解除注册——绝不在调用线程上
    ///    直接展开，以保持与在途事件的顺序关系。
    pub(crate) fn internal_close(
        self: &Arc<Self>,
        promise: ChannelPromise,
        cause: Arc<StrandError>,
        notify_writability: bool,
    ) {
        if !promise.set_uncancellable() {
            return;
        }
        if self.close_initiated.swap(true, Ordering::AcqRel) {
            // 关闭已在途：本次调用只等待同一结果。
            if self.close_promise.is_done() {
                promise.try_success();
            } else if !promise.is_void() {
                let pending = promise.clone();
                self.close_future().add_listener(move |_| {
                    pending.try_success();
                });
            }
            return;
        }
        *self.initial_close_cause.lock() = Some(Arc::clone(&cause));
        let was_active = self.is_active();
        self.outbound.detach();
        match self.transport().prepare_to_close() {
            Some(close_executor) => {
                let channel = Arc::clone(self);
                close_executor.execute(Box::new(move || {
                    channel.do_close_transport(&promise);
                    let back = Arc::clone(&channel);
                    channel.invoke_later(Box::new(move || {
                        back.settle_outbound_after_close(&cause, notify_writability);
                        back.fire_inactive_and_deregister(was_active);
                    }));
                }));
            }
            None => {
                self.do_close_transport(&promise);
                self.settle_outbound_after_close(&cause, notify_writability);
                self.fire_inactive_and_deregister(was_active);
            }
        }
    }

    fn do_close_transport(&self, promise: &ChannelPromise) {
        let result = self.transport().do_close();
        self.invalidate_addr_cache();
        self.close_promise.try_success();
        match result {
            Ok(()) => {
                promise.try_success();
            }
            Err(err) => {
                promise.try_failure(err);
            }
        }
    }

    fn settle_outbound_after_close(&self, cause: &Arc<StrandError>, notify: bool) {
        self.outbound.fail_flushed(cause, notify);
        self.outbound.close(Arc::clone(cause), false);
    }

    fn fire_inactive_and_deregister(self: &Arc<Self>, was_active: bool) {
        self.deregister_inner(self.void_promise(), was_active && !self.is_active());
    }

    /// 任意线程白名单操作：立即关闭传输，不经流水线。
    pub fn close_forcibly(&self) {
        if let Err(err) = self.transport().do_close() {
            self.logger
                .warn(&format!("failed to close the transport forcibly: {err}"));
        }
    }

    /// 已因其它路径进入关闭态时的补偿：让关闭事件链继续走完。
    fn close_if_closed(self: &Arc<Self>) {
        if !self.is_open() {
            self.internal_close_with(self.void_promise(), None);
        }
    }

    // ---- 解除注册 ----

    pub(crate) fn internal_deregister(
        self: &Arc<Self>,
        promise: ChannelPromise,
        fire_inactive: bool,
    ) {
        self.deregister_inner(promise, fire_inactive);
    }

    fn deregister_inner(self: &Arc<Self>, promise: ChannelPromise, fire_inactive: bool) {
        if !promise.set_uncancellable() {
            return;
        }
        if !self.is_registered() {
            promise.try_success();
            return;
        }
        // 解除注册必须延后到独立任务：正在派发中的事件可能仍依赖当前执行器绑定，
        // 重入式拆线会破坏单通道顺序保证。
        let channel = Arc::clone(self);
        self.invoke_later(Box::new(move || {
            if let Err(err) = channel.transport().do_deregister() {
                channel
                    .logger
                    .error("transport deregistration failed", Some(&err));
            }
            channel.invalidate_addr_cache();
            if fire_inactive {
                channel.pipeline.fire_channel_inactive();
            }
            if channel.registered.swap(false, Ordering::AcqRel) {
                channel.pipeline.fire_channel_unregistered();
            }
            promise.try_success();
        }));
    }

    // ---- 读写 ----

    pub(crate) fn internal_begin_read(self: &Arc<Self>) {
        if !self.is_active() {
            return;
        }
        if let Err(err) = self.transport().do_begin_read() {
            let channel = Arc::clone(self);
            let cause = Arc::new(err);
            self.invoke_later(Box::new(move || {
                channel.pipeline.fire_exception_caught(Arc::clone(&cause));
                let _ = channel.close();
            }));
        }
    }

    pub(crate) fn internal_write(&self, msg: PipelineMessage, promise: ChannelPromise) {
        let size = msg.size_estimate();
        self.outbound.add_message(msg, size, promise);
    }

    pub(crate) fn internal_flush(self: &Arc<Self>) {
        self.outbound.add_flush();
        self.flush0();
    }

    fn flush0(self: &Arc<Self>) {
        // 写出循环不可重入：完成回调若再次触发 flush，由本轮循环继续消化。
        if self.in_flush.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.outbound.flushed_count() == 0 {
            self.in_flush.store(false, Ordering::Release);
            return;
        }
        if !self.is_active() {
            // 连接不可用：打开但未连接 → 可恢复错误并通知可写性；已关闭 → 终态错误。
            if self.is_open() {
                let cause = Arc::new(StrandError::new(
                    codes::CHANNEL_NOT_CONNECTED,
                    "flush attempted while channel is not connected",
                ));
                self.outbound.fail_flushed(&cause, true);
            } else {
                let cause = self
                    .initial_close_cause()
                    .unwrap_or_else(|| Arc::new(StrandError::closed()));
                self.outbound.fail_flushed(&cause, false);
            }
            self.in_flush.store(false, Ordering::Release);
            return;
        }
        let result = self.transport().do_write(&self.outbound);
        self.in_flush.store(false, Ordering::Release);
        if let Err(err) = result {
            self.handle_write_error(err);
        }
    }

    /// 写出错误升级策略。
    ///
    /// IO 类故障且开启 `auto_close` 时关闭整个通道：任由通道在 IO 已坏的情况下
    /// 继续报告“活跃/可写”是更大的错误。否则仅半关输出侧。
    fn handle_write_error(self: &Arc<Self>, err: StrandError) {
        let cause = Arc::new(err);
        if cause.is_io() && self.options.auto_close() {
            self.internal_close(self.void_promise(), cause, false);
        } else {
            self.shutdown_output(cause);
        }
    }

    /// 半关输出侧：在途写入以半关原因失败，读方向保持可用。
    fn shutdown_output(self: &Arc<Self>, cause: Arc<StrandError>) {
        self.outbound.detach();
        if let Err(err) = self.transport().do_shutdown_output() {
            self.logger
                .error("failed to shut down the channel output", Some(&err));
            self.internal_close(self.void_promise(), cause, false);
            return;
        }
        let shutdown_cause = Arc::new(StrandError::new(
            codes::CHANNEL_OUTPUT_SHUTDOWN,
            format!("channel output shut down: {cause}"),
        ));
        self.outbound.fail_flushed(&shutdown_cause, false);
        self.outbound.close(shutdown_cause, true);
        self.pipeline.fire_user_event(UserEvent::OutputShutdown);
    }

    fn invalidate_addr_cache(&self) {
        *self.local_cache.lock() = None;
        *self.remote_cache.lock() = None;
    }
}
