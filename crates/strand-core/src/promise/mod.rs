//! 单赋值异步结果容器。
//!
//! # 模块定位（Why）
//! - 通道的注册、绑定、写入、关闭全部以异步方式完成，结果只能经由 Promise 传递；
//!   同步抛错仅保留给编程错误（严格双重完成、事件线程上的阻塞等待）。
//! - 对齐 Netty `ChannelPromise`、futures `oneshot` 的公共语义，并额外提供
//!   “不可取消栅栏”与 void 变体，服务出站缓冲的取消竞态处理与免分配写路径。
//!
//! # 设计总览（How）
//! - [`ChannelPromise`] 是写端：严格 `set_*` 与幂等 `try_*` 两组完成入口，
//!   加上 `cancel` / `set_uncancellable` 这对取消栅栏。
//! - [`ChannelFuture`] 是读端：监听器按注册顺序收到恰好一次通知，完成后注册的
//!   监听器在注册现场同步执行；同时实现 [`core::future::Future`] 以支持 `.await`。
//! - void 变体不支持监听器与等待，失败时将原因重新注入所属通道的异常捕获事件，
//!   通道未注册时退化为记录一次日志。
//!
//! # 并发契约（What）
//! - 终态唯一：`{成功, 失败, 取消}` 互斥且不可再转移。
//! - 从 Promise 所属执行器的事件线程发起阻塞等待属于自锁编程错误，立即 panic 而非悬挂。

use alloc::{boxed::Box, sync::Arc, sync::Weak, vec::Vec};
use core::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};

use spin::{Mutex, RwLock};

use crate::{
    channel::Channel,
    error::{StrandError, codes},
    executor::EventExecutor,
};

/// Promise 的终态。
#[derive(Clone, Debug)]
pub enum Outcome {
    /// 操作成功。
    Success,
    /// 操作失败，原因以共享指针承载以便批量失败路径复用同一错误。
    Failed(Arc<StrandError>),
    /// 操作在完成前被取消。
    Cancelled,
}

impl Outcome {
    /// 是否为成功终态。
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// 是否为取消终态。
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    /// 转换为 `Result` 形式，取消映射为 [`codes::PROMISE_CANCELLED`]。
    pub fn into_result(self) -> Result<(), Arc<StrandError>> {
        match self {
            Outcome::Success => Ok(()),
            Outcome::Failed(err) => Err(err),
            Outcome::Cancelled => Err(Arc::new(StrandError::new(
                codes::PROMISE_CANCELLED,
                "operation cancelled",
            ))),
        }
    }
}

/// 完成监听器：一次性闭包，收到终态引用。
pub type FutureListener = Box<dyn FnOnce(&Outcome) + Send + 'static>;

/// 未完成 Promise 携带的观察者集合。
struct PendingSet {
    listeners: Vec<FutureListener>,
    wakers: Vec<Waker>,
    #[cfg(feature = "std")]
    waiters: Vec<std::thread::Thread>,
    uncancellable: bool,
}

impl PendingSet {
    fn new() -> Self {
        Self {
            listeners: Vec::new(),
            wakers: Vec::new(),
            #[cfg(feature = "std")]
            waiters: Vec::new(),
            uncancellable: false,
        }
    }

    /// 按注册顺序通知监听器，再唤醒异步与阻塞等待者。
    fn notify(self, outcome: &Outcome) {
        for listener in self.listeners {
            listener(outcome);
        }
        for waker in self.wakers {
            waker.wake();
        }
        #[cfg(feature = "std")]
        for waiter in self.waiters {
            waiter.unpark();
        }
    }
}

enum State {
    Pending(PendingSet),
    Done(Outcome),
}

impl State {
    fn pending() -> Self {
        State::Pending(PendingSet::new())
    }
}

struct Shared {
    state: Mutex<State>,
    // 所属执行器探针：仅用于阻塞等待的自锁检查，不参与调度。
    executor: RwLock<Option<Arc<dyn EventExecutor>>>,
}

impl Shared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::pending()),
            executor: RwLock::new(None),
        })
    }

    /// 尝试迁移至终态；返回 `false` 表示已处于终态。
    ///
    /// 监听器、waker 与阻塞等待者全部在释放内部锁之后通知，
    /// 避免监听器回调重入 Promise 导致自旋锁死锁。
    fn complete(&self, outcome: Outcome) -> bool {
        let mut guard = self.state.lock();
        match &mut *guard {
            State::Done(_) => false,
            state @ State::Pending(_) => {
                let previous = core::mem::replace(state, State::Done(outcome.clone()));
                drop(guard);
                if let State::Pending(pending) = previous {
                    pending.notify(&outcome);
                }
                true
            }
        }
    }

    /// 取消路径：状态检查与终态迁移必须在同一次加锁内完成，
    /// 否则 `set_uncancellable` 可能在检查与迁移之间插入。
    fn try_cancel(&self) -> bool {
        let mut guard = self.state.lock();
        match &mut *guard {
            State::Pending(pending) if !pending.uncancellable => {
                let outcome = Outcome::Cancelled;
                let previous = core::mem::replace(&mut *guard, State::Done(outcome.clone()));
                drop(guard);
                if let State::Pending(pending) = previous {
                    pending.notify(&outcome);
                }
                true
            }
            _ => false,
        }
    }

    fn outcome(&self) -> Option<Outcome> {
        match &*self.state.lock() {
            State::Done(outcome) => Some(outcome.clone()),
            State::Pending(_) => None,
        }
    }

    fn add_listener(&self, listener: FutureListener) {
        let mut guard = self.state.lock();
        match &mut *guard {
            State::Pending(pending) => pending.listeners.push(listener),
            State::Done(outcome) => {
                let outcome = outcome.clone();
                drop(guard);
                listener(&outcome);
            }
        }
    }
}

enum Inner {
    Regular(Arc<Shared>),
    Void(Weak<Channel>),
}

/// `ChannelPromise` 是一次异步操作结果的写端。
///
/// # 契约说明（What）
/// - `set_success` / `set_failure`：严格完成入口，对已终态的 Promise 再次调用视为
///   编程错误并 panic（错误码 [`codes::PROMISE_ALREADY_COMPLETE`]）。
/// - `try_success` / `try_failure`：幂等入口，已终态时返回 `false` 并丢弃本次结果。
/// - `cancel`：仅在尚未进入“不可取消”状态时生效。
/// - `set_uncancellable`：进入处理阶段前的栅栏；返回 `false` 表示 Promise
///   已被并发取消，调用方应将其视为已取消条目处理。
///
/// # 线程安全
/// - 可跨线程克隆与完成；监听器按注册顺序恰好收到一次通知。
pub struct ChannelPromise {
    inner: Inner,
}

impl ChannelPromise {
    /// 构造常规 Promise。
    pub fn new() -> Self {
        Self {
            inner: Inner::Regular(Shared::new()),
        }
    }

    /// 构造 void Promise：不支持监听器，失败时回注所属通道的异常捕获事件。
    pub fn new_void(channel: Weak<Channel>) -> Self {
        Self {
            inner: Inner::Void(channel),
        }
    }

    /// 是否为 void 变体。
    pub fn is_void(&self) -> bool {
        matches!(self.inner, Inner::Void(_))
    }

    /// 绑定所属执行器探针，用于阻塞等待的自锁检查。
    pub(crate) fn attach_executor(&self, executor: Arc<dyn EventExecutor>) {
        if let Inner::Regular(shared) = &self.inner {
            *shared.executor.write() = Some(executor);
        }
    }

    /// 获取读端。对 void Promise 调用属于编程错误。
    pub fn future(&self) -> ChannelFuture {
        match &self.inner {
            Inner::Regular(shared) => ChannelFuture {
                shared: Arc::clone(shared),
            },
            Inner::Void(_) => panic!("void promise does not support futures"),
        }
    }

    /// 严格成功完成。
    pub fn set_success(&self) {
        if !self.try_success() {
            panic!("{}: promise completed twice", codes::PROMISE_ALREADY_COMPLETE);
        }
    }

    /// 幂等成功完成。
    pub fn try_success(&self) -> bool {
        match &self.inner {
            Inner::Regular(shared) => shared.complete(Outcome::Success),
            Inner::Void(_) => true,
        }
    }

    /// 严格失败完成。
    pub fn set_failure(&self, cause: StrandError) {
        if !self.try_failure(cause) {
            panic!("{}: promise completed twice", codes::PROMISE_ALREADY_COMPLETE);
        }
    }

    /// 幂等失败完成。
    pub fn try_failure(&self, cause: StrandError) -> bool {
        self.try_failure_shared(Arc::new(cause))
    }

    /// 幂等失败完成（共享原因），批量失败路径以此复用同一错误对象。
    pub fn try_failure_shared(&self, cause: Arc<StrandError>) -> bool {
        match &self.inner {
            Inner::Regular(shared) => shared.complete(Outcome::Failed(cause)),
            Inner::Void(channel) => {
                Self::notify_void_failure(channel, cause);
                true
            }
        }
    }

    /// 尝试取消；仅在仍可取消时成功。
    pub fn cancel(&self) -> bool {
        match &self.inner {
            Inner::Regular(shared) => shared.try_cancel(),
            Inner::Void(_) => false,
        }
    }

    /// 进入“不可取消”状态。
    ///
    /// # 返回契约
    /// - `true`：已锁定（或已以非取消方式完成），调用方可以继续处理；
    /// - `false`：Promise 已被并发取消，调用方必须按取消路径释放资源。
    pub fn set_uncancellable(&self) -> bool {
        match &self.inner {
            Inner::Regular(shared) => {
                let mut guard = shared.state.lock();
                match &mut *guard {
                    State::Pending(pending) => {
                        pending.uncancellable = true;
                        true
                    }
                    State::Done(outcome) => !outcome.is_cancelled(),
                }
            }
            Inner::Void(_) => true,
        }
    }

    /// 是否已进入终态。
    pub fn is_done(&self) -> bool {
        match &self.inner {
            Inner::Regular(shared) => shared.outcome().is_some(),
            Inner::Void(_) => false,
        }
    }

    /// 是否以取消终结。
    pub fn is_cancelled(&self) -> bool {
        match &self.inner {
            Inner::Regular(shared) => shared
                .outcome()
                .map(|outcome| outcome.is_cancelled())
                .unwrap_or(false),
            Inner::Void(_) => false,
        }
    }

    /// void 失败的回注路径：通道仍注册时转为异常捕获事件，否则记录一次日志。
    fn notify_void_failure(channel: &Weak<Channel>, cause: Arc<StrandError>) {
        if let Some(channel) = channel.upgrade() {
            if channel.is_registered() {
                channel.pipeline().fire_exception_caught(cause);
            } else {
                channel.logger().warn(
                    "void promise failed on unregistered channel; cause discarded after logging",
                );
            }
        }
    }
}

impl Default for ChannelPromise {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for ChannelPromise {
    fn clone(&self) -> Self {
        match &self.inner {
            Inner::Regular(shared) => Self {
                inner: Inner::Regular(Arc::clone(shared)),
            },
            Inner::Void(channel) => Self {
                inner: Inner::Void(channel.clone()),
            },
        }
    }
}

impl fmt::Debug for ChannelPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Inner::Regular(shared) => f
                .debug_struct("ChannelPromise")
                .field("done", &shared.outcome().is_some())
                .finish(),
            Inner::Void(_) => f.debug_struct("ChannelPromise").field("void", &true).finish(),
        }
    }
}

/// `ChannelFuture` 是一次异步操作结果的读端。
///
/// # 契约说明（What）
/// - `add_listener`：完成前注册的监听器在完成时按注册顺序执行；完成后注册的监听器
///   在注册现场同步执行。
/// - 实现 [`core::future::Future`]，`Output = Outcome`，可直接 `.await`。
/// - `await_outcome` / `sync`（需 `std`）：阻塞等待；从所属执行器的事件线程调用
///   属于自锁编程错误，立即 panic。
#[derive(Clone)]
pub struct ChannelFuture {
    shared: Arc<Shared>,
}

impl ChannelFuture {
    /// 是否已完成。
    pub fn is_done(&self) -> bool {
        self.shared.outcome().is_some()
    }

    /// 读取终态快照；未完成时返回 `None`。
    pub fn outcome(&self) -> Option<Outcome> {
        self.shared.outcome()
    }

    /// 是否成功完成。
    pub fn is_success(&self) -> bool {
        self.shared
            .outcome()
            .map(|outcome| outcome.is_success())
            .unwrap_or(false)
    }

    /// 注册完成监听器。
    pub fn add_listener(&self, listener: impl FnOnce(&Outcome) + Send + 'static) {
        self.shared.add_listener(Box::new(listener));
    }

    /// 阻塞等待终态。
    ///
    /// # Panics
    /// 在所属执行器的事件线程上调用会 panic：该线程负责完成本 Promise，
    /// 阻塞等待必然自锁。
    #[cfg(feature = "std")]
    pub fn await_outcome(&self) -> Outcome {
        if let Some(outcome) = self.shared.outcome() {
            return outcome;
        }
        if let Some(executor) = self.shared.executor.read().as_ref()
            && executor.in_event_loop()
        {
            panic!("blocking await from the promise's own event loop would deadlock");
        }
        loop {
            {
                let mut guard = self.shared.state.lock();
                match &mut *guard {
                    State::Done(outcome) => return outcome.clone(),
                    State::Pending(pending) => {
                        pending.waiters.push(std::thread::current());
                    }
                }
            }
            std::thread::park();
        }
    }

    /// 阻塞等待并转换为 `Result`。
    #[cfg(feature = "std")]
    pub fn sync(&self) -> Result<(), Arc<StrandError>> {
        self.await_outcome().into_result()
    }
}

impl Future for ChannelFuture {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut guard = self.shared.state.lock();
        match &mut *guard {
            State::Done(outcome) => Poll::Ready(outcome.clone()),
            State::Pending(pending) => {
                if !pending
                    .wakers
                    .iter()
                    .any(|waker| waker.will_wake(cx.waker()))
                {
                    pending.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

impl fmt::Debug for ChannelFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelFuture")
            .field("outcome", &self.shared.outcome())
            .finish()
    }
}
