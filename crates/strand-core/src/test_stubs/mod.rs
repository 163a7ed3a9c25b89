//! 测试桩命名空间，集中暴露框架官方维护的 `Noop`/`Mock`/`Manual` 实现，
//! 供集成测试与示例复用。
//!
//! # 设计背景（Why）
//! - 统一维护常见桩对象，避免在各处重复定义零尺寸结构体；
//! - 当核心契约演进时，通过单点更新保证所有测试同步适配。
//!
//! # 使用方式（How）
//! - 通过 `use strand_core::test_stubs::*;` 引入需要的桩类型；
//! - [`ManualExecutor`] 依赖线程标识，仅在 `std` 构建下可用；其余桩对象在
//!   `no_std + alloc` 环境同样可用。

use alloc::{format, string::String, sync::Arc, vec::Vec};
use core::error::Error;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::{
    error::StrandError,
    executor::EventExecutor,
    observability::Logger,
    outbound::OutboundBuffer,
    transport::{Transport, TransportSocketAddr},
};

#[cfg(feature = "std")]
pub use manual_executor::ManualExecutor;

/// 丢弃全部输出的日志桩。
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn info(&self, _message: &str) {}

    fn warn(&self, _message: &str) {}

    fn error(&self, _message: &str, _cause: Option<&(dyn Error + 'static)>) {}
}

/// 录制全部输出的日志桩，断言日志契约时使用。
#[derive(Default)]
pub struct RecordingLogger {
    records: Mutex<Vec<String>>,
}

impl RecordingLogger {
    /// 构造空录制器。
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 返回已录制的日志行快照。
    pub fn records(&self) -> Vec<String> {
        self.records.lock().clone()
    }
}

impl Logger for RecordingLogger {
    fn info(&self, message: &str) {
        self.records.lock().push(format!("INFO {message}"));
    }

    fn warn(&self, message: &str) {
        self.records.lock().push(format!("WARN {message}"));
    }

    fn error(&self, message: &str, cause: Option<&(dyn Error + 'static)>) {
        let line = match cause {
            Some(cause) => format!("ERROR {message}: {cause}"),
            None => format!("ERROR {message}"),
        };
        self.records.lock().push(line);
    }
}

/// 同步内联执行器：`in_event_loop` 恒真，任务就地执行。
///
/// 适用于不关心线程亲和的单元测试；需要验证任务排队顺序时请使用
/// [`ManualExecutor`]。
pub struct ImmediateExecutor;

impl EventExecutor for ImmediateExecutor {
    fn execute(&self, task: crate::executor::Task) {
        task();
    }

    fn in_event_loop(&self) -> bool {
        true
    }
}

/// 可脚本化的传输桩：记录钩子调用序列，按需注入失败。
///
/// # 契约说明（What）
/// - `calls()` 返回钩子名称的调用顺序快照；
/// - `fail_next_*` 使对应钩子的下一次调用返回注入的错误；
/// - `do_write` 默认把已冲刷区全部按成功取走，模拟一次完整写出。
pub struct MockTransport {
    open: AtomicBool,
    active: AtomicBool,
    calls: Mutex<Vec<&'static str>>,
    fail_register: Mutex<Option<StrandError>>,
    fail_write: Mutex<Option<StrandError>>,
    local: Mutex<Option<TransportSocketAddr>>,
    remote: Mutex<Option<TransportSocketAddr>>,
}

impl MockTransport {
    /// 构造初始打开、未活跃的传输桩。
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            active: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            fail_register: Mutex::new(None),
            fail_write: Mutex::new(None),
            local: Mutex::new(None),
            remote: Mutex::new(None),
        })
    }

    /// 返回钩子调用顺序快照。
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    /// 直接调整活跃状态，模拟底层连接建立/断开。
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// 注入下一次 `do_register` 的失败。
    pub fn fail_next_register(&self, err: StrandError) {
        *self.fail_register.lock() = Some(err);
    }

    /// 注入下一次 `do_write` 的失败。
    pub fn fail_next_write(&self, err: StrandError) {
        *self.fail_write.lock() = Some(err);
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().push(call);
    }
}

impl Transport for Arc<MockTransport> {
    fn do_register(&self) -> Result<(), StrandError> {
        self.record("register");
        match self.fail_register.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn do_bind(&self, _addr: &TransportSocketAddr) -> Result<(), StrandError> {
        self.record("bind");
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    fn do_connect(
        &self,
        _remote: &TransportSocketAddr,
        _local: Option<&TransportSocketAddr>,
    ) -> Result<(), StrandError> {
        self.record("connect");
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    fn do_disconnect(&self) -> Result<(), StrandError> {
        self.record("disconnect");
        self.active.store(false, Ordering::Release);
        Ok(())
    }

    fn do_close(&self) -> Result<(), StrandError> {
        self.record("close");
        self.open.store(false, Ordering::Release);
        self.active.store(false, Ordering::Release);
        Ok(())
    }

    fn do_deregister(&self) -> Result<(), StrandError> {
        self.record("deregister");
        Ok(())
    }

    fn do_begin_read(&self) -> Result<(), StrandError> {
        self.record("begin_read");
        Ok(())
    }

    fn do_write(&self, buffer: &OutboundBuffer) -> Result<(), StrandError> {
        self.record("write");
        if let Some(err) = self.fail_write.lock().take() {
            return Err(err);
        }
        while buffer.remove() {}
        Ok(())
    }

    fn do_shutdown_output(&self) -> Result<(), StrandError> {
        self.record("shutdown_output");
        Ok(())
    }

    fn local_addr(&self) -> Option<TransportSocketAddr> {
        *self.local.lock()
    }

    fn remote_addr(&self) -> Option<TransportSocketAddr> {
        *self.remote.lock()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn is_compatible(&self, _executor: &dyn EventExecutor) -> bool {
        true
    }
}

#[cfg(feature = "std")]
mod manual_executor {
    use alloc::collections::VecDeque;
    use alloc::sync::Arc;
    use std::thread::ThreadId;

    use spin::Mutex;

    use crate::executor::{EventExecutor, Task};

    /// 手动泵执行器：任务入队后由测试线程显式排空。
    ///
    /// # 契约说明（What）
    /// - `execute` 严格 FIFO 入队；
    /// - `run_pending` 在调用线程上逐个执行任务，执行期间该线程被视为事件线程
    ///   （`in_event_loop` 返回 `true`），支持嵌套排空。
    pub struct ManualExecutor {
        queue: Mutex<VecDeque<Task>>,
        pump_thread: Mutex<Option<ThreadId>>,
    }

    impl ManualExecutor {
        /// 构造空队列执行器。
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                queue: Mutex::new(VecDeque::new()),
                pump_thread: Mutex::new(None),
            })
        }

        /// 排空当前队列（含执行期间新入队的任务），返回执行的任务数。
        pub fn run_pending(&self) -> usize {
            let mut executed = 0;
            loop {
                let Some(task) = self.queue.lock().pop_front() else {
                    break;
                };
                let prior = self
                    .pump_thread
                    .lock()
                    .replace(std::thread::current().id());
                task();
                *self.pump_thread.lock() = prior;
                executed += 1;
            }
            executed
        }

        /// 当前排队任务数。
        pub fn pending(&self) -> usize {
            self.queue.lock().len()
        }
    }

    impl EventExecutor for ManualExecutor {
        fn execute(&self, task: Task) {
            self.queue.lock().push_back(task);
        }

        fn in_event_loop(&self) -> bool {
            *self.pump_thread.lock() == Some(std::thread::current().id())
        }
    }
}
