//! Promise/Future 契约测试：终态唯一、监听器恰好一次、取消栅栏与阻塞等待防护。

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use strand_core::{
    Channel, ChannelOptions, ChannelPromise, EventExecutor, HandlerContext, InboundHandler,
    Outcome, StrandError, inbound_handler,
    pipeline::ChannelHandler,
    test_stubs::{ImmediateExecutor, ManualExecutor, MockTransport, NoopLogger, RecordingLogger},
};

/// 验证恰好一次完成：成功后任何再完成尝试都幂等失败，监听器只收到一次通知。
#[test]
fn completes_exactly_once() {
    let promise = ChannelPromise::new();
    let future = promise.future();
    let notified = Arc::new(AtomicUsize::new(0));
    {
        let notified = Arc::clone(&notified);
        future.add_listener(move |outcome| {
            assert!(outcome.is_success());
            notified.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert!(promise.try_success());
    assert!(!promise.try_success(), "重复成功必须被拒绝");
    assert!(
        !promise.try_failure(StrandError::closed()),
        "成功后的失败尝试必须被拒绝"
    );
    assert!(!promise.cancel(), "终态后不可取消");
    assert_eq!(notified.load(Ordering::SeqCst), 1, "监听器恰好收到一次通知");
}

#[test]
#[should_panic(expected = "promise.already_complete")]
fn strict_completion_after_terminal_state_panics() {
    let promise = ChannelPromise::new();
    promise.set_success();
    promise.set_failure(StrandError::closed());
}

/// 完成前注册的监听器按注册顺序执行，完成后注册的同步执行。
#[test]
fn listener_order_is_registration_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let promise = ChannelPromise::new();
    let future = promise.future();
    for tag in ["a", "b", "c"] {
        let order = Arc::clone(&order);
        future.add_listener(move |_| order.lock().unwrap().push(tag));
    }
    promise.set_success();
    {
        let order = Arc::clone(&order);
        future.add_listener(move |_| order.lock().unwrap().push("late"));
    }
    assert_eq!(order.lock().unwrap().as_slice(), ["a", "b", "c", "late"]);
}

/// 取消只在“不可取消”栅栏之前生效。
#[test]
fn cancellation_gate() {
    let promise = ChannelPromise::new();
    assert!(promise.set_uncancellable());
    assert!(!promise.cancel());
    assert!(!promise.is_cancelled());

    let cancelled = ChannelPromise::new();
    assert!(cancelled.cancel());
    assert!(cancelled.is_cancelled());
    assert!(
        !cancelled.set_uncancellable(),
        "已取消的 Promise 必须让锁定方进入取消路径"
    );
}

/// `ChannelFuture` 可作为标准 Future 等待。
#[test]
fn future_is_awaitable() {
    let promise = ChannelPromise::new();
    let future = promise.future();
    let handle = std::thread::spawn(move || futures::executor::block_on(future));
    promise.set_success();
    let outcome = handle.join().expect("await thread");
    assert!(outcome.is_success());
}

/// 阻塞等待从其它线程发起时正常返回。
#[test]
fn await_outcome_from_foreign_thread() {
    let promise = ChannelPromise::new();
    let future = promise.future();
    let waiter = std::thread::spawn(move || future.await_outcome());
    std::thread::sleep(std::time::Duration::from_millis(20));
    promise.try_failure(StrandError::closed());
    match waiter.join().expect("waiter thread") {
        Outcome::Failed(err) => assert_eq!(err.code(), "channel.closed"),
        other => panic!("意外终态: {other:?}"),
    }
}

/// 在所属执行器线程上阻塞等待未完成的 Promise 属于自锁编程错误。
#[test]
#[should_panic(expected = "deadlock")]
fn await_on_owning_executor_fails_fast() {
    let transport = MockTransport::new();
    let channel = Channel::new(
        Box::new(Arc::clone(&transport)),
        ChannelOptions::default(),
        Arc::new(NoopLogger),
    );
    let executor: Arc<dyn EventExecutor> = Arc::new(ImmediateExecutor);
    let registered = channel.register_future(executor);
    assert!(registered.is_success());
    // ImmediateExecutor 恒处于事件线程内：等待尚未完成的 Promise 即自锁。
    let pending = channel.new_promise();
    let _ = pending.future().await_outcome();
}

struct ExceptionRecorder {
    seen: Arc<Mutex<Vec<String>>>,
}

impl ChannelHandler for ExceptionRecorder {}

impl InboundHandler for ExceptionRecorder {
    fn exception_caught(
        &self,
        _ctx: &Arc<HandlerContext>,
        cause: Arc<StrandError>,
    ) -> Result<(), StrandError> {
        self.seen.lock().unwrap().push(cause.code().to_string());
        Ok(())
    }
}

/// void Promise 的失败在通道已注册时回注为异常捕获事件。
#[test]
fn void_failure_reaches_pipeline_when_registered() {
    let transport = MockTransport::new();
    let channel = Channel::new(
        Box::new(Arc::clone(&transport)),
        ChannelOptions::default(),
        Arc::new(NoopLogger),
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    channel
        .pipeline()
        .add_last(
            "exception-recorder",
            inbound_handler(ExceptionRecorder {
                seen: Arc::clone(&seen),
            }),
        )
        .expect("handler added");

    let executor = ManualExecutor::new();
    let dyn_executor: Arc<dyn EventExecutor> = executor.clone();
    let registered = channel.register_future(dyn_executor);
    executor.run_pending();
    assert!(registered.is_success(), "注册应成功");

    channel
        .void_promise()
        .try_failure(StrandError::new("transport.io", "simulated"));
    executor.run_pending();
    assert_eq!(
        seen.lock().unwrap().as_slice(),
        ["transport.io"],
        "失败原因应以异常捕获事件抵达 Handler"
    );
}

/// 未注册通道上的 void 失败退化为一次日志，不得静默丢弃。
#[test]
fn void_failure_on_unregistered_channel_is_logged() {
    let transport = MockTransport::new();
    let logger = RecordingLogger::new();
    let dyn_logger: Arc<dyn strand_core::Logger> = logger.clone();
    let channel = Channel::new(
        Box::new(Arc::clone(&transport)),
        ChannelOptions::default(),
        dyn_logger,
    );
    channel
        .void_promise()
        .try_failure(StrandError::new("transport.io", "simulated"));
    let records = logger.records();
    assert_eq!(records.len(), 1, "应恰好记录一次: {records:?}");
    assert!(records[0].starts_with("WARN"));
}
