//! 通道生命周期契约测试：注册、关闭竞态、写错误升级与资源归还。

use std::sync::{Arc, Mutex};

use strand_core::{
    Channel, ChannelOptions, EventExecutor, HandlerContext, HeapBuf, InboundHandler, Outcome,
    PipelineMessage, SharedBuf, StrandError, UserEvent, inbound_handler,
    pipeline::ChannelHandler,
    test_stubs::{ManualExecutor, MockTransport, NoopLogger},
};

struct Fixture {
    channel: Arc<Channel>,
    transport: Arc<MockTransport>,
    executor: Arc<ManualExecutor>,
}

fn fixture(options: ChannelOptions) -> Fixture {
    let transport = MockTransport::new();
    let channel = Channel::new(
        Box::new(Arc::clone(&transport)),
        options,
        Arc::new(NoopLogger),
    );
    let executor = ManualExecutor::new();
    Fixture {
        channel,
        transport,
        executor,
    }
}

impl Fixture {
    fn dyn_executor(&self) -> Arc<dyn EventExecutor> {
        let executor: Arc<dyn EventExecutor> = self.executor.clone();
        executor
    }
}

/// 记录生命周期事件序列的 Handler。
struct EventLog {
    events: Arc<Mutex<Vec<String>>>,
}

impl ChannelHandler for EventLog {}

impl InboundHandler for EventLog {
    fn channel_registered(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        self.events.lock().unwrap().push("registered".into());
        ctx.fire_channel_registered();
        Ok(())
    }

    fn channel_unregistered(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        self.events.lock().unwrap().push("unregistered".into());
        ctx.fire_channel_unregistered();
        Ok(())
    }

    fn channel_active(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        self.events.lock().unwrap().push("active".into());
        ctx.fire_channel_active();
        Ok(())
    }

    fn channel_inactive(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        self.events.lock().unwrap().push("inactive".into());
        ctx.fire_channel_inactive();
        Ok(())
    }

    fn user_event(
        &self,
        ctx: &Arc<HandlerContext>,
        event: UserEvent,
    ) -> Result<(), StrandError> {
        if matches!(event, UserEvent::OutputShutdown) {
            self.events.lock().unwrap().push("output-shutdown".into());
        }
        ctx.fire_user_event(event);
        Ok(())
    }
}

fn with_event_log(fx: &Fixture) -> Arc<Mutex<Vec<String>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    fx.channel
        .pipeline()
        .add_last(
            "event-log",
            inbound_handler(EventLog {
                events: Arc::clone(&events),
            }),
        )
        .expect("event log added");
    events
}

/// 首次注册：钩子调用、事件顺序与激活广播。
#[test]
fn first_registration_fires_active_once() {
    let fx = fixture(ChannelOptions::default());
    let events = with_event_log(&fx);
    fx.transport.set_active(true);

    let registered = fx.channel.register_future(fx.dyn_executor());
    assert!(!fx.channel.is_registered(), "注册步骤尚未在执行器上运行");
    fx.executor.run_pending();

    assert!(registered.is_success());
    assert!(fx.channel.is_registered());
    assert_eq!(fx.transport.calls().first(), Some(&"register"));
    assert_eq!(
        events.lock().unwrap().as_slice(),
        ["registered", "active"],
        "注册事件先于激活事件"
    );
}

/// 再注册不得重复广播激活，按配置恢复读意向。
#[test]
fn reregistration_resumes_read_without_active() {
    let fx = fixture(ChannelOptions::default());
    let events = with_event_log(&fx);
    fx.transport.set_active(true);

    let first = fx.channel.register_future(fx.dyn_executor());
    fx.executor.run_pending();
    assert!(first.is_success());

    let deregistered = fx.channel.deregister();
    fx.executor.run_pending();
    assert!(deregistered.is_success());
    assert!(!fx.channel.is_registered());

    let second_executor = ManualExecutor::new();
    let dyn_second: Arc<dyn EventExecutor> = second_executor.clone();
    let second = fx.channel.register_future(dyn_second);
    second_executor.run_pending();
    assert!(second.is_success(), "再注册应成功");

    let recorded = events.lock().unwrap().clone();
    let active_count = recorded.iter().filter(|e| e.as_str() == "active").count();
    assert_eq!(active_count, 1, "激活事件只在首次注册广播");
    let begin_reads = fx
        .transport
        .calls()
        .iter()
        .filter(|c| **c == "begin_read")
        .count();
    assert_eq!(begin_reads, 2, "auto-read 应在再注册后再次声明读意向");
}

/// 场景：注册提交后立即关闭——关闭成功，且 inactive/unregistered 恰好一对。
#[test]
fn close_racing_registration_fires_single_teardown_pair() {
    let fx = fixture(ChannelOptions::default());
    let events = with_event_log(&fx);
    fx.transport.set_active(true);

    let registered = fx.channel.register_future(fx.dyn_executor());
    let closed = fx.channel.close();
    // 注册任务与关闭任务按提交顺序在同一执行器上执行。
    fx.executor.run_pending();

    assert!(registered.is_success());
    assert!(closed.is_success(), "关闭必须成功");
    assert!(!fx.channel.is_open());

    let recorded = events.lock().unwrap().clone();
    let inactive = recorded.iter().filter(|e| e.as_str() == "inactive").count();
    let unregistered = recorded
        .iter()
        .filter(|e| e.as_str() == "unregistered")
        .count();
    assert_eq!((inactive, unregistered), (1, 1), "拆除事件恰好一对");
}

/// 并发关闭：后续调用等待同一结果，传输钩子只执行一次。
#[test]
fn concurrent_close_joins_first_close() {
    let fx = fixture(ChannelOptions::default());
    fx.transport.set_active(true);
    let registered = fx.channel.register_future(fx.dyn_executor());
    fx.executor.run_pending();
    assert!(registered.is_success());

    let first = fx.channel.close();
    let second = fx.channel.close();
    fx.executor.run_pending();

    assert!(first.is_success());
    assert!(second.is_success());
    let close_calls = fx
        .transport
        .calls()
        .iter()
        .filter(|c| **c == "close")
        .count();
    assert_eq!(close_calls, 1, "传输关闭钩子只执行一次");
}

/// 关闭后的写入立即以关闭原因失败，消息被释放，绝不阻塞。
#[test]
fn write_after_close_fails_fast_and_releases() {
    let fx = fixture(ChannelOptions::default());
    fx.transport.set_active(true);
    let registered = fx.channel.register_future(fx.dyn_executor());
    fx.executor.run_pending();
    assert!(registered.is_success());

    let closed = fx.channel.close();
    fx.executor.run_pending();
    assert!(closed.is_success());

    let buf = HeapBuf::new(vec![0u8; 8]);
    let probe = buf.clone_retained();
    let write = fx
        .channel
        .write(PipelineMessage::from_buffer(Box::new(buf)));
    fx.executor.run_pending();

    match write.outcome() {
        Some(Outcome::Failed(err)) => assert_eq!(err.code(), "channel.closed"),
        other => panic!("意外终态: {other:?}"),
    }
    assert_eq!(probe.ref_count(), 1, "被拒绝的消息必须立即释放");
}

/// P5：成功写出路径上消息恰好释放一次。
#[test]
fn successful_write_releases_message_once() {
    let fx = fixture(ChannelOptions::default());
    fx.transport.set_active(true);
    let registered = fx.channel.register_future(fx.dyn_executor());
    fx.executor.run_pending();
    assert!(registered.is_success());

    let buf = HeapBuf::new(vec![0u8; 16]);
    let probe = buf.clone_retained();
    assert_eq!(probe.ref_count(), 2);
    let write = fx
        .channel
        .write_and_flush(PipelineMessage::from_buffer(Box::new(buf)));
    fx.executor.run_pending();

    assert!(write.is_success(), "MockTransport 应整条取走消息");
    assert_eq!(probe.ref_count(), 1, "引用计数应回到基线");
    assert_eq!(fx.channel.outbound().total_pending_bytes(), 0);
}

/// IO 写错误且开启 auto-close：通道整体关闭，缓冲写入以同一原因失败。
#[test]
fn io_write_error_escalates_to_close() {
    let fx = fixture(ChannelOptions::default());
    fx.transport.set_active(true);
    let registered = fx.channel.register_future(fx.dyn_executor());
    fx.executor.run_pending();
    assert!(registered.is_success());

    fx.transport
        .fail_next_write(StrandError::io("simulated connection reset"));
    let first = fx.channel.write(PipelineMessage::from_buffer(HeapBuf::boxed(vec![1u8; 4])));
    let second = fx.channel.write(PipelineMessage::from_buffer(HeapBuf::boxed(vec![2u8; 4])));
    fx.channel.flush();
    fx.executor.run_pending();

    assert!(!fx.channel.is_open(), "IO 故障应升级为整通道关闭");
    for (tag, future) in [("first", first), ("second", second)] {
        match future.outcome() {
            Some(Outcome::Failed(err)) => {
                assert_eq!(err.code(), "transport.io", "{tag} 应以 IO 原因失败")
            }
            other => panic!("{tag} 意外终态: {other:?}"),
        }
    }
}

/// 关闭 auto-close 后，IO 写错误仅半关输出侧：通道保持打开并广播半关事件。
#[test]
fn io_write_error_without_auto_close_shuts_output() {
    let fx = fixture(ChannelOptions::default().with_auto_close(false));
    let events = with_event_log(&fx);
    fx.transport.set_active(true);
    let registered = fx.channel.register_future(fx.dyn_executor());
    fx.executor.run_pending();
    assert!(registered.is_success());

    fx.transport
        .fail_next_write(StrandError::io("simulated partial failure"));
    let write = fx.channel.write(PipelineMessage::from_buffer(HeapBuf::boxed(vec![1u8; 4])));
    fx.channel.flush();
    fx.executor.run_pending();

    assert!(fx.channel.is_open(), "半关输出不得关闭整个通道");
    assert!(!fx.channel.is_writable(), "输出侧半关后不可写");
    match write.outcome() {
        Some(Outcome::Failed(err)) => assert_eq!(err.code(), "channel.output_shutdown"),
        other => panic!("意外终态: {other:?}"),
    }
    assert!(
        events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e == "output-shutdown"),
        "应广播输出半关事件"
    );
}

/// 重复注册与执行器不兼容都只以 Promise 失败报告。
#[test]
fn registration_failures_flow_through_promises() {
    let fx = fixture(ChannelOptions::default());
    let registered = fx.channel.register_future(fx.dyn_executor());
    fx.executor.run_pending();
    assert!(registered.is_success());

    let again = fx.channel.register_future(fx.dyn_executor());
    fx.executor.run_pending();
    match again.outcome() {
        Some(Outcome::Failed(err)) => {
            assert_eq!(err.code(), "channel.already_registered")
        }
        other => panic!("意外终态: {other:?}"),
    }
}

/// 注册钩子失败：通道被强制关闭，注册 Promise 携带原因。
#[test]
fn failed_do_register_force_closes() {
    let fx = fixture(ChannelOptions::default());
    fx.transport
        .fail_next_register(StrandError::io("registration rejected"));
    let registered = fx.channel.register_future(fx.dyn_executor());
    fx.executor.run_pending();

    match registered.outcome() {
        Some(Outcome::Failed(err)) => assert_eq!(err.code(), "transport.io"),
        other => panic!("意外终态: {other:?}"),
    }
    assert!(!fx.channel.is_open(), "注册失败应强制关闭传输");
    assert!(fx.channel.close_future().is_done());
}
