//! 流水线契约测试：跨执行器顺序、异常重定向、运行期插拔与掩码跳过。

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use strand_core::{
    Channel, ChannelOptions, EventExecutor, ExecMask, HandlerContext, InboundHandler,
    PipelineMessage, StrandError, inbound_handler,
    pipeline::ChannelHandler,
    test_stubs::{ManualExecutor, MockTransport, NoopLogger},
};

struct Fixture {
    channel: Arc<Channel>,
    executor: Arc<ManualExecutor>,
}

fn fixture() -> Fixture {
    let transport = MockTransport::new();
    let channel = Channel::new(
        Box::new(Arc::clone(&transport)),
        ChannelOptions::default(),
        Arc::new(NoopLogger),
    );
    let executor = ManualExecutor::new();
    Fixture { channel, executor }
}

impl Fixture {
    fn register(&self) {
        let dyn_executor: Arc<dyn EventExecutor> = self.executor.clone();
        let registered = self.channel.register_future(dyn_executor);
        self.executor.run_pending();
        assert!(registered.is_success(), "注册应成功");
    }
}

fn user_msg(id: u32) -> PipelineMessage {
    PipelineMessage::from_user(id)
}

/// 把读到的消息记到共享日志里，然后继续向后转发。
struct Recorder {
    tag: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl ChannelHandler for Recorder {}

impl InboundHandler for Recorder {
    fn channel_read(
        &self,
        ctx: &Arc<HandlerContext>,
        msg: PipelineMessage,
    ) -> Result<(), StrandError> {
        let id = msg.downcast_user::<u32>().copied().unwrap_or_default();
        self.log.lock().unwrap().push(format!("{}:{id}", self.tag));
        ctx.fire_channel_read(msg);
        Ok(())
    }
}

/// P1：事件跨越多个执行器时，每个 Handler 仍按触发顺序观察全部事件。
#[test]
fn ordering_preserved_across_executor_hops() {
    let fx = fixture();
    let log = Arc::new(Mutex::new(Vec::new()));
    let second_executor = ManualExecutor::new();

    fx.channel
        .pipeline()
        .add_last(
            "first",
            inbound_handler(Recorder {
                tag: "a",
                log: Arc::clone(&log),
            }),
        )
        .expect("first added");
    let dyn_second: Arc<dyn EventExecutor> = second_executor.clone();
    fx.channel
        .pipeline()
        .add_last_on(
            dyn_second,
            "second",
            inbound_handler(Recorder {
                tag: "b",
                log: Arc::clone(&log),
            }),
        )
        .expect("second added");
    fx.register();
    second_executor.run_pending();

    for id in 1..=4u32 {
        fx.channel.pipeline().fire_channel_read(user_msg(id));
    }
    // 交替排空两个执行器，直到双方队列都静止。
    while fx.executor.run_pending() + second_executor.run_pending() > 0 {}

    let recorded = log.lock().unwrap().clone();
    let a: Vec<_> = recorded.iter().filter(|l| l.starts_with("a:")).collect();
    let b: Vec<_> = recorded.iter().filter(|l| l.starts_with("b:")).collect();
    assert_eq!(a, ["a:1", "a:2", "a:3", "a:4"], "上游按触发顺序");
    assert_eq!(b, ["b:1", "b:2", "b:3", "b:4"], "跨执行器跳跃不得乱序");
}

/// 读回调抛错的 Handler。
struct FaultyReader;

impl ChannelHandler for FaultyReader {}

impl InboundHandler for FaultyReader {
    fn channel_read(
        &self,
        _ctx: &Arc<HandlerContext>,
        msg: PipelineMessage,
    ) -> Result<(), StrandError> {
        msg.release();
        Err(StrandError::new("pipeline.handler_failed", "boom"))
    }
}

struct ExceptionSink {
    codes: Arc<Mutex<Vec<String>>>,
}

impl ChannelHandler for ExceptionSink {}

impl InboundHandler for ExceptionSink {
    fn exception_caught(
        &self,
        _ctx: &Arc<HandlerContext>,
        cause: Arc<StrandError>,
    ) -> Result<(), StrandError> {
        self.codes.lock().unwrap().push(cause.code().to_string());
        Ok(())
    }
}

/// 场景：`channel_read` 抛错必须转入异常捕获链，且不回抛给事件发起方。
#[test]
fn read_error_is_redirected_to_exception_caught() {
    let fx = fixture();
    let codes = Arc::new(Mutex::new(Vec::new()));
    fx.channel
        .pipeline()
        .add_last("faulty", inbound_handler(FaultyReader))
        .expect("faulty added");
    fx.channel
        .pipeline()
        .add_last(
            "sink",
            inbound_handler(ExceptionSink {
                codes: Arc::clone(&codes),
            }),
        )
        .expect("sink added");
    fx.register();

    // 触发方不感知任何错误：调用正常返回。
    fx.channel.pipeline().fire_channel_read(user_msg(7));
    fx.executor.run_pending();

    assert_eq!(
        codes.lock().unwrap().as_slice(),
        ["pipeline.handler_failed"],
        "异常应抵达下游 exception_caught"
    );
}

/// 声明跳过读回调的 Handler：若仍被调用则直接失败。
struct SkippedReader {
    reads: Arc<AtomicUsize>,
}

impl ChannelHandler for SkippedReader {}

impl InboundHandler for SkippedReader {
    fn inbound_mask(&self) -> ExecMask {
        ExecMask::ALL_INBOUND.without(ExecMask::CHANNEL_READ)
    }

    fn channel_read(
        &self,
        _ctx: &Arc<HandlerContext>,
        msg: PipelineMessage,
    ) -> Result<(), StrandError> {
        msg.release();
        self.reads.fetch_add(1, Ordering::SeqCst);
        Err(StrandError::new(
            "pipeline.handler_failed",
            "skipped handler must not observe reads",
        ))
    }
}

/// 掩码声明的纯转发回调被整段跳过。
#[test]
fn declared_skip_mask_bypasses_handler() {
    let fx = fixture();
    let reads = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(Mutex::new(Vec::new()));
    fx.channel
        .pipeline()
        .add_last(
            "skipped",
            inbound_handler(SkippedReader {
                reads: Arc::clone(&reads),
            }),
        )
        .expect("skipped added");
    fx.channel
        .pipeline()
        .add_last(
            "sink",
            inbound_handler(Recorder {
                tag: "sink",
                log: Arc::clone(&log),
            }),
        )
        .expect("sink added");
    fx.register();

    fx.channel.pipeline().fire_channel_read(user_msg(1));
    fx.executor.run_pending();

    assert_eq!(reads.load(Ordering::SeqCst), 0, "被跳过的回调不得执行");
    assert_eq!(log.lock().unwrap().as_slice(), ["sink:1"], "消息直达下游");
}

/// 在自身回调内把自己摘除的 Handler。
struct SelfRemoving {
    handled: Arc<AtomicUsize>,
}

impl ChannelHandler for SelfRemoving {}

impl InboundHandler for SelfRemoving {
    fn channel_read(
        &self,
        ctx: &Arc<HandlerContext>,
        msg: PipelineMessage,
    ) -> Result<(), StrandError> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        ctx.pipeline().remove(ctx.name())?;
        ctx.fire_channel_read(msg);
        Ok(())
    }
}

/// 场景：回调内自我摘除——已在途的事件完成投递，摘除之后的事件不再抵达。
#[test]
fn mid_dispatch_removal_is_safe() {
    let fx = fixture();
    let handled = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(Mutex::new(Vec::new()));
    fx.channel
        .pipeline()
        .add_last(
            "self-removing",
            inbound_handler(SelfRemoving {
                handled: Arc::clone(&handled),
            }),
        )
        .expect("self-removing added");
    fx.channel
        .pipeline()
        .add_last(
            "sink",
            inbound_handler(Recorder {
                tag: "sink",
                log: Arc::clone(&log),
            }),
        )
        .expect("sink added");
    fx.register();

    fx.channel.pipeline().fire_channel_read(user_msg(1));
    fx.executor.run_pending();
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert!(
        fx.channel.pipeline().context("self-removing").is_none(),
        "节点应已摘除"
    );

    fx.channel.pipeline().fire_channel_read(user_msg(2));
    fx.executor.run_pending();
    assert_eq!(
        handled.load(Ordering::SeqCst),
        1,
        "摘除完成后的事件不得再调用该 Handler"
    );
    assert_eq!(
        log.lock().unwrap().as_slice(),
        ["sink:1", "sink:2"],
        "下游顺序完整"
    );
}

/// 记录生命周期回调顺序的 Handler。
struct LifecycleProbe {
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl ChannelHandler for LifecycleProbe {
    fn handler_added(&self, _ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        self.log.lock().unwrap().push("added");
        Ok(())
    }

    fn handler_removed(&self, _ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        self.log.lock().unwrap().push("removed");
        Ok(())
    }
}

impl InboundHandler for LifecycleProbe {
    fn channel_registered(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        self.log.lock().unwrap().push("registered");
        ctx.fire_channel_registered();
        Ok(())
    }
}

/// 注册前添加的 Handler：`handler_added` 必须先于注册事件执行。
#[test]
fn pending_handler_added_runs_before_registered_event() {
    let fx = fixture();
    let log = Arc::new(Mutex::new(Vec::new()));
    fx.channel
        .pipeline()
        .add_last(
            "lifecycle",
            inbound_handler(LifecycleProbe {
                log: Arc::clone(&log),
            }),
        )
        .expect("lifecycle added");
    assert!(
        log.lock().unwrap().is_empty(),
        "注册前不得执行任何生命周期回调"
    );

    fx.register();
    assert_eq!(
        log.lock().unwrap().as_slice(),
        ["added", "registered"],
        "装配回调先于注册事件"
    );
}

/// 结构变更 API：定位插入、重名拒绝、未知名报错。
#[test]
fn structural_mutation_contract() {
    let fx = fixture();
    let log = Arc::new(Mutex::new(Vec::new()));
    let recorder = |tag| {
        inbound_handler(Recorder {
            tag,
            log: Arc::clone(&log),
        })
    };
    let pipeline = fx.channel.pipeline();
    pipeline.add_last("b", recorder("b")).expect("add b");
    pipeline.add_first("a", recorder("a")).expect("add a");
    pipeline.add_after("b", "d", recorder("d")).expect("add d");
    pipeline.add_before("d", "c", recorder("c")).expect("add c");

    let names = pipeline.names();
    assert_eq!(names, ["a", "b", "c", "d"], "插入位置与名称顺序一致");

    let duplicate = pipeline.add_last("a", recorder("dup"));
    assert_eq!(
        duplicate.expect_err("重名必须拒绝").code(),
        "pipeline.duplicate_name"
    );
    let unknown = pipeline.remove("missing");
    assert_eq!(
        unknown.expect_err("未知名必须报错").code(),
        "pipeline.unknown_handler"
    );

    fx.register();
    fx.channel.pipeline().fire_channel_read(user_msg(9));
    fx.executor.run_pending();
    assert_eq!(
        log.lock().unwrap().as_slice(),
        ["a:9", "b:9", "c:9", "d:9"],
        "事件按链序流经全部节点"
    );
}
