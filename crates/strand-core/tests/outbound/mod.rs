//! 出站缓冲契约测试：字节记账、水位线滞回、取消竞态与关闭语义。

use std::sync::{Arc, Mutex};

use strand_core::{
    Channel, ChannelOptions, ChannelPromise, EventExecutor, HandlerContext, HeapBuf,
    InboundHandler, PipelineMessage, SharedBuf, StrandError,
    pipeline::ChannelHandler,
    inbound_handler,
    test_stubs::{ManualExecutor, MockTransport, NoopLogger},
};

struct Fixture {
    channel: Arc<Channel>,
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

/// 记录可写性变化事件的探针 Handler。
struct WritabilityProbe {
    flips: Arc<Mutex<Vec<bool>>>,
}

impl ChannelHandler for WritabilityProbe {}

impl InboundHandler for WritabilityProbe {
    fn writability_changed(&self, ctx: &Arc<HandlerContext>) -> Result<(), StrandError> {
        self.flips.lock().unwrap().push(ctx.channel().is_writable());
        Ok(())
    }
}

fn payload(bytes: usize) -> PipelineMessage {
    PipelineMessage::from_buffer(HeapBuf::boxed(vec![0u8; bytes]))
}

/// 水位线滞回：真实翻转恰好广播一次，重复越线零广播。
///
/// 每条消息负载 4 字节，加上条目开销后记账 100 字节；高水位 250、低水位 150。
#[test]
fn watermark_hysteresis_notifies_exactly_once_per_flip() {
    let fx = fixture(ChannelOptions::default().with_watermarks(250, 150));
    let flips = Arc::new(Mutex::new(Vec::new()));
    fx.channel
        .pipeline()
        .add_last(
            "writability-probe",
            inbound_handler(WritabilityProbe {
                flips: Arc::clone(&flips),
            }),
        )
        .expect("probe added");
    fx.register();

    let buffer = fx.channel.outbound();
    let mut promises = Vec::new();
    for _ in 0..3 {
        let promise = fx.channel.new_promise();
        buffer.add_message(payload(4), 4, promise.clone());
        promises.push(promise);
    }
    fx.executor.run_pending();
    assert_eq!(buffer.total_pending_bytes(), 300);
    assert!(!fx.channel.is_writable(), "300 字节越过高水位后不可写");
    assert_eq!(
        flips.lock().unwrap().as_slice(),
        [false],
        "越线恰好广播一次"
    );

    // 继续加压：已不可写，不得重复广播。
    let extra = fx.channel.new_promise();
    buffer.add_message(payload(4), 4, extra);
    fx.executor.run_pending();
    assert_eq!(flips.lock().unwrap().len(), 1, "重复越线零广播");

    buffer.add_flush();
    assert!(buffer.remove(), "弹出第一条");
    assert!(buffer.remove(), "弹出第二条");
    fx.executor.run_pending();
    assert_eq!(buffer.total_pending_bytes(), 200);
    assert!(!fx.channel.is_writable(), "200 字节仍未跌破低水位");

    assert!(buffer.remove());
    fx.executor.run_pending();
    assert_eq!(buffer.total_pending_bytes(), 100);
    assert!(fx.channel.is_writable(), "跌破低水位后恢复可写");
    assert_eq!(
        flips.lock().unwrap().as_slice(),
        [false, true],
        "每次真实翻转恰好一次广播"
    );
    assert!(promises.iter().all(|p| p.is_done()));
}

/// 写入取消发生在冲刷之前：消息释放、记账回退、传输一无所得。
#[test]
fn cancel_before_flush_reclaims_everything() {
    let fx = fixture(ChannelOptions::default());
    fx.register();
    let buffer = fx.channel.outbound();

    let buf = HeapBuf::new(vec![1u8, 2, 3, 4]);
    let probe = buf.clone_retained();
    let promise = fx.channel.new_promise();
    buffer.add_message(PipelineMessage::from_buffer(Box::new(buf)), 4, promise.clone());
    assert_eq!(buffer.total_pending_bytes(), 100);
    assert_eq!(probe.ref_count(), 2);

    assert!(promise.cancel(), "冲刷前可以取消");
    buffer.add_flush();

    assert_eq!(probe.ref_count(), 1, "消息应在冲刷阶段被释放");
    assert_eq!(buffer.total_pending_bytes(), 0, "记账应回退到写入前");
    buffer.with_flushed_slices(16, usize::MAX, |slices| {
        assert!(slices.is_empty(), "已取消条目不得交给传输层");
    });
    assert!(buffer.remove(), "已取消条目仍需从队列弹出");
    assert!(!buffer.remove(), "队列应已排空");
    assert!(promise.is_cancelled());
}

/// 按字节推进：整条消耗的条目成功完成，半条消耗的条目推进读指针。
#[test]
fn remove_bytes_tracks_partial_writes() {
    let fx = fixture(ChannelOptions::default());
    fx.register();
    let buffer = fx.channel.outbound();

    let first = fx.channel.new_promise();
    let second = fx.channel.new_promise();
    buffer.add_message(payload(10), 10, first.clone());
    buffer.add_message(payload(5), 5, second.clone());
    buffer.add_flush();

    buffer.remove_bytes(12);
    assert!(first.is_done(), "完整写出的条目应成功完成");
    assert!(!second.is_done(), "半写条目保持挂起");
    buffer.current(|msg| {
        let readable = msg.map(|m| m.readable_bytes()).unwrap_or(0);
        assert_eq!(readable, 3, "读指针应推进 2 字节");
    });

    buffer.remove_bytes(3);
    assert!(second.is_done());
    assert_eq!(buffer.flushed_count(), 0);
    assert_eq!(buffer.total_pending_bytes(), 0);
}

/// 批量切片视图尊重数量与字节上限，且始终至少包含一个切片。
#[test]
fn flushed_slices_respect_limits() {
    let fx = fixture(ChannelOptions::default());
    fx.register();
    let buffer = fx.channel.outbound();
    for _ in 0..3 {
        buffer.add_message(payload(10), 10, fx.channel.new_promise());
    }
    buffer.add_flush();

    buffer.with_flushed_slices(2, usize::MAX, |slices| {
        assert_eq!(slices.len(), 2, "数量上限生效");
    });
    buffer.with_flushed_slices(16, 15, |slices| {
        assert_eq!(slices.len(), 1, "第二个切片将超出字节上限");
    });
    buffer.with_flushed_slices(16, 1, |slices| {
        assert_eq!(slices.len(), 1, "为保证前向推进必须包含首个切片");
    });
}

/// 用户自定义可写位与内置水位位共同决定可写性。
#[test]
fn user_writability_bits_combine() {
    let fx = fixture(ChannelOptions::default());
    let flips = Arc::new(Mutex::new(Vec::new()));
    fx.channel
        .pipeline()
        .add_last(
            "writability-probe",
            inbound_handler(WritabilityProbe {
                flips: Arc::clone(&flips),
            }),
        )
        .expect("probe added");
    fx.register();
    let buffer = fx.channel.outbound();

    assert!(buffer.user_writability(1));
    buffer.set_user_writability(1, false);
    fx.executor.run_pending();
    assert!(!fx.channel.is_writable());
    buffer.set_user_writability(1, false);
    fx.executor.run_pending();
    assert_eq!(flips.lock().unwrap().len(), 1, "重复置位不得重复广播");

    buffer.set_user_writability(2, false);
    fx.executor.run_pending();
    assert_eq!(flips.lock().unwrap().len(), 1, "已不可写时叠加用户位零广播");

    buffer.set_user_writability(1, true);
    fx.executor.run_pending();
    assert!(!fx.channel.is_writable(), "位 2 仍被清除");
    buffer.set_user_writability(2, true);
    fx.executor.run_pending();
    assert!(fx.channel.is_writable());
    assert_eq!(flips.lock().unwrap().as_slice(), [false, true]);
}

/// 终态清空：未冲刷条目释放消息、失败 Promise、不再广播可写性。
#[test]
fn close_drains_unflushed_without_notifications() {
    let fx = fixture(ChannelOptions::default().with_watermarks(150, 100));
    let flips = Arc::new(Mutex::new(Vec::new()));
    fx.channel
        .pipeline()
        .add_last(
            "writability-probe",
            inbound_handler(WritabilityProbe {
                flips: Arc::clone(&flips),
            }),
        )
        .expect("probe added");
    fx.register();
    let buffer = fx.channel.outbound();

    let buf = HeapBuf::new(vec![0u8; 64]);
    let probe = buf.clone_retained();
    let promise = fx.channel.new_promise();
    buffer.add_message(PipelineMessage::from_buffer(Box::new(buf)), 64, promise.clone());
    fx.executor.run_pending();
    assert_eq!(flips.lock().unwrap().len(), 1, "越线广播一次");

    let cause = Arc::new(StrandError::closed());
    buffer.close(cause, true);
    fx.executor.run_pending();

    assert_eq!(probe.ref_count(), 1, "未冲刷消息应被释放");
    assert_eq!(buffer.total_pending_bytes(), 0);
    match promise.future().outcome() {
        Some(strand_core::Outcome::Failed(err)) => assert_eq!(err.code(), "channel.closed"),
        other => panic!("意外终态: {other:?}"),
    }
    assert_eq!(
        flips.lock().unwrap().len(),
        1,
        "终态清空不得再广播可写性变化"
    );
}

/// 带着已冲刷条目关闭缓冲属于编程错误。
#[test]
#[should_panic(expected = "flushed entries")]
fn close_with_flushed_entries_panics() {
    let fx = fixture(ChannelOptions::default());
    fx.register();
    let buffer = fx.channel.outbound();
    buffer.add_message(payload(4), 4, fx.channel.new_promise());
    buffer.add_flush();
    buffer.close(Arc::new(StrandError::closed()), true);
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    #[derive(Clone, Debug)]
    enum Op {
        Add { size: usize, cancel: bool },
        Flush,
        Remove,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..512, proptest::bool::ANY)
                .prop_map(|(size, cancel)| Op::Add { size, cancel }),
            Just(Op::Flush),
            Just(Op::Remove),
        ]
    }

    proptest! {
        /// P3/P4：任意操作序列下，字节计数等于未完结条目记账之和且永不为负，
        /// 可写性布尔与滞回模型一致。
        #[test]
        fn accounting_matches_model(ops in proptest::collection::vec(op_strategy(), 1..48)) {
            const HIGH: usize = 1024;
            const LOW: usize = 512;
            let fx = fixture(ChannelOptions::default().with_watermarks(HIGH, LOW));
            let buffer = fx.channel.outbound();

            // 模型：(记账尺寸, 是否已冲刷) 的队列 + 滞回位。
            let mut model: Vec<(usize, ChannelPromise, bool)> = Vec::new();
            let mut model_flushed = 0usize;
            let mut model_unwritable = false;

            for op in ops {
                match op {
                    Op::Add { size, cancel } => {
                        let promise = fx.channel.new_promise();
                        buffer.add_message(payload(size), size, promise.clone());
                        let pending = size + strand_core::ENTRY_OVERHEAD;
                        if cancel {
                            promise.cancel();
                        }
                        model.push((pending, promise, cancel));
                        let total: usize = model.iter().map(|(s, _, _)| *s).sum();
                        if total > HIGH {
                            model_unwritable = true;
                        }
                    }
                    Op::Flush => {
                        buffer.add_flush();
                        // 已取消的未冲刷条目在冲刷时结清记账，但仍占据队列位置。
                        let mut reclaimed = 0usize;
                        for entry in model.iter_mut().skip(model_flushed) {
                            if entry.2 {
                                reclaimed += entry.0;
                                entry.0 = 0;
                            }
                        }
                        model_flushed = model.len();
                        if reclaimed > 0 {
                            let total: usize = model.iter().map(|(s, _, _)| *s).sum();
                            if total < LOW {
                                model_unwritable = false;
                            }
                        }
                    }
                    Op::Remove => {
                        let removed = buffer.remove();
                        prop_assert_eq!(removed, model_flushed > 0);
                        if model_flushed > 0 {
                            let (size, _, cancelled) = model.remove(0);
                            model_flushed -= 1;
                            if !cancelled && size > 0 {
                                let total: usize = model.iter().map(|(s, _, _)| *s).sum();
                                if total < LOW {
                                    model_unwritable = false;
                                }
                            }
                        }
                    }
                }
                let expected: usize = model.iter().map(|(s, _, _)| *s).sum();
                prop_assert_eq!(buffer.total_pending_bytes(), expected);
                prop_assert_eq!(buffer.is_writable(), !model_unwritable);
            }
        }
    }
}
