//! 出站写缓冲与背压记账。
//!
//! # 模块定位（Why）
//! - 写操作在 `write` 与 `flush` 之间需要一个按通道隔离的暂存区；聚合待发送字节并推导
//!   可写性，是整个框架非阻塞流控的基石。
//! - 对齐 Netty `ChannelOutboundBuffer` 的三段式队列（已冲刷区 / 未冲刷区 / 尾部）与
//!   水位线滞回算法，在 Rust 中以 `VecDeque + 已冲刷计数` 表达三指针结构。
//!
//! # 并发模型（How）
//! - 队列本体遵循单写者纪律：仅所属执行器线程在热路径上修改；`spin::Mutex` 只是
//!   安全兜底，不构成跨线程协议。
//! - 待发送字节总量与可写性标志位是唯二的跨线程共享状态，全部为原子量，供任意线程
//!   无锁执行背压查询。
//! - 字节计数严格先于标志位更新：并发读者最多看到“保守”的可写性，绝不乐观。
//!
//! # 资源纪律（What）
//! - 每个条目的消息在成功、失败、取消三类退出路径上恰好释放一次；
//!   Promise 完成与消息释放一律发生在内部锁之外，杜绝监听器重入导致的死锁。

use alloc::{
    collections::VecDeque,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use spin::{Mutex, RwLock};

use crate::{
    buffer::PipelineMessage,
    channel::{Channel, ChannelOptions},
    error::StrandError,
    promise::ChannelPromise,
};

/// 每个队列条目的固定记账开销（字节）。
///
/// 水位线衡量的是队列的真实负担而非纯负载字节：大量小消息同样会撑爆队列，
/// 因此每个条目按“负载 + 固定开销”计入总量。
pub const ENTRY_OVERHEAD: usize = 96;

/// 可写性标志位中的内置水位位。
const UNWRITABLE_BIT: u32 = 1;

/// 单个待写条目。
struct Entry {
    msg: Option<PipelineMessage>,
    pending_size: usize,
    progress: u64,
    total: i64,
    promise: ChannelPromise,
    cancelled: bool,
}

impl Entry {
    fn new(msg: PipelineMessage, size: usize, promise: ChannelPromise) -> Self {
        let total = msg
            .as_buffer()
            .map(|buf| buf.readable_bytes() as i64)
            .unwrap_or(-1);
        Self {
            msg: Some(msg),
            pending_size: size.saturating_add(ENTRY_OVERHEAD),
            progress: 0,
            total,
            promise,
            cancelled: false,
        }
    }
}

struct Inner {
    entries: VecDeque<Entry>,
    /// 队首起已冲刷条目的数量；该计数即“已冲刷区 / 未冲刷区”的边界指针。
    flushed: usize,
}

/// `OutboundBuffer` 维护一个通道在 `write` 与 `flush` 之间的全部待发送状态。
///
/// # 契约说明（What）
/// - [`add_message`](Self::add_message) 追加到未冲刷区并增加待发送字节；
/// - [`add_flush`](Self::add_flush) 将整个未冲刷区原子地提升为已冲刷区，
///   并把无法锁定为“不可取消”的条目按已取消处理；
/// - [`remove`](Self::remove) / [`remove_with_cause`](Self::remove_with_cause)
///   弹出最老的已冲刷条目并完成其 Promise；
/// - [`remove_bytes`](Self::remove_bytes) 供按块写出的传输推进读进度；
/// - 可写性由水位线滞回驱动，真实翻转时恰好广播一次“可写性变化”事件。
///
/// # 线程安全
/// - 除字节总量与可写性查询外，所有修改操作必须由所属执行器线程发起。
pub struct OutboundBuffer {
    inner: Mutex<Inner>,
    total_pending: AtomicUsize,
    unwritable: AtomicU32,
    detached: AtomicBool,
    in_fail: AtomicBool,
    high_watermark: usize,
    low_watermark: usize,
    channel: RwLock<Weak<Channel>>,
}

impl OutboundBuffer {
    pub(crate) fn new(options: &ChannelOptions) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                flushed: 0,
            }),
            total_pending: AtomicUsize::new(0),
            unwritable: AtomicU32::new(0),
            detached: AtomicBool::new(false),
            in_fail: AtomicBool::new(false),
            high_watermark: options.write_buffer_high_watermark(),
            low_watermark: options.write_buffer_low_watermark(),
            channel: RwLock::new(Weak::new()),
        }
    }

    /// 绑定所属通道的弱引用；构造期一次性装配。
    pub(crate) fn bind_channel(&self, channel: Weak<Channel>) {
        *self.channel.write() = channel;
    }

    /// 将缓冲标记为“已脱离”：关闭流程的第一步，此后新的写入立即失败。
    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    /// 缓冲是否已脱离通道。
    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// 追加一条消息到未冲刷区。
    ///
    /// # 契约说明（What）
    /// - `size` 为调用方声明的负载尺寸，记账时自动叠加 [`ENTRY_OVERHEAD`]；
    /// - 缓冲已脱离时立即释放消息并以通道的初始关闭原因失败 Promise，绝不阻塞。
    pub fn add_message(&self, msg: PipelineMessage, size: usize, promise: ChannelPromise) {
        let pending;
        {
            let mut inner = self.inner.lock();
            if self.is_detached() {
                drop(inner);
                self.reject_after_close(msg, promise);
                return;
            }
            let entry = Entry::new(msg, size, promise);
            pending = entry.pending_size;
            inner.entries.push_back(entry);
        }
        self.increment_pending(pending, false);
    }

    /// 将未冲刷区整体提升为已冲刷区。
    ///
    /// 提升时为每个条目执行“不可取消”锁定：锁定失败（调用方并发取消）的条目
    /// 立即释放消息并退还记账字节，不会交给传输层。
    pub fn add_flush(&self) {
        let mut released: Vec<PipelineMessage> = Vec::new();
        let mut reclaimed = 0usize;
        {
            let mut inner = self.inner.lock();
            let len = inner.entries.len();
            if inner.flushed == len {
                return;
            }
            for index in inner.flushed..len {
                let entry = &mut inner.entries[index];
                if !entry.promise.set_uncancellable() {
                    entry.cancelled = true;
                    reclaimed += entry.pending_size;
                    entry.pending_size = 0;
                    if let Some(msg) = entry.msg.take() {
                        released.push(msg);
                    }
                }
            }
            inner.flushed = len;
        }
        for msg in released {
            msg.release();
        }
        if reclaimed > 0 {
            self.decrement_pending(reclaimed, false, true);
        }
    }

    /// 弹出最老的已冲刷条目并成功完成其 Promise。
    ///
    /// 返回 `false` 表示已冲刷区为空，传输写循环应就此停止。
    pub fn remove(&self) -> bool {
        self.remove_inner(None, true)
    }

    /// 弹出最老的已冲刷条目并以 `cause` 失败其 Promise。
    pub fn remove_with_cause(&self, cause: &Arc<StrandError>) -> bool {
        self.remove_inner(Some(cause), true)
    }

    fn remove_inner(&self, cause: Option<&Arc<StrandError>>, notify: bool) -> bool {
        let entry = {
            let mut inner = self.inner.lock();
            if inner.flushed == 0 {
                return false;
            }
            inner.flushed -= 1;
            inner
                .entries
                .pop_front()
                .expect("flushed count implies a queued entry")
        };
        self.finish_entry(entry, cause, notify);
        true
    }

    /// 完成一个已出队条目：释放消息、完成 Promise、退还记账字节。
    ///
    /// 已取消条目在冲刷阶段就结清了资源，这里仅静默跳过。
    fn finish_entry(&self, entry: Entry, cause: Option<&Arc<StrandError>>, notify: bool) {
        if entry.cancelled {
            return;
        }
        if let Some(msg) = entry.msg {
            msg.release();
        }
        match cause {
            None => {
                entry.promise.try_success();
            }
            Some(cause) => {
                entry.promise.try_failure_shared(Arc::clone(cause));
            }
        }
        self.decrement_pending(entry.pending_size, false, notify);
    }

    /// 按已写出的字节数推进队列。
    ///
    /// 完整写出的条目按成功移除；部分写出的条目推进其缓冲读指针并保留在队首；
    /// 已取消条目被跳过，不会重发。
    pub fn remove_bytes(&self, written: usize) {
        let mut remaining = written;
        loop {
            let completed = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if inner.flushed == 0 {
                    break;
                }
                let entry = &mut inner.entries[0];
                if entry.cancelled {
                    inner.flushed -= 1;
                    inner.entries.pop_front()
                } else {
                    let readable = entry
                        .msg
                        .as_ref()
                        .map(|msg| msg.readable_bytes())
                        .unwrap_or(0);
                    if readable <= remaining {
                        remaining -= readable;
                        entry.progress += readable as u64;
                        inner.flushed -= 1;
                        inner.entries.pop_front()
                    } else {
                        if remaining > 0 {
                            entry.progress += remaining as u64;
                            if let Some(buf) =
                                entry.msg.as_mut().and_then(|msg| msg.as_buffer_mut())
                            {
                                // readable > remaining 已检查，推进不会越界。
                                let _ = buf.advance(remaining);
                            }
                        }
                        None
                    }
                }
            };
            match completed {
                Some(entry) => self.finish_entry(entry, None, true),
                None => break,
            }
        }
    }

    /// 以闭包作用域暴露已冲刷区的可读切片视图。
    ///
    /// # 契约说明（What）
    /// - 最多收集 `max_count` 个切片、累计不超过 `max_bytes` 字节；
    ///   为保证前向推进，首个切片即便超限也必定包含。
    /// - 视图借用内部条目，生命周期被闭包参数约束，不可能逃逸出本次调用。
    pub fn with_flushed_slices<R>(
        &self,
        max_count: usize,
        max_bytes: usize,
        f: impl FnOnce(&[&[u8]]) -> R,
    ) -> R {
        let inner = self.inner.lock();
        let mut slices: Vec<&[u8]> = Vec::new();
        let mut bytes = 0usize;
        for entry in inner.entries.iter().take(inner.flushed) {
            if entry.cancelled {
                continue;
            }
            let Some(buf) = entry.msg.as_ref().and_then(|msg| msg.as_buffer()) else {
                continue;
            };
            let chunk = buf.chunk();
            if chunk.is_empty() {
                continue;
            }
            if !slices.is_empty()
                && (slices.len() >= max_count || bytes.saturating_add(chunk.len()) > max_bytes)
            {
                break;
            }
            bytes = bytes.saturating_add(chunk.len());
            slices.push(chunk);
        }
        f(&slices)
    }

    /// 以闭包访问当前队首的已冲刷消息（跳过已取消条目）。
    pub fn current<R>(&self, f: impl FnOnce(Option<&PipelineMessage>) -> R) -> R {
        let inner = self.inner.lock();
        let current = inner
            .entries
            .iter()
            .take(inner.flushed)
            .find(|entry| !entry.cancelled)
            .and_then(|entry| entry.msg.as_ref());
        f(current)
    }

    /// 返回队首已冲刷条目的 `(progress, total)` 进度快照。
    pub fn current_progress(&self) -> Option<(u64, i64)> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .take(inner.flushed)
            .find(|entry| !entry.cancelled)
            .map(|entry| (entry.progress, entry.total))
    }

    /// 队列中条目总数（含未冲刷区）。
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// 队列是否完全为空。
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// 已冲刷区条目数量。
    pub fn flushed_count(&self) -> usize {
        self.inner.lock().flushed
    }

    /// 当前记账的待发送字节总量。
    pub fn total_pending_bytes(&self) -> usize {
        self.total_pending.load(Ordering::Acquire)
    }

    /// 可写性查询：所有标志位为零时可写。
    pub fn is_writable(&self) -> bool {
        self.unwritable.load(Ordering::Acquire) == 0
    }

    /// 查询指定用户自定义可写位（1..=31）。
    pub fn user_writability(&self, index: u32) -> bool {
        let bit = Self::user_bit(index);
        self.unwritable.load(Ordering::Acquire) & bit == 0
    }

    /// 设置用户自定义可写位；真实翻转时广播一次可写性变化。
    pub fn set_user_writability(&self, index: u32, writable: bool) {
        let bit = Self::user_bit(index);
        if writable {
            self.clear_bits(bit, false);
        } else {
            self.set_bits(bit, false);
        }
    }

    fn user_bit(index: u32) -> u32 {
        assert!(
            (1..=31).contains(&index),
            "user writability index must be in 1..=31"
        );
        1 << index
    }

    /// 距离进入“不可写”还可缓冲的字节数；已不可写时为 0。
    pub fn bytes_before_unwritable(&self) -> usize {
        let pending = self.total_pending_bytes();
        if pending >= self.high_watermark {
            return 0;
        }
        let headroom = self.high_watermark - pending;
        if self.is_writable() { headroom } else { 0 }
    }

    /// 距离恢复“可写”还需排空的字节数；已可写时为 0。
    pub fn bytes_before_writable(&self) -> usize {
        let pending = self.total_pending_bytes();
        if pending <= self.low_watermark {
            return 0;
        }
        let backlog = pending - self.low_watermark;
        if self.is_writable() { 0 } else { backlog }
    }

    /// 增加待发送字节；越过高水位时置位并按需广播。
    pub(crate) fn increment_pending(&self, size: usize, invoke_later: bool) {
        if size == 0 {
            return;
        }
        let updated = self.total_pending.fetch_add(size, Ordering::AcqRel) + size;
        if updated > self.high_watermark {
            self.set_bits(UNWRITABLE_BIT, invoke_later);
        }
    }

    /// 退还待发送字节；跌破低水位时清位并按需广播。
    pub(crate) fn decrement_pending(&self, size: usize, invoke_later: bool, notify: bool) {
        if size == 0 {
            return;
        }
        // 饱和递减：计数永不为负。
        let previous = self
            .total_pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(size))
            })
            .expect("fetch_update with Some never fails");
        let updated = previous.saturating_sub(size);
        if notify && updated < self.low_watermark {
            self.clear_bits(UNWRITABLE_BIT, invoke_later);
        }
    }

    fn set_bits(&self, bits: u32, invoke_later: bool) {
        let previous = self.unwritable.fetch_or(bits, Ordering::AcqRel);
        if previous == 0 && previous | bits != 0 {
            self.fire_writability_changed(invoke_later);
        }
    }

    fn clear_bits(&self, bits: u32, invoke_later: bool) {
        let previous = self.unwritable.fetch_and(!bits, Ordering::AcqRel);
        if previous != 0 && previous & !bits == 0 {
            self.fire_writability_changed(invoke_later);
        }
    }

    /// 广播可写性变化；`invoke_later` 时改为向所属执行器提交任务以避免重入。
    fn fire_writability_changed(&self, invoke_later: bool) {
        let Some(channel) = self.channel.read().upgrade() else {
            return;
        };
        if invoke_later {
            let task_channel = Arc::clone(&channel);
            channel.invoke_later(alloc::boxed::Box::new(move || {
                task_channel.pipeline().fire_writability_changed();
            }));
        } else {
            channel.pipeline().fire_writability_changed();
        }
    }

    /// 以 `cause` 失败所有已冲刷条目。
    ///
    /// 重入保护：若失败回调再次触发本方法，内层调用直接返回，由外层循环继续排空。
    pub(crate) fn fail_flushed(&self, cause: &Arc<StrandError>, notify: bool) {
        if self
            .in_fail
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        while self.remove_inner(Some(cause), notify) {}
        self.in_fail.store(false, Ordering::Release);
    }

    /// 通道终结时清空未冲刷区。
    ///
    /// # 契约说明（What）
    /// - 仅允许在已冲刷区排空之后调用；带着已冲刷条目调用属于编程错误，立即 panic。
    /// - 除非 `allow_channel_open`，通道仍打开时调用同样属于编程错误。
    /// - 剩余条目逐一释放消息并失败 Promise；字节计数直接扣减，
    ///   不再触发可写性广播——通道已无观察者。
    pub fn close(&self, cause: Arc<StrandError>, allow_channel_open: bool) {
        if self.in_fail.load(Ordering::Acquire) {
            // 失败排空仍在进行：转投所属执行器，排空后再关闭。
            if let Some(channel) = self.channel.read().upgrade() {
                let buffer_channel = Arc::clone(&channel);
                channel.invoke_later(alloc::boxed::Box::new(move || {
                    buffer_channel.outbound().close(cause, allow_channel_open);
                }));
            }
            return;
        }
        if !allow_channel_open
            && let Some(channel) = self.channel.read().upgrade()
            && channel.is_open()
        {
            panic!("outbound buffer close requires a closed channel");
        }
        self.detach();
        let drained = {
            let mut inner = self.inner.lock();
            assert!(
                inner.flushed == 0,
                "outbound buffer close must not race flushed entries"
            );
            inner.entries.drain(..).collect::<Vec<_>>()
        };
        let mut reclaimed = 0usize;
        for entry in drained {
            if !entry.cancelled {
                reclaimed += entry.pending_size;
                if let Some(msg) = entry.msg {
                    msg.release();
                }
                entry.promise.try_failure_shared(Arc::clone(&cause));
            }
        }
        if reclaimed > 0 {
            let _ = self
                .total_pending
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    Some(current.saturating_sub(reclaimed))
                });
        }
    }

    /// 写入已关闭通道时的快速失败路径。
    fn reject_after_close(&self, msg: PipelineMessage, promise: ChannelPromise) {
        msg.release();
        let cause = self
            .channel
            .read()
            .upgrade()
            .and_then(|channel| channel.initial_close_cause())
            .unwrap_or_else(|| Arc::new(StrandError::closed()));
        promise.try_failure_shared(cause);
    }
}
