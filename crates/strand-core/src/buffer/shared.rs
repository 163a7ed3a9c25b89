use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    error::{StrandError, codes},
    sealed::Sealed,
};

/// `SharedBuf` 定义对象安全的引用计数只读缓冲契约。
///
/// # 设计背景（Why）
/// - **对标实践**：综合 Netty `ByteBuf`、Tokio `bytes::Bytes`、gRPC C++ `Slice` 的引用计数模型，
///   抽象出通用的“持有-读取-归还”语义。
/// - **框架定位**：出站缓冲需要在写入、取消、失败三类退出路径上归还消息；
///   按块写入的传输还需要推进读指针以支持“单条消息分多次写出”。
/// - **扩展目标**：允许自定义实现以适配池化、共享内存等场景，同时在 `no_std + alloc` 环境中保持可用。
///
/// # 逻辑解析（How）
/// - 读取侧按“观察-推进”两段式设计：`chunk` 暴露当前连续可读块，`advance` 推进读指针；
/// - 计数侧由 `retain`/`release` 维护逻辑引用计数，`clone_retained` 在真正的扇出点
///   一步完成“增计数 + 复制句柄”。
///
/// # 契约说明（What）
/// - **前置条件**：`advance(len)` 要求 `len <= readable_bytes()`，否则返回
///   [`codes::BUFFER_OUT_OF_BOUNDS`] 错误。
/// - **后置条件**：所有推进操作结束后，`readable_bytes()` 必须准确反映剩余字节数；
///   `release` 与 `retain` 必须严格成对，句柄析构时由实现负责调用一次 `release`。
/// - **线程安全**：实现必须满足 `Send + Sync`，计数操作需为原子语义。
///
/// # 设计考量（Trade-offs & Gotchas）
/// - 框架内部从不直接调用 `retain`/`release`：消息以移动语义流转，析构即归还。
///   两个裸方法仅供实现者与适配层（如池化分配器）使用。
/// - `chunk` 返回的切片生命周期仅在下一次可变访问前有效。
pub trait SharedBuf: Send + Sync + 'static + Sealed {
    /// 返回剩余可读字节数。
    fn readable_bytes(&self) -> usize;

    /// 返回当前可直接读取的连续字节块。
    fn chunk(&self) -> &[u8];

    /// 将读指针前移 `len` 字节，丢弃对应数据。
    fn advance(&mut self, len: usize) -> Result<(), StrandError>;

    /// 增加一次逻辑引用。
    fn retain(&self);

    /// 归还一次逻辑引用。
    fn release(&self);

    /// 返回当前逻辑引用计数，供泄漏检测与测试断言使用。
    fn ref_count(&self) -> usize;

    /// 在扇出点复制句柄：增加一次引用并返回共享同一底层存储的新句柄。
    ///
    /// 新句柄继承当前读指针位置，后续推进互不影响。
    fn clone_retained(&self) -> Box<dyn SharedBuf>;
}

/// 底层堆存储，被所有 [`HeapBuf`] 句柄共享。
struct HeapStorage {
    data: Vec<u8>,
    refs: AtomicUsize,
}

/// `HeapBuf` 是 [`SharedBuf`] 的普通堆实现。
///
/// # 设计背景（Why）
/// - 测试与内存传输需要一个零依赖的参考实现；池化或零拷贝实现可在外部以相同契约替换。
///
/// # 逻辑解析（How）
/// - 存储由 `Arc<HeapStorage>` 共享，逻辑引用计数独立于 `Arc` 计数维护，
///   使“句柄泄漏”可以被测试观察到，而内存回收仍由 `Arc` 兜底。
/// - 每个句柄携带独立的读指针，互不干扰。
///
/// # 契约说明（What）
/// - 构造时计数为 1；句柄析构自动归还一次引用。
pub struct HeapBuf {
    storage: Arc<HeapStorage>,
    read_index: usize,
}

impl HeapBuf {
    /// 以字节内容构造新缓冲，初始引用计数为 1。
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            storage: Arc::new(HeapStorage {
                data: data.into(),
                refs: AtomicUsize::new(1),
            }),
            read_index: 0,
        }
    }

    /// 以装箱形式构造，便于直接投入流水线消息。
    pub fn boxed(data: impl Into<Vec<u8>>) -> Box<dyn SharedBuf> {
        Box::new(Self::new(data))
    }
}

impl SharedBuf for HeapBuf {
    fn readable_bytes(&self) -> usize {
        self.storage.data.len() - self.read_index
    }

    fn chunk(&self) -> &[u8] {
        &self.storage.data[self.read_index..]
    }

    fn advance(&mut self, len: usize) -> Result<(), StrandError> {
        if len > self.readable_bytes() {
            return Err(StrandError::new(
                codes::BUFFER_OUT_OF_BOUNDS,
                "advance beyond readable bytes",
            ));
        }
        self.read_index += len;
        Ok(())
    }

    fn retain(&self) {
        self.storage.refs.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        // 计数只减不翻转为负：重复归还属于实现缺陷，饱和处理避免放大故障。
        let _ = self
            .storage
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |refs| {
                refs.checked_sub(1)
            });
    }

    fn ref_count(&self) -> usize {
        self.storage.refs.load(Ordering::Acquire)
    }

    fn clone_retained(&self) -> Box<dyn SharedBuf> {
        self.retain();
        Box::new(Self {
            storage: Arc::clone(&self.storage),
            read_index: self.read_index,
        })
    }
}

impl Drop for HeapBuf {
    fn drop(&mut self) {
        self.release();
    }
}
