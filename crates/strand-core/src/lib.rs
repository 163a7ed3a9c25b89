#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_code)]
#![allow(private_bounds)]
#![doc = "strand-core: 事件驱动网络框架的通道、流水线、出站缓冲与异步完成核心。"]
#![doc = ""]
#![doc = "== 职责边界 =="]
#![doc = "本 crate 是传输无关的调度与缓冲层：通道生命周期、Handler 拦截链、带背压的出站写缓冲、"]
#![doc = "以及把三者粘合起来的 Promise/Future 完成模型。真正的系统调用、工作线程池、日志后端与"]
#![doc = "引导装配均为外部协作者，经由 `executor`、`transport`、`observability` 模块的窄接口接入。"]
#![doc = ""]
#![doc = "== 并发模型 =="]
#![doc = "每个通道的操作在恰好一个单线程、严格 FIFO 的执行器上执行；跨执行器的每一次跳跃都是一次"]
#![doc = "任务提交，这同时也是全部重入规避的唯一机制。出站缓冲的字节计数与可写性标志是唯二的"]
#![doc = "跨线程共享状态，原子维护，供任意线程无锁查询背压。"]
#![doc = ""]
#![doc = "== 内存分配依赖 =="]
#![doc = "`strand-core` 定位于 `no_std + alloc` 场景：核心契约依赖 [`alloc`] 中的 `Box`、`Arc`、"]
#![doc = "`Vec` 支撑事件分发与缓冲队列。纯 `no_std`（无分配器）环境暂不支持。"]

extern crate alloc;

mod sealed;

pub mod arc_swap;
pub mod buffer;
pub mod channel;
pub mod error;
pub mod executor;
pub mod observability;
pub mod outbound;
pub mod pipeline;
pub mod promise;
pub mod transport;

/// 测试桩命名空间，集中暴露框架官方维护的 `Noop`/`Mock` 实现，供集成测试与示例复用。
///
/// # 设计背景（Why）
/// - 统一维护常见桩对象，避免在各处重复定义零尺寸结构体；
/// - 当核心契约演进时，通过单点更新保证所有测试同步适配。
pub mod test_stubs;

pub use buffer::{HeapBuf, PipelineMessage, SharedBuf};
pub use channel::{Channel, ChannelId, ChannelOptions};
pub use error::{ErrorKind, Result, StrandError, codes};
pub use executor::{EventExecutor, Task};
pub use observability::Logger;
pub use outbound::{ENTRY_OVERHEAD, OutboundBuffer};
pub use pipeline::{
    ChannelHandler, ExecMask, HandlerContext, HandlerSpec, InboundHandler, OutboundHandler,
    Pipeline, UserEvent, duplex_handler, inbound_handler, outbound_handler,
};
pub use promise::{ChannelFuture, ChannelPromise, FutureListener, Outcome};
pub use transport::{Transport, TransportSocketAddr};
