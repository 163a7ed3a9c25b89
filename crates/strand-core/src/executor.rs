//! 事件执行器契约。
//!
//! # Contract-only Runtime Surface
//!
//! ## 契约声明
//! * **Contract-only：** 本模块仅定义事件循环可供核心调用的抽象 API，约束核心只能依赖这些接口
//!   而非具体执行器实现，以便在线程池、单线程 reactor 或测试泵之间自由替换宿主。
//! * **禁止实现：** 本文件不落地具体调度逻辑，实现必须由宿主运行时或测试替身在外部提供。
//!
//! ## 并发与顺序语义
//! * **FIFO 保证：** 同一调用方提交的任务必须按提交顺序执行；整条流水线的“单通道有序”
//!   不依赖任何锁，而是完全建立在该保证之上。
//! * **线程亲和：** [`EventExecutor::in_event_loop`] 让调用方判定当前线程是否就是该执行器的
//!   事件线程，从而选择同步内联或打包提交两条路径。
//!
//! ## 设计取舍提示
//! * 任务以 `Box<dyn FnOnce()>` 装箱提交，牺牲一次分配换取对象安全；
//!   高频写路径的分摊成本由出站缓冲的预记账机制吸收。

use alloc::boxed::Box;

use crate::sealed::Sealed;

/// 提交给执行器的一次性任务。
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// `EventExecutor` 定义单线程、严格有序的事件循环契约。
///
/// # 设计背景（Why）
/// - 综合 Netty EventLoop、Tokio current-thread runtime、Glommio executor 的公共能力，
///   将“每通道单线程”调度模型压缩为两个方法，便于宿主以最小代价适配。
///
/// # 契约说明（What）
/// - `execute`：将任务排入队列；同一提交方的任务必须按 FIFO 顺序执行，且最终一定被执行
///   （执行器关停前需排空队列）。
/// - `in_event_loop`：当且仅当调用线程就是该执行器的事件线程时返回 `true`。
/// - `is_ordered`：声明执行器是否提供顺序保证；无序执行器（如共享线程池适配层）返回
///   `false`，流水线据此放宽 Handler 生命周期检查以避免并发装配时的死锁。
///
/// # 前置/后置条件（Contract）
/// - **前置**：实现必须线程安全，`execute` 可被任意线程并发调用。
/// - **后置**：任务执行期间 `in_event_loop` 对事件线程返回 `true`。
///
/// # 风险提示（Trade-offs）
/// - 契约不提供任务取消：一旦提交必然执行。需要“提交后撤销”语义的调用方应在任务体内
///   自行检查状态（出站写任务即采用该策略结算预记账字节）。
pub trait EventExecutor: Send + Sync + 'static + Sealed {
    /// 提交任务，保证同一提交方的 FIFO 顺序。
    fn execute(&self, task: Task);

    /// 判断当前线程是否为该执行器的事件线程。
    fn in_event_loop(&self) -> bool;

    /// 声明执行器是否提供顺序保证，默认 `true`。
    fn is_ordered(&self) -> bool {
        true
    }
}
