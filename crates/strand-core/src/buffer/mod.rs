//! 缓冲与消息契约模块。
//!
//! # 模块架构（Why）
//! - 将“引用计数缓冲”与“流水线消息封装”拆分为独立子模块，对齐 Netty `ByteBuf`、
//!   Tokio `bytes::Buf` 等主流框架的职责分离实践。
//! - 通过统一的 [`SharedBuf`] 契约隐藏底层实现差异，让流水线与出站缓冲解耦具体内存策略。
//!
//! # 设计总览（How）
//! - [`shared`] 定义引用计数只读缓冲协议，涵盖 `retain`、`release`、`advance` 等核心操作，
//!   并提供堆实现 [`HeapBuf`] 供测试与轻量传输复用。
//! - [`message`] 描述流水线消息体，以“移动即转移所有权、析构即归还引用”的线性纪律
//!   保证每条消息在任意完成路径上恰好释放一次。
//!
//! # 命名共识（Consistency）
//! - 所有类型均避免使用特定业务前缀，遵循 Rust 与异步生态的惯用术语。

pub mod message;
pub mod shared;

pub use message::PipelineMessage;
pub use shared::{HeapBuf, SharedBuf};
