//! 传输层边界契约。
//!
//! # 模块定位（Why）
//! - 核心是传输无关的调度与缓冲层：真正的系统调用（socket 读写、epoll/IOCP 轮询）
//!   由具体传输 crate 提供，本模块只定义二者之间的窄接口。
//! - 对齐 Netty `AbstractChannel#do*` 钩子族的拆分方式：生命周期钩子由核心在
//!   正确的执行器线程上调用，传输实现只需关注单线程语义。
//!
//! # 设计总览（How）
//! - [`addr`] 提供协议无关的套接字地址表示，避免核心绑定 `std::net`。
//! - [`hooks`] 定义 [`Transport`] 钩子契约，覆盖注册、绑定、关闭、读写与兼容性探测。

pub mod addr;
pub mod hooks;

pub use addr::TransportSocketAddr;
pub use hooks::Transport;
