//! 框架统一错误域。
//!
//! # 模块定位（Why）
//! - 通道生命周期、流水线调度与出站缓冲在不同层次产生的故障需要合流为稳定的错误码，
//!   以便日志与上层治理系统执行精确的自动化处置。
//! - 框架需兼容 `no_std + alloc` 场景，因此基于 [`core::error::Error`] 构建，不依赖 `std` 专属设施。
//!
//! # 逻辑解析（How）
//! - [`StrandError`] 以 Builder 风格方法叠加上下文信息（底层原因、错误类别），并通过 `source()` 暴露完整链路。
//! - 错误码 `code` 始终为 `'static` 字符串，承载稳定语义；`message` 面向排障人员。
//! - [`ErrorKind`] 将“生命周期 / IO / Handler / 协议 / 致命”五类处置策略显式化，
//!   避免调用方通过解析字符串推断语义；写路径的自动关闭策略即依赖 [`StrandError::is_io`]。
//!
//! # 契约说明（What）
//! - **前置条件**：调用方必须使用 [`codes`] 模块或遵循 `<域>.<语义>` 约定的自定义码值。
//! - **后置条件**：除非显式调用 `with_*` 方法，错误不会包含额外上下文。
//!
//! # 风险提示（Trade-offs）
//! - 采用 `Cow` 保存消息，牺牲极少量堆分配换取在日志输出时的灵活性。
//! - 错误对象本身不执行任何指标上报逻辑；调用方需自行处理。

use alloc::borrow::Cow;
use alloc::boxed::Box;
use core::error::Error;
use core::fmt;

/// 底层原因的统一装箱形式。
pub type ErrorCause = Box<dyn Error + Send + Sync + 'static>;

/// 框架内通用的 `Result` 别名，默认错误类型为 [`StrandError`]。
pub type Result<T, E = StrandError> = core::result::Result<T, E>;

/// 错误的主要处置类别。
///
/// # 设计背景（Why）
/// - 写路径在遇到 IO 故障时需要区分“关闭整个通道”与“仅半关输出侧”两种策略，
///   该判定必须结构化，不能依赖错误码字符串匹配。
///
/// # 契约说明（What）
/// - `Lifecycle`：对已注册/已关闭/执行器不匹配等状态机违例的报告，仅通过 Promise 失败传播。
/// - `Io`：来自传输钩子的输入输出故障，可能按配置触发通道自动关闭。
/// - `Handler`：用户 Handler 回调内产生的错误，统一转入异常捕获事件。
/// - `Protocol`：协议或缓冲越界类错误。
/// - `Fatal`：不可恢复的编程错误；此类错误不进入 Promise，直接 panic。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// 生命周期状态机违例。
    Lifecycle,
    /// 传输层输入输出故障。
    Io,
    /// 用户 Handler 回调故障。
    Handler,
    /// 协议或缓冲契约违例。
    Protocol,
    /// 不可恢复的编程错误。
    Fatal,
}

/// `StrandError` 是核心各层共享的稳定错误形态。
///
/// # 契约说明（What）
/// - `code`：稳定字符串，建议使用 `namespace.reason` 命名规范。
/// - `message`：人类可读描述，避免包含敏感信息。
/// - `cause`：可选底层原因；若不存在可设为 `None`。
/// - `kind`：结构化处置类别，默认 [`ErrorKind::Lifecycle`]。
#[derive(Debug)]
pub struct StrandError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
    kind: ErrorKind,
}

impl StrandError {
    /// 构造核心错误。
    ///
    /// # 契约定义（What）
    /// - **输入参数**：
    ///   - `code`：遵循 `<领域>.<语义>` 约定的稳定错误码；
    ///   - `message`：面向排障人员的自然语言描述，可为 `&'static str` 或堆分配字符串。
    /// - **后置条件**：返回的错误拥有独立所有权，可在线程间安全传递，
    ///   并准备好被进一步附加类别或底层原因。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            kind: ErrorKind::Lifecycle,
        }
    }

    /// 附带底层原因并返回新的错误。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 为错误标记结构化类别，驱动自动化容错策略。
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取错误描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 获取底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 获取结构化类别。
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 判断是否为 IO 类故障；写路径据此决定自动关闭或半关输出。
    pub fn is_io(&self) -> bool {
        matches!(self.kind, ErrorKind::Io)
    }

    /// 构造“通道已关闭”错误，写入已关闭通道等路径复用该形态。
    pub fn closed() -> Self {
        Self::new(codes::CHANNEL_CLOSED, "channel already closed")
    }

    /// 构造 IO 类错误的便捷入口。
    pub fn io(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::TRANSPORT_IO, message).with_kind(ErrorKind::Io)
    }
}

impl fmt::Display for StrandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for StrandError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|cause| cause.as_ref() as &(dyn Error + 'static))
    }
}

/// 框架保留的稳定错误码表。
///
/// # 设计背景（Why）
/// - 将高频错误码集中声明，避免调用点散落裸字符串导致命名漂移或拼写错误。
///
/// # 契约说明（What）
/// - 所有码值遵循 `<域>.<语义>` 规范；新增码值需同步更新对应的处置文档。
pub mod codes {
    /// 通道已进入终态，拒绝后续写入与生命周期操作。
    pub const CHANNEL_CLOSED: &str = "channel.closed";
    /// 重复注册同一通道。
    pub const CHANNEL_ALREADY_REGISTERED: &str = "channel.already_registered";
    /// 通道尚未与对端建立连接。
    pub const CHANNEL_NOT_CONNECTED: &str = "channel.not_connected";
    /// 通道输出侧已被半关。
    pub const CHANNEL_OUTPUT_SHUTDOWN: &str = "channel.output_shutdown";
    /// 执行器类型与传输实现不兼容。
    pub const EXECUTOR_INCOMPATIBLE: &str = "executor.incompatible";
    /// 流水线中已存在同名 Handler。
    pub const PIPELINE_DUPLICATE_NAME: &str = "pipeline.duplicate_name";
    /// 流水线中找不到目标 Handler。
    pub const PIPELINE_UNKNOWN_HANDLER: &str = "pipeline.unknown_handler";
    /// Handler 回调返回的故障经由异常捕获事件传播。
    pub const PIPELINE_HANDLER_FAILED: &str = "pipeline.handler_failed";
    /// Promise 已处于终态。
    pub const PROMISE_ALREADY_COMPLETE: &str = "promise.already_complete";
    /// Promise 在完成前被取消。
    pub const PROMISE_CANCELLED: &str = "promise.cancelled";
    /// 传输层 IO 故障。
    pub const TRANSPORT_IO: &str = "transport.io";
    /// 传输实现不支持请求的操作。
    pub const TRANSPORT_UNSUPPORTED: &str = "transport.unsupported";
    /// 缓冲读取越界。
    pub const BUFFER_OUT_OF_BOUNDS: &str = "buffer.out_of_bounds";
}
