/// 通道配置。
///
/// # 设计背景（Why）
/// - 水位线、自动读、自动关闭与单轮写出上限是核心与宿主之间的全部配置面；
///   其余策略（缓冲分配、超时）归属外层组件，核心不越界。
///
/// # 契约说明（What）
/// - `write_buffer_high_watermark` / `write_buffer_low_watermark`：可写性滞回的
///   上下阈值，构造时校验 `high >= low`。
/// - `auto_read`：通道活跃或一轮读取完成后是否自动声明下一轮读意向。
/// - `auto_close`：写路径遇到 IO 故障时是否自动关闭整个通道；关闭该选项后退化为
///   仅半关输出侧。
/// - `max_messages_per_write`：传输单轮 `do_write` 允许取走的消息数上限。
#[derive(Clone, Debug)]
pub struct ChannelOptions {
    write_buffer_high_watermark: usize,
    write_buffer_low_watermark: usize,
    auto_read: bool,
    auto_close: bool,
    max_messages_per_write: usize,
}

impl ChannelOptions {
    /// 默认高水位：64 KiB。
    pub const DEFAULT_HIGH_WATERMARK: usize = 64 * 1024;
    /// 默认低水位：32 KiB。
    pub const DEFAULT_LOW_WATERMARK: usize = 32 * 1024;
    /// 默认单轮写出消息上限。
    pub const DEFAULT_MAX_MESSAGES_PER_WRITE: usize = 16;

    /// 覆写水位线。
    ///
    /// # Panics
    /// `high < low` 属于配置编程错误，立即 panic。
    pub fn with_watermarks(mut self, high: usize, low: usize) -> Self {
        assert!(
            high >= low,
            "write buffer high watermark must not be below the low watermark"
        );
        self.write_buffer_high_watermark = high;
        self.write_buffer_low_watermark = low;
        self
    }

    /// 覆写自动读开关。
    pub fn with_auto_read(mut self, auto_read: bool) -> Self {
        self.auto_read = auto_read;
        self
    }

    /// 覆写自动关闭开关。
    pub fn with_auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }

    /// 覆写单轮写出消息上限。
    pub fn with_max_messages_per_write(mut self, max: usize) -> Self {
        assert!(max > 0, "max messages per write must be positive");
        self.max_messages_per_write = max;
        self
    }

    /// 可写性滞回的上阈值。
    pub fn write_buffer_high_watermark(&self) -> usize {
        self.write_buffer_high_watermark
    }

    /// 可写性滞回的下阈值。
    pub fn write_buffer_low_watermark(&self) -> usize {
        self.write_buffer_low_watermark
    }

    /// 是否自动声明读意向。
    pub fn auto_read(&self) -> bool {
        self.auto_read
    }

    /// IO 故障时是否自动关闭通道。
    pub fn auto_close(&self) -> bool {
        self.auto_close
    }

    /// 传输单轮写出允许取走的消息数。
    pub fn max_messages_per_write(&self) -> usize {
        self.max_messages_per_write
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            write_buffer_high_watermark: Self::DEFAULT_HIGH_WATERMARK,
            write_buffer_low_watermark: Self::DEFAULT_LOW_WATERMARK,
            auto_read: true,
            auto_close: true,
            max_messages_per_write: Self::DEFAULT_MAX_MESSAGES_PER_WRITE,
        }
    }
}
