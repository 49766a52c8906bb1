/// 定义库中使用的公共类型、错误、配置和传输编号。
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

// --- 公共类型 ---

/// 网络句柄（段）ID 的类型别名，同时也是段在段池中的下标。
pub type HandleId = usize;

/// 库中通用的 `Result` 类型别名，错误类型为 `TpcError`。
pub type Result<T> = std::result::Result<T, TpcError>;

/// 错误正文最多保留的字节数。
pub const ERROR_TEXT_CAP: usize = 1024;

/// 传输方向。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// 从远端读取，写入本地文件。
    Pull,
    /// 读取本地文件，上传到远端。
    Push,
}

/// 由外部授权层提取好的安全实体信息，用于打开本地文件和打包标记。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityEntity {
    pub name: String,
    pub groups: Vec<String>,
    pub organization: Option<String>,
}

/// 单个段的失败原因。
///
/// 所有段级错误都在段内捕获，最终由驱动循环汇总为一条 `failure:` 消息，
/// 不会越过编排器的边界向上传播。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SegmentError {
    /// 状态行格式错误、在状态行之前收到正文、响应超出请求的范围等。
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// 远端返回了 >= 400 的状态码。
    #[error("Remote side failed with status code {code}")]
    RemoteStatus { code: i32 },
    /// 底层网络引擎失败（连接重置、超时等）。
    #[error("{0}")]
    Transport(String),
    /// 本地存储读写失败。
    #[error("Error when interacting with local filesystem: {0}")]
    Storage(String),
}

/// 有序流（`OrderedStream`）的错误。
#[derive(Debug, Error)]
pub enum StreamError {
    /// 本地文件 I/O 失败。
    #[error("{0}")]
    Io(#[from] io::Error),
    /// 流已关闭或在之前的写入失败后不再接受数据。
    #[error("stream is no longer open for writing")]
    Closed,
    /// 写入的偏移量落在已经提交的位置之前。
    #[error("out-of-order write at offset {offset}; data up to {cursor} was already committed")]
    OutOfOrder { offset: u64, cursor: u64 },
    /// 调用 `finalize` 时仍有缓冲条目未刷新。
    #[error("{pending} buffer entries still hold unflushed data")]
    IncompleteFlush { pending: usize },
}

/// 网络引擎的错误。
#[derive(Debug, Error)]
pub enum TransportError {
    /// 由 `reqwest` 产生的请求错误。
    #[error("{0}")]
    Request(#[from] reqwest::Error),
    /// 句柄已被注册，或未注册就被操作。
    #[error("handle {0} is not in the expected registration state")]
    Handle(HandleId),
    /// 其它引擎内部错误。
    #[error("{0}")]
    Engine(String),
}

/// 定义了库中可能发生的所有公共错误类型。
#[derive(Debug, Error)]
pub enum TpcError {
    /// 客户端请求无效，应以同步响应拒绝。
    #[error("{message}")]
    BadRequest { status: u16, message: String },
    /// 网络引擎错误。
    #[error("{0}")]
    Transport(#[from] TransportError),
    /// 本地有序流错误。
    #[error("{0}")]
    Stream(#[from] StreamError),
    /// 段级错误。
    #[error("{0}")]
    Segment(#[from] SegmentError),
    /// 无法向客户端发送响应。
    #[error("failed to send response to the TPC client: {0}")]
    Response(#[source] io::Error),
    /// 远端没有提供文件大小，多流传输无法规划块。
    #[error("Remote side did not advertise a content length")]
    MissingContentLength,
    /// 配置无效。
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// TPC 引擎的配置选项。
#[derive(Debug, Clone)]
pub struct TpcConfig {
    /// 两次性能标记（Perf Marker）之间的间隔。
    pub marker_period: Duration,
    /// 每个段负责的块大小，同时也是每个重排缓冲条目的容量。
    pub block_size: usize,
    /// 每个流上同时排队的请求数。并发度 = 流数 × 该倍数。
    pub pipelining_multiplier: usize,
    /// 客户端可请求的最大流数。
    pub max_streams: usize,
    /// 在收到第一个字节之前允许的最长静默时间。
    pub first_timeout: Duration,
    /// 收到数据之后，两次进展之间允许的最长静默时间。
    pub timeout: Duration,
    /// 每个网络句柄的事件信道容量，决定单个段最多预读多少个网络块。
    pub channel_capacity: usize,
    /// 发往远端的 User-Agent。
    pub user_agent: String,
}

impl Default for TpcConfig {
    /// 提供一组合理的默认配置。
    fn default() -> Self {
        Self {
            marker_period: Duration::from_secs(5),
            block_size: 16 * 1024 * 1024, // 16 MiB
            pipelining_multiplier: 1,
            max_streams: 100,
            first_timeout: Duration::from_secs(120),
            timeout: Duration::from_secs(60),
            channel_capacity: 8,
            user_agent: concat!("http-tpc/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl TpcConfig {
    /// 检查配置是否可用。
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(TpcError::Config("block_size must be positive".into()));
        }
        if self.pipelining_multiplier == 0 {
            return Err(TpcError::Config(
                "pipelining_multiplier must be positive".into(),
            ));
        }
        if self.marker_period.is_zero() {
            return Err(TpcError::Config("marker_period must be positive".into()));
        }
        if self.channel_capacity == 0 {
            return Err(TpcError::Config("channel_capacity must be positive".into()));
        }
        Ok(())
    }

    /// 计算给定流数下的并发句柄数。
    pub fn concurrency(&self, streams: usize) -> usize {
        streams.max(1) * self.pipelining_multiplier
    }
}

/// 进程级的传输编号生成器，用于在日志和监控中关联同一次传输。
///
/// 以显式对象的形式注入，而不是隐藏的全局单例，测试可以随时重置。
#[derive(Debug, Default)]
pub struct TransferIds {
    next: AtomicU64,
}

impl TransferIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取出下一个编号。
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// 将计数器恢复为 0。
    pub fn reset(&self) {
        self.next.store(0, Ordering::SeqCst);
    }
}

/// 一次传输的最终结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    /// 传输是否成功。
    pub success: bool,
    /// 发送给客户端的最终消息，例如 `success: Created` 或 `failure: ...`。
    pub message: String,
    /// 已经完成的正文字节数（所有段之和）。
    pub bytes_transferred: u64,
    /// 远端返回的第一个失败状态码（若有）。
    pub remote_status: Option<i32>,
    /// 是否已经开始了分块响应。为 `false` 时，结果是以同步响应发送的。
    pub chunked: bool,
}

impl TransferOutcome {
    pub(crate) fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            bytes_transferred: 0,
            remote_status: Some(i32::from(status)),
            chunked: false,
        }
    }
}
