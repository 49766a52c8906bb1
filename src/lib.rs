//! HTTP 第三方复制（TPC）的多流传输引擎。
//!
//! 收到 COPY 请求后，服务器自己作为 HTTP 客户端从远端拉取文件（或向远端推送文件），
//! 并在传输过程中以分块响应的形式定期向发起请求的客户端报告进度。
//!
//! # 核心特性
//!
//! - **多流拉取**：把文件切分成固定大小的块，由多个并发的范围请求同时下载。
//! - **有序落盘**：各段乱序到达的数据先进入有界的重排缓冲池，按文件顺序整块写入本地文件。
//! - **背压与准入控制**：缓冲池用尽时暂停网络句柄，而不是阻塞或无限缓冲；
//!   只有预留足够的缓冲条目后才会启动新段。
//! - **进度报告**：定期发送性能标记（Perf Marker），最后以 `success: Created`
//!   或 `failure: <原因>` 结束响应。
//! - **打包标记**：可选地为传输使用的每个套接字绑定打包标记句柄。
//!
//! # 架构
//!
//! 整个传输在一个驱动任务里协作式地运行，段和缓冲区的状态只由这个任务修改，无需任何锁。
//!
//! - **`TpcHandler`**: 入口，解析请求头并启动驱动循环。
//! - **`DriveLoop`**: 推进网络引擎、收割完成的段、派发新段、发送性能标记。
//! - **`TransferOrchestrator`**: 管理段池和空闲/活动句柄，执行准入控制。
//! - **`Segment`**: 一个网络句柄上的范围请求状态。
//! - **`OrderedStream`**: 重排缓冲池，把数据按顺序提交到本地文件。
//! - **`Transport`**: 网络引擎抽象，默认实现为基于 `reqwest` 的 `ReqwestTransport`。
//!
//! # 使用示例
//!
//! ```rust,no_run
//! use http_tpc::{ChannelSink, ReqwestTransport, SecurityEntity, TpcConfig, TpcHandler};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let handler = TpcHandler::new(TpcConfig::default())?;
//!     let headers = [
//!         ("Source", "https://remote.example/data.bin"),
//!         ("X-Number-Of-Streams", "4"),
//!     ];
//!     let request = match handler.parse_request(
//!         "/store/data.bin",
//!         "",
//!         headers,
//!         SecurityEntity::default(),
//!     ) {
//!         Ok(request) => request,
//!         Err(e) => {
//!             let (mut sink, _rx) = ChannelSink::channel();
//!             handler.reject(&e, &mut sink)?;
//!             return Ok(());
//!         }
//!     };
//!
//!     let file = std::fs::File::create("data.bin")?;
//!     let mut transport = ReqwestTransport::new(handler.config())?;
//!     let (mut sink, mut rx) = ChannelSink::channel();
//!     tokio::spawn(async move {
//!         while let Some(chunk) = rx.recv().await {
//!             println!("{:?}", chunk);
//!         }
//!     });
//!
//!     let outcome = handler
//!         .process(&request, file, &mut transport, &mut sink)
//!         .await?;
//!     println!("{}", outcome.message);
//!     Ok(())
//! }
//! ```

mod drive;
mod handler;
mod http;
mod marker;
mod orchestrator;
mod pmark;
mod segment;
mod stream;
mod throttle;
mod transport;
mod types;

// --- 公共 API 导出 ---

// 入口。
pub use handler::{TpcHandler, TpcRequest};
// 驱动循环和编排器，供需要自行组装传输的调用方使用。
pub use drive::{DriveLoop, DrivePhase};
pub use orchestrator::{Delivery, TransferOrchestrator};
// 网络引擎。
pub use http::ReqwestTransport;
pub use transport::{SizeProbe, Transport, TransportEvent};
// 重新导出 `reqwest`，允许用户提供自定义的 `ClientBuilder`。
pub use reqwest;
// 段与有序流。
pub use segment::{HeaderParseState, Method, RangeRequest, RequestTemplate, Segment};
pub use stream::{BufferEntry, OrderedStream, StorageFile};
pub use throttle::{Throttle, ThrottledFile, Unlimited};
// 客户端响应与打包标记。
pub use marker::{format_perf_marker, ChannelSink, ResponseChunk, ResponseSink};
pub use pmark::{MarkContext, MarkHandle, PacketMarker, SocketFd, SocketMarkBinder};
// 公共类型。
pub use types::{
    HandleId, Result, SecurityEntity, SegmentError, StreamError, TpcConfig, TpcError,
    TransferIds, TransferMode, TransferOutcome, TransportError, ERROR_TEXT_CAP,
};
