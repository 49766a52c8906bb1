//! 网络引擎的抽象。
//!
//! 引擎同时执行多个请求，但只通过非阻塞的 `poll_event` 把结果交给驱动循环，
//! 唯一的挂起点是 `wait`。所有段和缓冲区的状态都只在驱动任务里被修改。

use crate::pmark::SocketFd;
use crate::segment::RangeRequest;
use crate::types::{HandleId, TransportError};
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;

/// 网络引擎交付给驱动循环的事件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// 一行响应头（包括状态行和结尾的空行）。
    Header { handle: HandleId, line: String },
    /// 一块响应正文。
    Body { handle: HandleId, data: Bytes },
    /// 请求结束。`Err` 携带引擎给出的错误描述。
    Done {
        handle: HandleId,
        result: Result<(), String>,
    },
    /// 引擎为某个句柄打开了一个套接字。
    SocketOpened {
        handle: HandleId,
        fd: SocketFd,
        addr: SocketAddr,
    },
    /// 引擎即将关闭一个套接字。
    SocketClosing { handle: HandleId, fd: SocketFd },
}

impl TransportEvent {
    pub fn handle(&self) -> HandleId {
        match self {
            TransportEvent::Header { handle, .. }
            | TransportEvent::Body { handle, .. }
            | TransportEvent::Done { handle, .. }
            | TransportEvent::SocketOpened { handle, .. }
            | TransportEvent::SocketClosing { handle, .. } => *handle,
        }
    }
}

/// 远端文件大小探测的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeProbe {
    pub status: u16,
    pub content_length: Option<u64>,
}

/// 多路复用的网络引擎。
///
/// 注册句柄即开始请求；暂停的句柄不再交付事件；移除句柄会取消仍在进行的请求。
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// 注册句柄并开始执行请求。
    fn add(&mut self, handle: HandleId, request: RangeRequest) -> Result<(), TransportError>;

    /// 注销句柄；若请求仍在进行则取消。
    fn remove(&mut self, handle: HandleId) -> Result<(), TransportError>;

    /// 暂停句柄：在 `resume` 之前不再交付它的事件。
    fn pause(&mut self, handle: HandleId);

    fn resume(&mut self, handle: HandleId);

    /// 非阻塞地取出一个就绪事件。
    fn poll_event(&mut self) -> Option<TransportEvent>;

    /// 推送模式：为句柄的上传正文提供下一块数据。
    ///
    /// 返回 `false` 表示引擎暂时无法接收，调用方应在下一轮重试。
    fn upload(&mut self, handle: HandleId, data: Bytes) -> Result<bool, TransportError>;

    /// 有界等待，直到可能有新事件或超时。返回是否被唤醒。
    async fn wait(&mut self, timeout: Duration) -> Result<bool, TransportError>;

    /// 探测远端文件大小。
    async fn probe_size(&mut self, request: RangeRequest) -> Result<SizeProbe, TransportError>;
}
