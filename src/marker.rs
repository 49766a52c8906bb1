//! 发往 TPC 客户端的响应：同步响应、分块响应和性能标记（Perf Marker）。

use log::{debug, trace};
use std::io;
use tokio::sync::mpsc;

/// 向 TPC 客户端写响应的外部协作者。
///
/// 一次传输要么只调用一次 `send_simple`，要么依次调用 `start_chunked`、
/// 若干次 `send_chunk` 和一次 `finish`。
pub trait ResponseSink {
    /// 开始分块响应。
    fn start_chunked(
        &mut self,
        status: u16,
        reason: &str,
        headers: &[(&str, &str)],
    ) -> io::Result<()>;

    /// 发送一个分块。
    fn send_chunk(&mut self, chunk: &str) -> io::Result<()>;

    /// 发送结束分块。
    fn finish(&mut self) -> io::Result<()>;

    /// 发送一个完整的同步响应。
    fn send_simple(&mut self, status: u16, body: &str) -> io::Result<()>;
}

/// 写入 `ChannelSink` 的响应片段。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseChunk {
    Start {
        status: u16,
        reason: String,
        headers: Vec<(String, String)>,
    },
    Chunk(String),
    End,
    Simple {
        status: u16,
        body: String,
    },
}

/// 把响应片段转发到一个 tokio 信道，由 HTTP 服务层负责真正写出。
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ResponseChunk>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<ResponseChunk>) -> Self {
        Self { tx }
    }

    /// 创建一对 sink 和接收端。
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ResponseChunk>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn send(&self, chunk: ResponseChunk) -> io::Result<()> {
        self.tx
            .send(chunk)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "TPC client went away"))
    }
}

impl ResponseSink for ChannelSink {
    fn start_chunked(
        &mut self,
        status: u16,
        reason: &str,
        headers: &[(&str, &str)],
    ) -> io::Result<()> {
        debug!("[ChannelSink] 开始分块响应: {} {}", status, reason);
        self.send(ResponseChunk::Start {
            status,
            reason: reason.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
    }

    fn send_chunk(&mut self, chunk: &str) -> io::Result<()> {
        trace!("[ChannelSink] 发送分块，{} 字节。", chunk.len());
        self.send(ResponseChunk::Chunk(chunk.to_string()))
    }

    fn finish(&mut self) -> io::Result<()> {
        self.send(ResponseChunk::End)
    }

    fn send_simple(&mut self, status: u16, body: &str) -> io::Result<()> {
        debug!("[ChannelSink] 同步响应: {} {}", status, body);
        self.send(ResponseChunk::Simple {
            status,
            body: body.to_string(),
        })
    }
}

/// 生成一条性能标记。
///
/// 字节数所在的行输出两次，与已有客户端的解析方式保持一致。
pub fn format_perf_marker(timestamp: u64, bytes_transferred: u64) -> String {
    format!(
        "Perf Marker\n\
         Timestamp: {timestamp}\n\
         Stripe Index: 0\n\
         Stripe Bytes Transferred: {bytes_transferred}\n\
         Stripe Bytes Transferred: {bytes_transferred}\n\
         Total Stripe Count: 1\n\
         End\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perf_marker_layout() {
        let marker = format_perf_marker(1_700_000_000, 4096);
        let lines: Vec<_> = marker.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Perf Marker",
                "Timestamp: 1700000000",
                "Stripe Index: 0",
                "Stripe Bytes Transferred: 4096",
                "Stripe Bytes Transferred: 4096",
                "Total Stripe Count: 1",
                "End",
            ]
        );
    }

    #[test]
    fn test_channel_sink_forwards_chunks() {
        let (mut sink, mut rx) = ChannelSink::channel();
        sink.start_chunked(201, "Created", &[("Content-Type", "text/plain")])
            .unwrap();
        sink.send_chunk("success: Created").unwrap();
        sink.finish().unwrap();
        assert!(matches!(rx.try_recv().unwrap(), ResponseChunk::Start { status: 201, .. }));
        assert_eq!(
            rx.try_recv().unwrap(),
            ResponseChunk::Chunk("success: Created".into())
        );
        assert_eq!(rx.try_recv().unwrap(), ResponseChunk::End);
    }

    #[test]
    fn test_closed_channel_is_an_io_error() {
        let (mut sink, rx) = ChannelSink::channel();
        drop(rx);
        let err = sink.send_chunk("x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
