//! 定义和管理单个传输段（segment）的状态。
//!
//! 一个段对应一个网络句柄上正在进行的范围请求。网络引擎逐行交付响应头、
//! 逐块交付正文，驱动循环在同一个任务里调用 `on_header_line` / `on_body_bytes`，
//! 因此这里不需要任何同步。

use crate::stream::{OrderedStream, StorageFile};
use crate::types::{HandleId, SegmentError, StreamError, TransferMode, ERROR_TEXT_CAP};
use faststr::FastStr;
use log::{debug, trace, warn};
use std::sync::Arc;

/// 响应头的解析进度。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderParseState {
    AwaitingStatusLine,
    AwaitingHeaders,
    HeadersComplete,
}

/// HTTP 方法。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Head,
    Get,
    Put,
}

/// 网络句柄的请求配置，在一次传输的所有段之间共享。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTemplate {
    /// 远端 URL。
    pub url: FastStr,
    /// 需要转发给远端的请求头（例如 `Copy-Header` 的内容）。
    pub headers: Vec<(FastStr, FastStr)>,
    /// 传输方向。
    pub mode: TransferMode,
}

impl RequestTemplate {
    pub fn new(url: impl Into<FastStr>, mode: TransferMode) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            mode,
        }
    }

    /// 追加一个请求头。
    pub fn with_header(mut self, name: impl Into<FastStr>, value: impl Into<FastStr>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// 用于探测远端文件大小的 HEAD 请求。
    pub fn probe_request(&self) -> RangeRequest {
        RangeRequest {
            method: Method::Head,
            url: self.url.clone(),
            headers: self.headers.clone(),
            range: None,
            upload_length: None,
        }
    }
}

/// 交给网络引擎执行的一次请求。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRequest {
    pub method: Method,
    pub url: FastStr,
    pub headers: Vec<(FastStr, FastStr)>,
    /// 闭区间 `[start, end]`；`None` 表示整个资源。
    pub range: Option<(u64, u64)>,
    /// 上传请求的正文长度。
    pub upload_length: Option<u64>,
}

impl RangeRequest {
    /// `Range` 请求头的值。
    pub fn range_header(&self) -> Option<String> {
        self.range.map(|(start, end)| format!("bytes={start}-{end}"))
    }
}

/// 一个网络句柄上的传输状态。
#[derive(Debug)]
pub struct Segment {
    id: HandleId,
    template: Arc<RequestTemplate>,
    start_offset: u64,
    length: u64,
    bytes_transferred: u64,
    status_code: i32,
    content_length: i64,
    parse_state: HeaderParseState,
    error_text: Vec<u8>,
    /// 有序流暂时无法接收、等待下一轮重试的数据。
    pending: Option<bytes::Bytes>,
}

impl Segment {
    /// 创建主段（第一个网络句柄）。
    pub fn new(id: HandleId, template: RequestTemplate) -> Self {
        Self::with_template(id, Arc::new(template))
    }

    fn with_template(id: HandleId, template: Arc<RequestTemplate>) -> Self {
        Self {
            id,
            template,
            start_offset: 0,
            length: 0,
            bytes_transferred: 0,
            status_code: -1,
            content_length: -1,
            parse_state: HeaderParseState::AwaitingStatusLine,
            error_text: Vec::new(),
            pending: None,
        }
    }

    /// 复制网络句柄的配置（URL、请求头），但不复制任何瞬时状态。
    pub fn duplicate(&self, id: HandleId) -> Self {
        trace!("[Segment {}] 复制为新的段 {}。", self.id, id);
        Self::with_template(id, Arc::clone(&self.template))
    }

    /// 为下一次请求分配字节窗口 `[offset, offset + size)`。
    pub fn set_transfer_parameters(&mut self, offset: u64, size: u64) -> Result<(), SegmentError> {
        if size == 0 {
            return Err(SegmentError::ProtocolViolation(
                "segment window must not be empty".into(),
            ));
        }
        self.reset_after_request();
        self.start_offset = offset;
        self.length = size;
        debug!(
            "[Segment {}] 分配窗口: {}-{}。",
            self.id,
            offset,
            offset + size - 1
        );
        Ok(())
    }

    /// 清空一次请求结束后的瞬时状态，使句柄可以被复用。
    pub fn reset_after_request(&mut self) {
        self.bytes_transferred = 0;
        self.status_code = -1;
        self.content_length = -1;
        self.parse_state = HeaderParseState::AwaitingStatusLine;
        self.error_text.clear();
        self.pending = None;
    }

    /// 当前窗口对应的网络请求。
    pub fn request(&self) -> RangeRequest {
        match self.template.mode {
            TransferMode::Pull => RangeRequest {
                method: Method::Get,
                url: self.template.url.clone(),
                headers: self.template.headers.clone(),
                range: Some((self.start_offset, self.start_offset + self.length - 1)),
                upload_length: None,
            },
            TransferMode::Push => RangeRequest {
                method: Method::Put,
                url: self.template.url.clone(),
                headers: self.template.headers.clone(),
                range: None,
                upload_length: Some(self.length),
            },
        }
    }

    /// 处理一行响应头。
    ///
    /// 第一行必须是状态行；之后的行用于提取 `Content-Length`；空行表示响应头结束。
    /// 若响应头已经结束又收到新的行（例如重定向后的第二个响应），解析重新开始。
    pub fn on_header_line(&mut self, line: &str) -> Result<(), SegmentError> {
        if self.parse_state == HeaderParseState::HeadersComplete {
            trace!("[Segment {}] 收到新的响应，重新解析响应头。", self.id);
            self.status_code = -1;
            self.content_length = -1;
            self.parse_state = HeaderParseState::AwaitingStatusLine;
        }

        let line = line.trim_end_matches(&['\r', '\n'][..]);
        if self.parse_state == HeaderParseState::AwaitingStatusLine {
            let code = parse_status_line(line).ok_or_else(|| {
                warn!("[Segment {}] 无法解析状态行: {:?}", self.id, line);
                SegmentError::ProtocolViolation(format!("malformed status line: {line:?}"))
            })?;
            debug!("[Segment {}] 状态码: {}。", self.id, code);
            self.status_code = code;
            self.parse_state = HeaderParseState::AwaitingHeaders;
        } else if line.is_empty() {
            self.parse_state = HeaderParseState::HeadersComplete;
        } else if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                if let Ok(len) = value.trim().parse::<i64>() {
                    self.content_length = len;
                }
            }
        }
        Ok(())
    }

    /// 处理一块正文数据，返回已消费的字节数。
    ///
    /// 成功响应的数据写入有序流，可能只被部分接受（背压）；
    /// 失败响应（>= 400）的数据记入错误文本，满 1024 字节后拒绝并中止请求。
    pub fn on_body_bytes<F: StorageFile>(
        &mut self,
        stream: &mut OrderedStream<F>,
        data: &[u8],
    ) -> Result<usize, SegmentError> {
        if self.status_code < 0 {
            return Err(SegmentError::ProtocolViolation(
                "body received before status line".into(),
            ));
        }
        if self.status_code >= 400 {
            let room = ERROR_TEXT_CAP - self.error_text.len();
            let take = room.min(data.len());
            self.error_text.extend_from_slice(&data[..take]);
            if take < data.len() || self.error_text.len() >= ERROR_TEXT_CAP {
                return Err(SegmentError::RemoteStatus {
                    code: self.status_code,
                });
            }
            return Ok(take);
        }
        // 范围请求只接受 206；其它成功状态意味着服务器忽略了 Range。
        if self.template.mode == TransferMode::Pull && self.status_code != 206 {
            return Err(SegmentError::ProtocolViolation(format!(
                "expected 206 Partial Content for a ranged request, got status {}",
                self.status_code
            )));
        }

        let remaining = self.length - self.bytes_transferred;
        if data.len() as u64 > remaining {
            return Err(SegmentError::ProtocolViolation(format!(
                "response exceeds requested range by {} bytes",
                data.len() as u64 - remaining
            )));
        }
        if self.content_length >= 0
            && self.bytes_transferred + data.len() as u64 > self.content_length as u64
        {
            return Err(SegmentError::ProtocolViolation(
                "response body longer than its Content-Length".into(),
            ));
        }

        let offset = self.start_offset + self.bytes_transferred;
        let accepted = stream
            .write(offset, data, false)
            .map_err(|e| storage_error(stream, e))?;
        self.bytes_transferred += accepted as u64;
        Ok(accepted)
    }

    /// 推送模式：从本地文件读出下一块要上传的数据。
    pub fn on_read_request<F: StorageFile>(
        &mut self,
        stream: &mut OrderedStream<F>,
        buf: &mut [u8],
    ) -> Result<usize, SegmentError> {
        let remaining = (self.length - self.bytes_transferred).min(buf.len() as u64) as usize;
        if remaining == 0 {
            return Ok(0);
        }
        let offset = self.start_offset + self.bytes_transferred;
        let n = stream
            .read(offset, &mut buf[..remaining])
            .map_err(|e| storage_error(stream, e))?;
        if n == 0 {
            return Err(SegmentError::Storage(format!(
                "unexpected end of file at offset {offset}"
            )));
        }
        self.bytes_transferred += n as u64;
        Ok(n)
    }

    /// 存放暂时无法写入的数据。
    pub fn set_pending(&mut self, data: bytes::Bytes) {
        self.pending = if data.is_empty() { None } else { Some(data) };
    }

    pub fn take_pending(&mut self) -> Option<bytes::Bytes> {
        self.pending.take()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// 是否正在接收正文：已收到数据但尚未收齐。
    pub fn is_body_in_progress(&self) -> bool {
        self.bytes_transferred > 0 && self.bytes_transferred as i64 != self.content_length
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn template(&self) -> &RequestTemplate {
        &self.template
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn status_code(&self) -> i32 {
        self.status_code
    }

    pub fn content_length(&self) -> i64 {
        self.content_length
    }

    pub fn parse_state(&self) -> HeaderParseState {
        self.parse_state
    }

    /// 捕获到的远端错误正文。
    pub fn error_text(&self) -> String {
        String::from_utf8_lossy(&self.error_text).into_owned()
    }
}

fn storage_error<F: StorageFile>(stream: &OrderedStream<F>, e: StreamError) -> SegmentError {
    SegmentError::Storage(
        stream
            .error_message()
            .map(str::to_owned)
            .unwrap_or_else(|| e.to_string()),
    )
}

/// 解析 `PROTOCOL STATUS_CODE reason` 形式的状态行，返回状态码。
fn parse_status_line(line: &str) -> Option<i32> {
    let mut parts = line.split_whitespace();
    let protocol = parts.next()?;
    if !protocol.starts_with("HTTP/") {
        return None;
    }
    let code = parts.next()?;
    if code.len() != 3 {
        return None;
    }
    code.parse::<i32>().ok().filter(|c| (100..=999).contains(c))
}
