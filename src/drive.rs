//! 驱动循环：推进网络引擎、收割完成的段、派发新段，并定期向客户端发送性能标记。
//!
//! 整个传输在一个任务里协作式地运行。每一轮依次执行：
//! 1. 到期时发送性能标记并检查停滞；
//! 2. 非阻塞地取出网络事件，交给段处理；
//! 3. 重试挂起的数据；任何失败都进入排空阶段；
//! 4. 活动段不足且仍有字节未派发时启动新段；
//! 5. 有界等待，等待时间不超过下一次标记的截止时间。这是唯一的挂起点。

use crate::marker::{format_perf_marker, ResponseSink};
use crate::orchestrator::TransferOrchestrator;
use crate::pmark::SocketMarkBinder;
use crate::segment::{RequestTemplate, Segment};
use crate::stream::{OrderedStream, StorageFile};
use crate::transport::{Transport, TransportEvent};
use crate::types::{Result, SegmentError, TpcConfig, TpcError, TransferMode, TransferOutcome};
use bytes::Bytes;
use log::{debug, error, info, trace, warn};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// 每轮最多处理的网络事件数，避免长时间错过标记的截止时间。
const MAX_EVENTS_PER_TICK: usize = 256;

/// 推送模式下每次从本地文件读取的字节数。
const UPLOAD_CHUNK_SIZE: usize = 1024 * 1024;

/// 驱动循环所处的阶段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrivePhase {
    /// 探测大小、创建段和缓冲池、开始分块响应。
    Starting,
    /// 正常传输。
    Running,
    /// 不再派发新段，取消仍在进行的请求。
    Draining,
    /// 已发送最终分块。
    Terminal { success: bool },
}

/// 性能标记的节拍和停滞检测。
struct MarkerClock {
    period: Duration,
    next: Instant,
    first_timeout: Duration,
    timeout: Duration,
    last_advance_bytes: u64,
    last_advance_time: Instant,
    received_any: bool,
}

impl MarkerClock {
    fn new(config: &TpcConfig) -> Self {
        let now = Instant::now();
        Self {
            period: config.marker_period,
            // 第一个标记在开始时立即发送。
            next: now,
            first_timeout: config.first_timeout,
            timeout: config.timeout,
            last_advance_bytes: 0,
            last_advance_time: now,
            received_any: false,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        now >= self.next
    }

    /// 记录标记时刻的进度。停滞时返回生效的超时时间。
    fn tick(&mut self, now: Instant, bytes: u64) -> Option<Duration> {
        if bytes > self.last_advance_bytes {
            self.last_advance_bytes = bytes;
            self.last_advance_time = now;
            self.received_any = true;
        }
        self.next += self.period;
        if self.next <= now {
            self.next = now + self.period;
        }
        let timeout = if self.received_any {
            self.timeout
        } else {
            self.first_timeout
        };
        (now.duration_since(self.last_advance_time) > timeout).then_some(timeout)
    }

    fn until_next(&self) -> Duration {
        self.next.saturating_duration_since(Instant::now())
    }
}

fn stall_error(timeout: Duration) -> SegmentError {
    SegmentError::Transport(format!(
        "Transfer failed because no bytes have been received in {} seconds.",
        timeout.as_secs()
    ))
}

/// `Remote side failed with status code N; error message: "..."`
fn remote_failure_message(code: i32, text: &str) -> String {
    let mut message = format!("failure: Remote side failed with status code {code}");
    if !text.is_empty() {
        message.push_str(&format!("; error message: \"{}\"", text.replace('\n', " ")));
    }
    message
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// 一次传输的驱动循环。
pub struct DriveLoop<'a, T: Transport, S: ResponseSink> {
    id: u64,
    config: &'a TpcConfig,
    transport: &'a mut T,
    sink: &'a mut S,
    binder: SocketMarkBinder,
    phase: DrivePhase,
}

impl<'a, T: Transport, S: ResponseSink> DriveLoop<'a, T, S> {
    pub fn new(
        id: u64,
        config: &'a TpcConfig,
        transport: &'a mut T,
        sink: &'a mut S,
        binder: SocketMarkBinder,
    ) -> Self {
        Self {
            id,
            config,
            transport,
            sink,
            binder,
            phase: DrivePhase::Starting,
        }
    }

    pub fn phase(&self) -> DrivePhase {
        self.phase
    }

    fn set_phase(&mut self, phase: DrivePhase) {
        if self.phase != phase {
            debug!("[DriveLoop {}] {:?} -> {:?}", self.id, self.phase, phase);
            self.phase = phase;
        }
    }

    /// 以同步响应拒绝传输。
    fn reject(&mut self, status: u16, message: String) -> Result<TransferOutcome> {
        warn!("[DriveLoop {}] 拒绝传输: {} {}", self.id, status, message);
        self.sink
            .send_simple(status, &message)
            .map_err(TpcError::Response)?;
        self.set_phase(DrivePhase::Terminal { success: false });
        Ok(TransferOutcome::rejected(status, message))
    }

    fn start_response(&mut self) -> Result<()> {
        self.sink
            .start_chunked(201, "Created", &[("Content-Type", "text/plain")])
            .map_err(|e| {
                error!("[DriveLoop {}] 无法开始分块响应: {}", self.id, e);
                TpcError::Response(e)
            })?;
        self.binder.start_transfer();
        self.set_phase(DrivePhase::Running);
        Ok(())
    }

    fn send_marker(&mut self, bytes: u64) -> Result<()> {
        trace!("[DriveLoop {}] 发送性能标记: {} 字节。", self.id, bytes);
        self.sink
            .send_chunk(&format_perf_marker(unix_timestamp(), bytes))
            .map_err(|e| {
                error!("[DriveLoop {}] 无法发送性能标记: {}", self.id, e);
                TpcError::Response(e)
            })
    }

    fn finish_response(&mut self, success: bool, message: &str) -> Result<()> {
        if success {
            info!("[DriveLoop {}] 传输成功。", self.id);
        } else {
            error!("[DriveLoop {}] 传输失败: {}", self.id, message);
        }
        self.sink.send_chunk(message).map_err(TpcError::Response)?;
        self.sink.finish().map_err(TpcError::Response)?;
        self.set_phase(DrivePhase::Terminal { success });
        Ok(())
    }

    fn on_socket_event(&mut self, event: &TransportEvent) {
        match *event {
            TransportEvent::SocketOpened { fd, addr, .. } => {
                if self.binder.register_socket(fd, addr) {
                    self.binder.begin_marking();
                }
            }
            TransportEvent::SocketClosing { fd, .. } => self.binder.end_marking(fd),
            _ => {}
        }
    }

    /// 拉取模式：从远端并行下载到本地文件。
    pub async fn run_pull<F: StorageFile>(
        &mut self,
        template: RequestTemplate,
        streams: usize,
        file: F,
    ) -> Result<TransferOutcome> {
        self.set_phase(DrivePhase::Starting);
        let probe = match self.transport.probe_size(template.probe_request()).await {
            Ok(probe) => probe,
            Err(e) => return self.reject(500, e.to_string()),
        };
        if probe.status >= 400 {
            return self.reject(
                500,
                format!("Remote side failed with status code {}", probe.status),
            );
        }
        let Some(total) = probe.content_length else {
            return self.reject(500, TpcError::MissingContentLength.to_string());
        };

        let concurrency = self.config.concurrency(streams);
        let block_size = self.config.block_size as u64;
        info!(
            "[DriveLoop {}] 拉取 {}: {} 字节，{} 个流，并发 {}，块大小 {}。",
            self.id, template.url, total, streams, concurrency, block_size
        );
        let stream = OrderedStream::new(file, concurrency, self.config.block_size);
        let mut orch = TransferOrchestrator::new(template, concurrency, stream);
        self.start_response()?;

        let mut clock = MarkerClock::new(self.config);
        let mut running = 0;
        let mut current_offset = 0;
        self.start_more(&mut orch, &mut current_offset, total, &mut running);

        while !orch.has_failed() {
            let now = Instant::now();
            if clock.is_due(now) {
                let bytes = orch.bytes_transferred();
                self.send_marker(bytes)?;
                if let Some(timeout) = clock.tick(now, bytes) {
                    warn!("[DriveLoop {}] {} 秒内没有收到任何数据。", self.id, timeout.as_secs());
                    orch.set_error(stall_error(timeout));
                    break;
                }
            }

            self.harvest(&mut orch);
            orch.retry_pending(&mut *self.transport);
            if orch.has_failed() {
                break;
            }

            if orch.active_count() < concurrency && current_offset < total {
                running = orch.active_count();
                self.start_more(&mut orch, &mut current_offset, total, &mut running);
            }
            if orch.active_count() == 0 && current_offset == total {
                break;
            }

            let wait = clock.until_next();
            if !wait.is_zero() {
                if let Err(e) = self.transport.wait(wait).await {
                    orch.set_error(SegmentError::Transport(e.to_string()));
                }
            }
        }

        self.set_phase(DrivePhase::Draining);
        orch.cancel_all(&mut *self.transport);
        self.binder.end_all();

        if let Err(e) = orch.flush(true) {
            let message = orch
                .stream()
                .error_message()
                .map(str::to_owned)
                .unwrap_or_else(|| e.to_string());
            orch.set_error(SegmentError::Storage(message));
        }

        let bytes_transferred = orch.bytes_transferred();
        let remote_status = orch.remote_failure().map(|(code, _)| code);
        let (success, message) = if let Some((code, text)) = orch.remote_failure() {
            (false, remote_failure_message(code, text))
        } else if let Some(e) = orch.error() {
            (false, format!("failure: {e}"))
        } else if current_offset != total {
            (
                false,
                format!(
                    "failure: Internal logic error led to early abort; current offset is {current_offset} while full size is {total}"
                ),
            )
        } else {
            match orch.finalize() {
                Ok(()) => (true, "success: Created".to_string()),
                Err(e) => {
                    error!("[DriveLoop {}] 无法关闭文件: {}", self.id, e);
                    (
                        false,
                        "failure: Failed to finalize and close file handle.".to_string(),
                    )
                }
            }
        };
        self.finish_response(success, &message)?;
        Ok(TransferOutcome {
            success,
            message,
            bytes_transferred,
            remote_status,
            chunked: true,
        })
    }

    /// 派发新段。引擎拒绝注册时记为传输失败。
    fn start_more<F: StorageFile>(
        &mut self,
        orch: &mut TransferOrchestrator<F>,
        current_offset: &mut u64,
        total: u64,
        running: &mut usize,
    ) {
        let block_size = self.config.block_size as u64;
        match orch.start_transfers(
            &mut *self.transport,
            *current_offset,
            total,
            block_size,
            running,
        ) {
            Ok(offset) => *current_offset = offset,
            Err(e) => orch.set_error(SegmentError::Transport(e.to_string())),
        }
    }

    /// 取出本轮就绪的网络事件并分发。出现失败时提前结束。
    fn harvest<F: StorageFile>(&mut self, orch: &mut TransferOrchestrator<F>) {
        for _ in 0..MAX_EVENTS_PER_TICK {
            let Some(event) = self.transport.poll_event() else {
                break;
            };
            match event {
                TransportEvent::Header { handle, line } => {
                    orch.on_header(&mut *self.transport, handle, &line);
                }
                TransportEvent::Body { handle, data } => {
                    orch.on_body(&mut *self.transport, handle, data);
                }
                TransportEvent::Done { handle, result } => {
                    // 错误已由编排器记录。
                    let _ = orch.finish_segment(&mut *self.transport, handle, result);
                }
                socket => self.on_socket_event(&socket),
            }
            if orch.has_failed() {
                break;
            }
        }
    }

    /// 推送模式：把本地文件以单个流上传到远端。
    pub async fn run_push<F: StorageFile>(
        &mut self,
        template: RequestTemplate,
        file: F,
    ) -> Result<TransferOutcome> {
        self.set_phase(DrivePhase::Starting);
        let mut stream = OrderedStream::new(file, 0, 0);
        let size = match stream.file_size() {
            Ok(size) => size,
            Err(e) => {
                return self.reject(500, format!("Failed to determine local file size: {e}"))
            }
        };
        let template = RequestTemplate {
            mode: TransferMode::Push,
            ..template
        };
        let mut segment = Segment::new(0, template);
        if size > 0 {
            segment.set_transfer_parameters(0, size)?;
        }
        info!(
            "[DriveLoop {}] 推送 {} 字节到 {}。",
            self.id,
            size,
            segment.template().url
        );
        self.start_response()?;

        let mut uploaded = 0;
        let result = match self.transport.add(0, segment.request()) {
            Ok(()) => {
                self.pump_upload(&mut segment, &mut stream, size, &mut uploaded)
                    .await?
            }
            Err(e) => Err(SegmentError::Transport(e.to_string())),
        };

        self.set_phase(DrivePhase::Draining);
        if let Err(e) = self.transport.remove(0) {
            debug!("[DriveLoop {}] 注销上传句柄: {}", self.id, e);
        }
        self.binder.end_all();

        let (success, message, remote_status) = match result {
            Ok(()) if uploaded == size => (true, "success: Created".to_string(), None),
            Ok(()) => (
                false,
                format!(
                    "failure: Internal logic error led to early abort; current offset is {uploaded} while full size is {size}"
                ),
                None,
            ),
            Err(SegmentError::RemoteStatus { code }) => (
                false,
                remote_failure_message(code, &segment.error_text()),
                Some(code),
            ),
            Err(e) => (false, format!("failure: {e}"), None),
        };
        self.finish_response(success, &message)?;
        Ok(TransferOutcome {
            success,
            message,
            bytes_transferred: uploaded,
            remote_status,
            chunked: true,
        })
    }

    /// 推送模式的主循环：读文件、喂给上传信道、处理响应，直到请求结束。
    ///
    /// `uploaded` 只统计网络引擎已经接收的字节。
    async fn pump_upload<F: StorageFile>(
        &mut self,
        segment: &mut Segment,
        stream: &mut OrderedStream<F>,
        size: u64,
        uploaded: &mut u64,
    ) -> Result<std::result::Result<(), SegmentError>> {
        let mut clock = MarkerClock::new(self.config);
        let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE.min(size as usize).max(1)];
        let mut queued: Option<Bytes> = None;

        loop {
            let now = Instant::now();
            if clock.is_due(now) {
                self.send_marker(*uploaded)?;
                if let Some(timeout) = clock.tick(now, *uploaded) {
                    return Ok(Err(stall_error(timeout)));
                }
            }

            // 尽量把上传信道填满。
            loop {
                let data = match queued.take() {
                    Some(data) => data,
                    None if segment.bytes_transferred() < size => {
                        match segment.on_read_request(stream, &mut buf) {
                            Ok(n) => Bytes::copy_from_slice(&buf[..n]),
                            Err(e) => return Ok(Err(e)),
                        }
                    }
                    None => break,
                };
                match self.transport.upload(0, data.clone()) {
                    Ok(true) => *uploaded += data.len() as u64,
                    Ok(false) => {
                        queued = Some(data);
                        break;
                    }
                    Err(e) => return Ok(Err(SegmentError::Transport(e.to_string()))),
                }
            }

            for _ in 0..MAX_EVENTS_PER_TICK {
                let Some(event) = self.transport.poll_event() else {
                    break;
                };
                match event {
                    TransportEvent::Header { line, .. } => {
                        if let Err(e) = segment.on_header_line(&line) {
                            return Ok(Err(e));
                        }
                    }
                    TransportEvent::Body { data, .. } => {
                        // 成功响应的正文被丢弃，失败响应的正文记为错误文本。
                        if segment.status_code() >= 400 {
                            if let Err(e) = segment.on_body_bytes(stream, &data) {
                                return Ok(Err(e));
                            }
                        }
                    }
                    TransportEvent::Done { result, .. } => {
                        return Ok(upload_result(segment.status_code(), result));
                    }
                    socket => self.on_socket_event(&socket),
                }
            }

            let wait = clock.until_next();
            if !wait.is_zero() {
                if let Err(e) = self.transport.wait(wait).await {
                    return Ok(Err(SegmentError::Transport(e.to_string())));
                }
            }
        }
    }
}

/// 上传请求结束时，根据状态码和引擎结果判断请求本身是否成功。
fn upload_result(
    status: i32,
    result: std::result::Result<(), String>,
) -> std::result::Result<(), SegmentError> {
    if status >= 400 {
        return Err(SegmentError::RemoteStatus { code: status });
    }
    result.map_err(SegmentError::Transport)?;
    if status < 0 {
        return Err(SegmentError::ProtocolViolation(
            "request finished without a response".into(),
        ));
    }
    if !(200..300).contains(&status) {
        return Err(SegmentError::ProtocolViolation(format!(
            "unexpected status code {status} in response to the upload"
        )));
    }
    Ok(())
}
