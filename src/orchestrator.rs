//! 传输编排器：管理段池、空闲/活动句柄集合，以及何时可以启动新段的准入控制。

use crate::segment::{RequestTemplate, Segment};
use crate::stream::{OrderedStream, StorageFile};
use crate::transport::Transport;
use crate::types::{HandleId, Result, SegmentError, StreamError};
use bytes::Bytes;
use log::{debug, error, info, trace, warn};

/// 一块正文数据交付给段之后的结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// 数据已全部写入有序流。
    Accepted,
    /// 有序流只接受了一部分，剩余数据挂起，句柄已暂停。
    Paused,
    /// 段失败，句柄已被注销。
    Failed,
}

/// 多个段并行传输同一个文件时的协调者。
///
/// 每个段的句柄在任意时刻恰好属于 `idle` 或 `active` 之一。
pub struct TransferOrchestrator<F: StorageFile> {
    segments: Vec<Segment>,
    idle: Vec<HandleId>,
    active: Vec<HandleId>,
    stream: OrderedStream<F>,
    /// 已结束的请求累计的正文字节数。
    finished_bytes: u64,
    /// 第一个返回 >= 400 的状态码及其错误正文。
    remote_failure: Option<(i32, String)>,
    /// 第一个非状态码类的段错误。
    error: Option<SegmentError>,
}

impl<F: StorageFile> TransferOrchestrator<F> {
    /// 创建 `concurrency` 个段：一个主段，其余由主段复制而来。
    pub fn new(template: RequestTemplate, concurrency: usize, stream: OrderedStream<F>) -> Self {
        let concurrency = concurrency.max(1);
        let primary = Segment::new(0, template);
        let mut segments = Vec::with_capacity(concurrency);
        for id in 1..concurrency {
            segments.push(primary.duplicate(id));
        }
        segments.insert(0, primary);
        info!(
            "[Orchestrator] 已创建 {} 个段，缓冲池 {} 个条目。",
            concurrency,
            stream.buffer_count()
        );
        Self {
            segments,
            // 倒序存放，使 `pop` 先取出编号小的句柄。
            idle: (0..concurrency).rev().collect(),
            active: Vec::with_capacity(concurrency),
            stream,
            finished_bytes: 0,
            remote_failure: None,
            error: None,
        }
    }

    /// 判断现在能否启动一个新段。
    ///
    /// 每个已派发但尚未开始接收正文的段都预留一个缓冲条目；
    /// 只有在扣除这些预留之后仍有空闲条目时才允许启动。
    pub fn can_start_transfer(&self, log_reason: bool) -> bool {
        if self.idle.is_empty() {
            if log_reason {
                debug!("[Orchestrator] 没有空闲句柄。");
            }
            return false;
        }
        let in_progress = self
            .active
            .iter()
            .filter(|&&h| self.segments[h].is_body_in_progress())
            .count();
        let in_flight_without_reply = self.active.len() - in_progress;
        let available = self.stream.available_buffers() as i64;
        if available - in_flight_without_reply as i64 <= 0 {
            if log_reason {
                debug!(
                    "[Orchestrator] 缓冲区不足: 空闲条目 {}，已派发未响应 {}。",
                    available, in_flight_without_reply
                );
                self.stream.dump_buffers();
            }
            return false;
        }
        true
    }

    /// 尝试为窗口 `[offset, offset + size)` 启动一个段，返回是否启动。
    pub fn try_start_segment<T: Transport>(
        &mut self,
        transport: &mut T,
        offset: u64,
        size: u64,
    ) -> Result<bool> {
        if !self.can_start_transfer(false) {
            return Ok(false);
        }
        let Some(handle) = self.idle.pop() else {
            return Ok(false);
        };
        let segment = &mut self.segments[handle];
        if let Err(e) = segment.set_transfer_parameters(offset, size) {
            self.idle.push(handle);
            return Err(e.into());
        }
        if let Err(e) = transport.add(handle, segment.request()) {
            error!("[Orchestrator] 无法注册句柄 {}: {}", handle, e);
            segment.reset_after_request();
            self.idle.push(handle);
            return Err(e.into());
        }
        self.active.push(handle);
        trace!(
            "[Orchestrator] 句柄 {} 开始传输 {}-{}。",
            handle,
            offset,
            offset + size - 1
        );
        Ok(true)
    }

    /// 从 `current_offset` 开始按块切分并尽量多地启动段，返回新的偏移量。
    ///
    /// 每启动一个段 `running` 加一；准入失败或已到达文件末尾时停止。
    pub fn start_transfers<T: Transport>(
        &mut self,
        transport: &mut T,
        current_offset: u64,
        total: u64,
        block_size: u64,
        running: &mut usize,
    ) -> Result<u64> {
        let mut offset = current_offset;
        while offset < total {
            let size = block_size.min(total - offset);
            if !self.try_start_segment(transport, offset, size)? {
                break;
            }
            offset += size;
            *running += 1;
        }
        if offset < total && *running == 0 {
            error!(
                "[Orchestrator] 没有任何句柄能够运行: 偏移量 {} / {}。",
                offset, total
            );
            self.can_start_transfer(true);
        }
        Ok(offset)
    }

    /// 把一行响应头交给对应的段。
    pub fn on_header<T: Transport>(&mut self, transport: &mut T, handle: HandleId, line: &str) {
        if !self.is_active(handle) {
            return;
        }
        if let Err(e) = self.segments[handle].on_header_line(line) {
            self.abort_segment(transport, handle, e);
        }
    }

    /// 把一块正文交给对应的段。
    pub fn on_body<T: Transport>(
        &mut self,
        transport: &mut T,
        handle: HandleId,
        data: Bytes,
    ) -> Delivery {
        if !self.is_active(handle) {
            return Delivery::Failed;
        }
        self.deliver(transport, handle, data)
    }

    fn deliver<T: Transport>(&mut self, transport: &mut T, handle: HandleId, data: Bytes) -> Delivery {
        let segment = &mut self.segments[handle];
        match segment.on_body_bytes(&mut self.stream, &data) {
            Ok(n) if n == data.len() => Delivery::Accepted,
            Ok(n) => {
                trace!(
                    "[Orchestrator] 句柄 {} 只写入了 {}/{} 字节，暂停。",
                    handle,
                    n,
                    data.len()
                );
                segment.set_pending(data.slice(n..));
                transport.pause(handle);
                Delivery::Paused
            }
            Err(e) => {
                self.abort_segment(transport, handle, e);
                Delivery::Failed
            }
        }
    }

    /// 重试所有挂起的数据，完全写入后恢复句柄。返回恢复的句柄数。
    pub fn retry_pending<T: Transport>(&mut self, transport: &mut T) -> usize {
        let mut resumed = 0;
        for idx in 0..self.active.len() {
            let Some(&handle) = self.active.get(idx) else {
                break;
            };
            let Some(data) = self.segments[handle].take_pending() else {
                continue;
            };
            if self.deliver(transport, handle, data) == Delivery::Accepted {
                transport.resume(handle);
                resumed += 1;
            }
        }
        resumed
    }

    /// 一个请求结束：注销句柄，记录结果，重置段并放回空闲集合。
    ///
    /// 返回该段的结果；错误已被记录，调用方只需决定是否进入排空阶段。
    pub fn finish_segment<T: Transport>(
        &mut self,
        transport: &mut T,
        handle: HandleId,
        result: std::result::Result<(), String>,
    ) -> std::result::Result<(), SegmentError> {
        if !self.is_active(handle) {
            trace!("[Orchestrator] 忽略非活动句柄 {} 的完成事件。", handle);
            return Ok(());
        }
        let segment = &self.segments[handle];
        let status = segment.status_code();
        let outcome = if status >= 400 {
            Err(SegmentError::RemoteStatus { code: status })
        } else if let Err(msg) = result {
            Err(SegmentError::Transport(msg))
        } else if status < 0 {
            Err(SegmentError::ProtocolViolation(
                "request finished without a response".into(),
            ))
        } else if segment.has_pending() || segment.bytes_transferred() != segment.length() {
            Err(SegmentError::ProtocolViolation(format!(
                "response ended after {} of {} bytes",
                segment.bytes_transferred(),
                segment.length()
            )))
        } else {
            Ok(())
        };

        match &outcome {
            Ok(()) => debug!(
                "[Orchestrator] 句柄 {} 完成窗口 {}+{}。",
                handle,
                segment.start_offset(),
                segment.length()
            ),
            Err(e) => warn!("[Orchestrator] 句柄 {} 失败: {}", handle, e),
        }
        if let Err(e) = &outcome {
            self.record_failure(handle, e.clone());
        }
        self.release(transport, handle);
        outcome
    }

    /// 取消所有活动句柄（排空阶段）。
    pub fn cancel_all<T: Transport>(&mut self, transport: &mut T) {
        if !self.active.is_empty() {
            info!("[Orchestrator] 取消 {} 个活动句柄。", self.active.len());
        }
        while let Some(&handle) = self.active.last() {
            self.release(transport, handle);
        }
    }

    fn abort_segment<T: Transport>(&mut self, transport: &mut T, handle: HandleId, e: SegmentError) {
        warn!("[Orchestrator] 中止句柄 {}: {}", handle, e);
        self.record_failure(handle, e);
        self.release(transport, handle);
    }

    fn record_failure(&mut self, handle: HandleId, e: SegmentError) {
        match e {
            SegmentError::RemoteStatus { code } => {
                if self.remote_failure.is_none() {
                    self.remote_failure = Some((code, self.segments[handle].error_text()));
                }
            }
            other => {
                if self.error.is_none() {
                    self.error = Some(other);
                }
            }
        }
    }

    fn release<T: Transport>(&mut self, transport: &mut T, handle: HandleId) {
        if let Err(e) = transport.remove(handle) {
            warn!("[Orchestrator] 注销句柄 {} 失败: {}", handle, e);
        }
        let segment = &mut self.segments[handle];
        self.finished_bytes += segment.bytes_transferred();
        segment.reset_after_request();
        self.active.retain(|&h| h != handle);
        self.idle.push(handle);
    }

    fn is_active(&self, handle: HandleId) -> bool {
        self.active.contains(&handle)
    }

    /// 所有段累计收到的正文字节数，包括仍在进行的请求。
    pub fn bytes_transferred(&self) -> u64 {
        self.finished_bytes
            + self
                .active
                .iter()
                .map(|&h| self.segments[h].bytes_transferred())
                .sum::<u64>()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn active_handles(&self) -> &[HandleId] {
        &self.active
    }

    pub fn segment(&self, handle: HandleId) -> Option<&Segment> {
        self.segments.get(handle)
    }

    pub fn has_failed(&self) -> bool {
        self.remote_failure.is_some() || self.error.is_some()
    }

    /// 第一个远端失败状态码及其错误正文。
    pub fn remote_failure(&self) -> Option<(i32, &str)> {
        self.remote_failure
            .as_ref()
            .map(|(code, text)| (*code, text.as_str()))
    }

    /// 第一个非状态码类的错误。
    pub fn error(&self) -> Option<&SegmentError> {
        self.error.as_ref()
    }

    /// 记录一个不属于任何段的错误（例如停滞超时）。
    pub fn set_error(&mut self, e: SegmentError) {
        if self.error.is_none() {
            self.error = Some(e);
        }
    }

    pub fn flush(&mut self, force: bool) -> std::result::Result<usize, StreamError> {
        self.stream.flush(force)
    }

    pub fn finalize(&mut self) -> std::result::Result<(), StreamError> {
        self.stream.finalize()
    }

    pub fn stream(&self) -> &OrderedStream<F> {
        &self.stream
    }
}
