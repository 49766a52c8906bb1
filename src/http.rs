//! 基于 `reqwest` 的网络引擎。
//!
//! 每个注册的句柄在一个独立的 tokio 任务中执行请求，并通过有界信道把响应头、
//! 正文和完成事件交给驱动循环。信道写满时任务停止读取网络流，
//! 从而把背压传递给 TCP 连接。

use crate::segment::{Method, RangeRequest};
use crate::transport::{SizeProbe, Transport, TransportEvent};
use crate::types::{HandleId, TpcConfig, TransportError};
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use log::{debug, error, info, trace, warn};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Body, Client, ClientBuilder, RequestBuilder};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// 推送模式下上传信道的容量（以块计）。
const UPLOAD_QUEUE_CAP: usize = 4;

/// 一个已注册句柄的引擎侧状态。
struct HandleSlot {
    events: mpsc::Receiver<TransportEvent>,
    upload: Option<mpsc::Sender<Bytes>>,
    task: JoinHandle<()>,
    paused: bool,
}

/// 使用 `reqwest::Client` 执行范围请求的网络引擎。
pub struct ReqwestTransport {
    client: Client,
    capacity: usize,
    notify: Arc<Notify>,
    slots: Vec<Option<HandleSlot>>,
    /// 轮询起点，保证各句柄公平地交付事件。
    next_poll: usize,
}

impl ReqwestTransport {
    /// 使用调用方提供的 `ClientBuilder` 创建引擎，User-Agent 取自配置。
    pub fn from_builder(builder: ClientBuilder, config: &TpcConfig) -> Result<Self, TransportError> {
        let client = builder.user_agent(config.user_agent.as_str()).build()?;
        Ok(Self::with_client(client, config.channel_capacity))
    }

    pub fn new(config: &TpcConfig) -> Result<Self, TransportError> {
        Self::from_builder(ClientBuilder::new(), config)
    }

    /// 直接使用一个已构建好的客户端。
    pub fn with_client(client: Client, channel_capacity: usize) -> Self {
        Self {
            client,
            capacity: channel_capacity.max(1),
            notify: Arc::new(Notify::new()),
            slots: Vec::new(),
            next_poll: 0,
        }
    }

    /// 当前注册的句柄数量。
    pub fn active_handles(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    fn slot_mut(&mut self, handle: HandleId) -> Option<&mut HandleSlot> {
        self.slots.get_mut(handle).and_then(Option::as_mut)
    }

    fn build_request(&self, request: &RangeRequest) -> RequestBuilder {
        let url = request.url.as_str();
        let mut rb = match request.method {
            Method::Head => self.client.head(url),
            Method::Get => self.client.get(url),
            Method::Put => self.client.put(url),
        };
        for (name, value) in &request.headers {
            rb = rb.header(name.as_str(), value.as_str());
        }
        if let Some(range) = request.range_header() {
            rb = rb.header(RANGE, range);
        }
        rb
    }
}

impl Transport for ReqwestTransport {
    fn add(&mut self, handle: HandleId, request: RangeRequest) -> Result<(), TransportError> {
        if self.slot_mut(handle).is_some() {
            return Err(TransportError::Handle(handle));
        }
        if self.slots.len() <= handle {
            self.slots.resize_with(handle + 1, || None);
        }

        let (tx, events) = mpsc::channel(self.capacity);
        let mut rb = self.build_request(&request);
        let mut upload = None;
        if let Some(length) = request.upload_length {
            let (upload_tx, upload_rx) = mpsc::channel::<Bytes>(UPLOAD_QUEUE_CAP);
            // 上传正文在送出 `length` 字节后结束。每取走一块就唤醒驱动循环继续读文件。
            let notify = Arc::clone(&self.notify);
            let body = stream::unfold(
                (upload_rx, length, notify),
                |(mut rx, remaining, notify)| async move {
                    if remaining == 0 {
                        return None;
                    }
                    let data = rx.recv().await?;
                    notify.notify_one();
                    let remaining = remaining.saturating_sub(data.len() as u64);
                    Some((Ok::<_, io::Error>(data), (rx, remaining, notify)))
                },
            );
            rb = rb
                .header(CONTENT_LENGTH, length)
                .body(Body::wrap_stream(body));
            upload = Some(upload_tx);
        }

        debug!(
            "[ReqwestTransport] 注册句柄 {}: {:?} {}，范围 {:?}。",
            handle, request.method, request.url, request.range
        );
        let task = tokio::spawn(run_request(handle, rb, tx, Arc::clone(&self.notify)));
        self.slots[handle] = Some(HandleSlot {
            events,
            upload,
            task,
            paused: false,
        });
        Ok(())
    }

    fn remove(&mut self, handle: HandleId) -> Result<(), TransportError> {
        let slot = self
            .slots
            .get_mut(handle)
            .and_then(Option::take)
            .ok_or(TransportError::Handle(handle))?;
        if !slot.task.is_finished() {
            debug!("[ReqwestTransport] 取消仍在进行的句柄 {}。", handle);
            slot.task.abort();
        }
        Ok(())
    }

    fn pause(&mut self, handle: HandleId) {
        if let Some(slot) = self.slot_mut(handle) {
            trace!("[ReqwestTransport] 暂停句柄 {}。", handle);
            slot.paused = true;
        }
    }

    fn resume(&mut self, handle: HandleId) {
        if let Some(slot) = self.slot_mut(handle) {
            trace!("[ReqwestTransport] 恢复句柄 {}。", handle);
            slot.paused = false;
        }
        self.notify.notify_one();
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        let n = self.slots.len();
        for step in 0..n {
            let idx = (self.next_poll + step) % n;
            let Some(slot) = self.slots[idx].as_mut() else {
                continue;
            };
            if slot.paused {
                continue;
            }
            match slot.events.try_recv() {
                Ok(event) => {
                    self.next_poll = (idx + 1) % n;
                    return Some(event);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }
        }
        None
    }

    fn upload(&mut self, handle: HandleId, data: Bytes) -> Result<bool, TransportError> {
        let slot = self.slot_mut(handle).ok_or(TransportError::Handle(handle))?;
        let Some(upload) = slot.upload.as_ref() else {
            return Err(TransportError::Engine(format!(
                "handle {handle} has no upload body"
            )));
        };
        match upload.try_send(data) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Closed(_)) => {
                // 请求已经结束，完成事件会随后交付。
                debug!("[ReqwestTransport] 句柄 {} 的上传正文已关闭。", handle);
                Ok(false)
            }
        }
    }

    async fn wait(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        Ok(tokio::time::timeout(timeout, self.notify.notified())
            .await
            .is_ok())
    }

    async fn probe_size(&mut self, request: RangeRequest) -> Result<SizeProbe, TransportError> {
        info!("[ReqwestTransport] 探测远端文件大小: {}", request.url);

        let head = RangeRequest {
            method: Method::Head,
            range: None,
            upload_length: None,
            ..request.clone()
        };
        match self.build_request(&head).send().await {
            Ok(resp) if resp.status().as_u16() < 400 => {
                if let Some(len) = header_u64(resp.headers().get(CONTENT_LENGTH)) {
                    debug!("[ReqwestTransport] HEAD 返回 Content-Length: {}。", len);
                    return Ok(SizeProbe {
                        status: resp.status().as_u16(),
                        content_length: Some(len),
                    });
                }
            }
            Ok(resp) => {
                debug!(
                    "[ReqwestTransport] HEAD 返回状态码 {}，改用范围请求。",
                    resp.status()
                );
            }
            Err(e) => warn!("[ReqwestTransport] HEAD 请求失败，改用范围请求: {}", e),
        }

        let ranged = RangeRequest {
            method: Method::Get,
            range: Some((0, 0)),
            upload_length: None,
            ..request
        };
        let resp = self.build_request(&ranged).send().await?;
        let status = resp.status().as_u16();
        if status >= 400 {
            return Ok(SizeProbe {
                status,
                content_length: None,
            });
        }
        let headers = resp.headers();
        let total = headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit_once('/'))
            .and_then(|(_, total)| total.trim().parse::<u64>().ok());
        // 服务器忽略 Range 时，200 响应的 Content-Length 就是完整大小。
        let content_length = match total {
            Some(total) => Some(total),
            None if status == 200 => header_u64(headers.get(CONTENT_LENGTH)),
            None => None,
        };
        Ok(SizeProbe {
            status,
            content_length,
        })
    }
}

impl Drop for ReqwestTransport {
    fn drop(&mut self) {
        for slot in self.slots.iter().flatten() {
            slot.task.abort();
        }
    }
}

fn header_u64(value: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    value?.to_str().ok()?.trim().parse().ok()
}

/// 单个句柄的请求任务。
///
/// 按顺序发送状态行、每个响应头、结尾空行、正文块，最后是完成事件。
/// 驱动循环移除句柄后接收端被丢弃，任务随即退出。
async fn run_request(
    handle: HandleId,
    rb: RequestBuilder,
    tx: mpsc::Sender<TransportEvent>,
    notify: Arc<Notify>,
) {
    let send = |event: TransportEvent| {
        let tx = tx.clone();
        let notify = Arc::clone(&notify);
        async move {
            let delivered = tx.send(event).await.is_ok();
            notify.notify_one();
            delivered
        }
    };

    let resp = match rb.send().await {
        Ok(resp) => resp,
        Err(e) => {
            error!("[ReqwestTransport] 句柄 {} 请求失败: {}", handle, e);
            send(TransportEvent::Done {
                handle,
                result: Err(e.to_string()),
            })
            .await;
            return;
        }
    };

    let status = resp.status();
    let status_line = format!(
        "{:?} {} {}",
        resp.version(),
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    trace!("[ReqwestTransport] 句柄 {} 状态行: {}", handle, status_line);
    if !send(TransportEvent::Header {
        handle,
        line: status_line,
    })
    .await
    {
        return;
    }
    let header_lines: Vec<String> = resp
        .headers()
        .iter()
        .map(|(name, value)| format!("{}: {}", name, String::from_utf8_lossy(value.as_bytes())))
        .chain(std::iter::once(String::new()))
        .collect();
    for line in header_lines {
        if !send(TransportEvent::Header { handle, line }).await {
            return;
        }
    }

    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(data) if data.is_empty() => {}
            Ok(data) => {
                trace!("[ReqwestTransport] 句柄 {} 收到 {} 字节。", handle, data.len());
                if !send(TransportEvent::Body { handle, data }).await {
                    return;
                }
            }
            Err(e) => {
                warn!("[ReqwestTransport] 句柄 {} 读取正文失败: {}", handle, e);
                send(TransportEvent::Done {
                    handle,
                    result: Err(e.to_string()),
                })
                .await;
                return;
            }
        }
    }
    debug!("[ReqwestTransport] 句柄 {} 请求完成。", handle);
    send(TransportEvent::Done {
        handle,
        result: Ok(()),
    })
    .await;
}
