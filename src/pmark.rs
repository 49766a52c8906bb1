//! 为传输使用的每个套接字绑定/解绑打包标记（packet marking）句柄。
//!
//! 标记是尽力而为的：基础句柄创建失败时，本次传输直接跳过标记。

use log::{debug, info, trace, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// 套接字描述符。
pub type SocketFd = i32;

/// 打包标记所需的请求上下文。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkContext {
    /// 安全实体名称。
    pub entity: String,
    /// 本地资源路径。
    pub resource: String,
    /// 请求的查询串（可能携带 scitag 等标签）。
    pub query: String,
    /// 应用标签。
    pub app_tag: String,
}

/// 一个连接上的标记句柄。
pub trait MarkHandle: Send {
    /// 以本句柄为基础，为同一传输的另一个套接字派生句柄。
    fn derive(&self, fd: SocketFd, addr: SocketAddr) -> Option<Box<dyn MarkHandle>>;

    /// 结束标记。必须在套接字关闭之前调用，否则会丢失统计数据。
    fn close(self: Box<Self>);
}

/// 打包标记插件。未配置或不支持时返回 `None`。
pub trait PacketMarker: Send + Sync {
    fn begin(
        &self,
        ctx: &MarkContext,
        fd: SocketFd,
        addr: SocketAddr,
    ) -> Option<Box<dyn MarkHandle>>;
}

/// 按套接字描述符管理标记句柄。
pub struct SocketMarkBinder {
    marker: Option<Arc<dyn PacketMarker>>,
    ctx: MarkContext,
    /// 是否已收到“传输即将开始”的信号。
    transfer_will_start: bool,
    /// 已登记、尚未绑定句柄的套接字，按登记顺序排列。
    registered: Vec<(SocketFd, SocketAddr)>,
    base_fd: Option<SocketFd>,
    handles: HashMap<SocketFd, Box<dyn MarkHandle>>,
    /// 基础句柄创建失败后，本次传输不再尝试标记。
    disabled: bool,
}

impl SocketMarkBinder {
    pub fn new(marker: Option<Arc<dyn PacketMarker>>, ctx: MarkContext) -> Self {
        Self {
            marker,
            ctx,
            transfer_will_start: false,
            registered: Vec::new(),
            base_fd: None,
            handles: HashMap::new(),
            disabled: false,
        }
    }

    /// 不进行任何标记的绑定器。
    pub fn disabled() -> Self {
        Self::new(None, MarkContext::default())
    }

    /// 传输即将开始，此后登记的套接字才会被标记。
    pub fn start_transfer(&mut self) {
        self.transfer_will_start = true;
    }

    /// 登记一个套接字，返回是否被记录。
    ///
    /// 在 `start_transfer` 之前打开的连接（如大小探测）不会被标记。
    pub fn register_socket(&mut self, fd: SocketFd, addr: SocketAddr) -> bool {
        if !self.transfer_will_start || self.marker.is_none() || self.disabled {
            trace!("[SocketMarkBinder] 忽略套接字 {}。", fd);
            return false;
        }
        // 复用的连接已经有句柄。
        if self.handles.contains_key(&fd) || self.registered.iter().any(|(r, _)| *r == fd) {
            return false;
        }
        self.registered.push((fd, addr));
        true
    }

    /// 为已登记的套接字创建标记句柄，可重复调用。
    ///
    /// 第一次调用时用第一个登记的套接字创建基础句柄，其余套接字从基础句柄派生。
    pub fn begin_marking(&mut self) {
        let Some(marker) = self.marker.as_ref() else {
            return;
        };
        if self.disabled || self.registered.is_empty() {
            return;
        }

        if self.base_fd.is_none() {
            let (fd, addr) = self.registered.remove(0);
            match marker.begin(&self.ctx, fd, addr) {
                Some(handle) => {
                    info!("[SocketMarkBinder] 为套接字 {} ({}) 创建基础标记句柄。", fd, addr);
                    self.handles.insert(fd, handle);
                    self.base_fd = Some(fd);
                }
                None => {
                    warn!("[SocketMarkBinder] 无法创建基础标记句柄，本次传输跳过标记。");
                    self.disabled = true;
                    self.registered.clear();
                    return;
                }
            }
        }

        let Some(base) = self.base_fd.and_then(|fd| self.handles.get(&fd)) else {
            debug!("[SocketMarkBinder] 基础句柄已关闭，无法派生新的标记句柄。");
            self.registered.clear();
            return;
        };
        let derived: Vec<_> = self
            .registered
            .drain(..)
            .filter_map(|(fd, addr)| base.derive(fd, addr).map(|h| (fd, h)))
            .collect();
        for (fd, handle) in derived {
            debug!("[SocketMarkBinder] 为套接字 {} 派生标记句柄。", fd);
            self.handles.insert(fd, handle);
        }
    }

    /// 结束某个套接字的标记。调用方必须保证在关闭套接字之前调用。
    pub fn end_marking(&mut self, fd: SocketFd) {
        self.registered.retain(|(registered, _)| *registered != fd);
        if let Some(handle) = self.handles.remove(&fd) {
            debug!("[SocketMarkBinder] 结束套接字 {} 的标记。", fd);
            handle.close();
        }
    }

    /// 结束所有仍然活动的标记。
    pub fn end_all(&mut self) {
        let fds: Vec<_> = self.handles.keys().copied().collect();
        for fd in fds {
            self.end_marking(fd);
        }
    }

    pub fn is_marked(&self, fd: SocketFd) -> bool {
        self.handles.contains_key(&fd)
    }

    pub fn marked_count(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for SocketMarkBinder {
    fn drop(&mut self) {
        self.end_all();
    }
}
