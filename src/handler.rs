//! TPC 请求的入口：解析 COPY 请求头并启动对应方向的驱动循环。

use crate::drive::DriveLoop;
use crate::marker::ResponseSink;
use crate::pmark::{MarkContext, PacketMarker, SocketMarkBinder};
use crate::segment::RequestTemplate;
use crate::stream::StorageFile;
use crate::transport::Transport;
use crate::types::{
    Result, SecurityEntity, TpcConfig, TpcError, TransferIds, TransferMode, TransferOutcome,
};
use faststr::FastStr;
use log::{info, warn};
use std::sync::Arc;

fn bad_request(status: u16, message: &str) -> TpcError {
    TpcError::BadRequest {
        status,
        message: message.to_string(),
    }
}

/// 把 `davs://` 改写为 `https://`。
fn prepare_remote_url(input: &str) -> FastStr {
    match input.strip_prefix("davs://") {
        Some(rest) => FastStr::new(format!("https://{rest}")),
        None => FastStr::new(input),
    }
}

/// 一个已经校验过的 COPY 请求。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpcRequest {
    pub mode: TransferMode,
    /// 远端 URL（拉取时为源，推送时为目的地）。
    pub remote_url: FastStr,
    /// 本地资源路径。
    pub resource: FastStr,
    /// 客户端请求的查询串。
    pub query: FastStr,
    /// 客户端请求的流数，至少为 1。
    pub streams: usize,
    /// 通过 `Copy-Header` 转发给远端的请求头。
    pub copy_headers: Vec<(FastStr, FastStr)>,
    /// 拉取时是否覆盖已存在的本地文件：缺省为覆盖，出现该头时只有 `T` 表示覆盖。
    pub overwrite: bool,
    /// 访问本地资源的授权信息，来自 `Authorization` 头或查询串里的 `authz=`。
    pub authz: Option<FastStr>,
    pub entity: SecurityEntity,
}

impl TpcRequest {
    /// 从请求头解析 COPY 请求。
    ///
    /// 请求头名称不区分大小写。错误以 `TpcError::BadRequest` 返回，
    /// 其中带有应当同步回复给客户端的状态码。
    pub fn from_headers<'h, I>(
        resource: &str,
        query: &str,
        headers: I,
        entity: SecurityEntity,
        max_streams: usize,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (&'h str, &'h str)>,
    {
        let headers: Vec<(&str, &str)> = headers.into_iter().collect();
        let find = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.trim())
        };

        if let Some(credential) = find("Credential") {
            if credential != "none" {
                warn!("[TpcRequest] 不支持的凭据类型: {}", credential);
                return Err(bad_request(
                    400,
                    "COPY requested an unsupported Credential type",
                ));
            }
        }

        let (mode, remote) = match (find("Source"), find("Destination")) {
            (Some(src), _) => (TransferMode::Pull, src),
            (None, Some(dst)) => (TransferMode::Push, dst),
            (None, None) => return Err(bad_request(400, "No Source or Destination specified")),
        };

        let mut streams = 1;
        if mode == TransferMode::Pull {
            if let Some(value) = find("X-Number-Of-Streams") {
                let requested = value.parse::<i64>().unwrap_or(-1);
                if requested < 0 || requested > max_streams as i64 {
                    warn!("[TpcRequest] 无效的流数: {:?}", value);
                    return Err(bad_request(500, "Invalid request for number of streams"));
                }
                streams = (requested as usize).max(1);
            }
        }

        let copy_headers = headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case("Copy-Header"))
            .filter_map(|(_, v)| match v.split_once(':') {
                Some((name, value)) => Some((
                    FastStr::new(name.trim()),
                    FastStr::new(value.trim()),
                )),
                None => {
                    warn!("[TpcRequest] 忽略格式错误的 Copy-Header: {:?}", v);
                    None
                }
            })
            .collect();

        let overwrite = find("Overwrite").map_or(true, |v| v == "T");
        let authz = find("Authorization").map(FastStr::new).or_else(|| {
            query
                .split('&')
                .find_map(|token| token.strip_prefix("authz="))
                .map(FastStr::new)
        });

        Ok(Self {
            mode,
            remote_url: prepare_remote_url(remote),
            resource: FastStr::new(resource),
            query: FastStr::new(query),
            streams,
            copy_headers,
            overwrite,
            authz,
            entity,
        })
    }

    /// 本地资源的完整路径：资源路径加上去掉 `authz=` 之后的查询串。
    pub fn local_url(&self) -> String {
        let tokens: Vec<&str> = self
            .query
            .split('&')
            .filter(|t| !t.is_empty() && !t.starts_with("authz="))
            .collect();
        if tokens.is_empty() {
            self.resource.to_string()
        } else {
            format!("{}?{}", self.resource, tokens.join("&"))
        }
    }

    /// 远端请求的配置。
    pub fn template(&self) -> RequestTemplate {
        let mut template = RequestTemplate::new(self.remote_url.clone(), self.mode);
        template.headers = self.copy_headers.clone();
        template
    }

    pub fn mark_context(&self, app_tag: &str) -> MarkContext {
        MarkContext {
            entity: self.entity.name.clone(),
            resource: self.resource.to_string(),
            query: self.query.to_string(),
            app_tag: app_tag.to_string(),
        }
    }
}

/// TPC 引擎的入口。
pub struct TpcHandler {
    config: TpcConfig,
    ids: Arc<TransferIds>,
    marker: Option<Arc<dyn PacketMarker>>,
    app_tag: FastStr,
}

impl TpcHandler {
    pub fn new(config: TpcConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ids: Arc::new(TransferIds::new()),
            marker: None,
            app_tag: FastStr::from_static_str("http-tpc"),
        })
    }

    /// 使用外部提供的传输编号生成器（例如在多个处理器之间共享）。
    pub fn with_transfer_ids(mut self, ids: Arc<TransferIds>) -> Self {
        self.ids = ids;
        self
    }

    /// 启用打包标记。
    pub fn with_packet_marker(
        mut self,
        marker: Arc<dyn PacketMarker>,
        app_tag: impl Into<FastStr>,
    ) -> Self {
        self.marker = Some(marker);
        self.app_tag = app_tag.into();
        self
    }

    pub fn config(&self) -> &TpcConfig {
        &self.config
    }

    pub fn transfer_ids(&self) -> &Arc<TransferIds> {
        &self.ids
    }

    /// 按本处理器的配置解析请求头。
    pub fn parse_request<'h, I>(
        &self,
        resource: &str,
        query: &str,
        headers: I,
        entity: SecurityEntity,
    ) -> Result<TpcRequest>
    where
        I: IntoIterator<Item = (&'h str, &'h str)>,
    {
        TpcRequest::from_headers(resource, query, headers, entity, self.config.max_streams)
    }

    /// 以同步响应回复一个无法处理的请求。
    pub fn reject<S: ResponseSink>(&self, err: &TpcError, sink: &mut S) -> Result<TransferOutcome> {
        let status = match err {
            TpcError::BadRequest { status, .. } => *status,
            _ => 500,
        };
        let message = err.to_string();
        sink.send_simple(status, &message)
            .map_err(TpcError::Response)?;
        Ok(TransferOutcome::rejected(status, message))
    }

    /// 执行一次传输。
    ///
    /// `file` 由调用方按请求方向打开并授权：拉取时可写，推送时可读。
    pub async fn process<F, T, S>(
        &self,
        request: &TpcRequest,
        file: F,
        transport: &mut T,
        sink: &mut S,
    ) -> Result<TransferOutcome>
    where
        F: StorageFile,
        T: Transport,
        S: ResponseSink,
    {
        let id = self.ids.next_id();
        info!(
            "[TpcHandler] 传输 {}: {:?} {} <-> {}，{} 个流。",
            id, request.mode, request.resource, request.remote_url, request.streams
        );
        let binder = SocketMarkBinder::new(self.marker.clone(), request.mark_context(&self.app_tag));
        let mut drive = DriveLoop::new(id, &self.config, transport, sink, binder);
        let outcome = match request.mode {
            TransferMode::Pull => {
                drive
                    .run_pull(request.template(), request.streams, file)
                    .await?
            }
            TransferMode::Push => drive.run_push(request.template(), file).await?,
        };
        info!(
            "[TpcHandler] 传输 {} 结束: {}（{} 字节）",
            id, outcome.message, outcome.bytes_transferred
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(headers: &[(&str, &str)]) -> Result<TpcRequest> {
        TpcRequest::from_headers(
            "/store/file.root",
            "",
            headers.iter().copied(),
            SecurityEntity::default(),
            100,
        )
    }

    fn status_of(result: Result<TpcRequest>) -> u16 {
        match result {
            Err(TpcError::BadRequest { status, .. }) => status,
            other => panic!("expected a bad request, got {other:?}"),
        }
    }

    #[test]
    fn test_source_selects_pull_and_rewrites_davs() {
        let req = parse(&[
            ("source", "davs://remote.example/f"),
            ("X-Number-Of-Streams", "4"),
        ])
        .unwrap();
        assert_eq!(req.mode, TransferMode::Pull);
        assert_eq!(req.remote_url.as_str(), "https://remote.example/f");
        assert_eq!(req.streams, 4);
        assert!(req.overwrite);
    }

    #[test]
    fn test_destination_selects_push() {
        let req = parse(&[("Destination", "https://remote.example/f")]).unwrap();
        assert_eq!(req.mode, TransferMode::Push);
        assert_eq!(req.streams, 1);
    }

    #[test]
    fn test_missing_source_and_destination() {
        assert_eq!(status_of(parse(&[])), 400);
    }

    #[test]
    fn test_credential_other_than_none() {
        let headers = [("Credential", "gridsite"), ("Source", "https://r/f")];
        assert_eq!(status_of(parse(&headers)), 400);
        assert!(parse(&[("Credential", "none"), ("Source", "https://r/f")]).is_ok());
    }

    #[test]
    fn test_stream_count_bounds() {
        let zero = parse(&[("Source", "https://r/f"), ("X-Number-Of-Streams", "0")]).unwrap();
        assert_eq!(zero.streams, 1);
        for bad in ["101", "-1", "many"] {
            let headers = [("Source", "https://r/f"), ("X-Number-Of-Streams", bad)];
            assert_eq!(status_of(parse(&headers)), 500);
        }
    }

    #[test]
    fn test_copy_headers_are_forwarded() {
        let req = parse(&[
            ("Source", "https://r/f"),
            ("Copy-Header", "Authorization: Bearer abc"),
            ("copy-header", "X-Trace: 1"),
            ("Copy-Header", "garbage"),
        ])
        .unwrap();
        let template = req.template();
        let names: Vec<_> = template.headers.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["Authorization", "X-Trace"]);
        assert_eq!(template.headers[0].1.as_str(), "Bearer abc");
    }

    #[test]
    fn test_local_url_strips_authz_token() {
        let req = TpcRequest::from_headers(
            "/store/f",
            "authz=secret&scitag.flow=66",
            [("Source", "https://r/f"), ("Overwrite", "F")],
            SecurityEntity::default(),
            100,
        )
        .unwrap();
        assert_eq!(req.local_url(), "/store/f?scitag.flow=66");
        assert_eq!(req.authz.as_deref(), Some("secret"));
        assert!(!req.overwrite);
    }

    #[test]
    fn test_overwrite_requires_literal_t() {
        let with = |value: &str| {
            parse(&[("Source", "https://r/f"), ("Overwrite", value)])
                .unwrap()
                .overwrite
        };
        assert!(with("T"));
        assert!(!with("X"));
        assert!(!with("true"));
        assert!(parse(&[("Source", "https://r/f")]).unwrap().overwrite);
    }
}
