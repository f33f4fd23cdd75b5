// src/transport/http_sender.rs
//! HTTP sender built on the hyper client
//!
//! Posts the encoded batch body to `{host}/i`. Only `http` hosts are
//! accepted; a collector behind TLS needs a custom [`Sender`] that brings
//! its own connector.

use crate::delivery::sender::{OutboundBatch, SendOutcome, Sender};
use crate::utils::config::ClientConfig;
use crate::utils::errors::{AnalyticsError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, USER_AGENT};
use hyper::{Method, Request, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

/// Request path appended to the configured host
pub const COLLECTOR_PATH: &str = "/i";

/// Map a collector response status onto a send outcome
///
/// 2xx is success. 408 and 429 are throttling and retried, like every 5xx.
/// Any other 4xx means the request itself is wrong and is not retried.
pub fn classify_status(status: StatusCode) -> SendOutcome {
    if status.is_success() {
        return SendOutcome::Success;
    }

    let reason = format!("collector responded {}", status);
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => SendOutcome::RetryableFailure(reason),
        s if s.is_client_error() => SendOutcome::PermanentFailure(reason),
        _ => SendOutcome::RetryableFailure(reason),
    }
}

/// POSTs batches to an analytics collector
pub struct HttpSender {
    endpoint: Uri,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpSender {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let host = config.collector_uri()?;
        if host.scheme_str() != Some("http") {
            return Err(AnalyticsError::Configuration(format!(
                "HttpSender only speaks plain http, got '{}'; supply a TLS-capable Sender",
                config.host
            )));
        }

        let endpoint: Uri = format!("{}{}", config.host.trim().trim_end_matches('/'), COLLECTOR_PATH)
            .parse()
            .map_err(|e| AnalyticsError::Configuration(format!("invalid collector endpoint: {}", e)))?;

        let client = Client::builder(TokioExecutor::new()).build_http();

        Ok(Self { endpoint, client })
    }

    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn send(&self, batch: &OutboundBatch) -> SendOutcome {
        let request = match Request::builder()
            .method(Method::POST)
            .uri(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, concat!("analytics-core/", env!("CARGO_PKG_VERSION")))
            .body(Full::new(batch.body.clone()))
        {
            Ok(request) => request,
            Err(e) => return SendOutcome::PermanentFailure(format!("could not build request: {}", e)),
        };

        let response = match self.client.request(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Request to {} failed: {}", self.endpoint, e);
                return SendOutcome::RetryableFailure(format!("request failed: {}", e));
            }
        };

        let status = response.status();
        // Drain the body so the connection can be reused.
        if let Err(e) = response.into_body().collect().await {
            debug!("Failed to read collector response body: {}", e);
        }

        debug!(
            "POST {} ({} events, {} bytes) -> {}",
            self.endpoint,
            batch.event_count(),
            batch.body.len(),
            status
        );
        classify_status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::Response;
    use hyper_util::rt::TokioIo;
    use parking_lot::Mutex;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Captured {
        paths: Vec<String>,
        content_types: Vec<String>,
        bodies: Vec<Bytes>,
    }

    /// Serves every request with `status`, recording what arrived
    async fn collector(status: StatusCode) -> (SocketAddr, Arc<Mutex<Captured>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let captured = Arc::new(Mutex::new(Captured::default()));

        let seen = Arc::clone(&captured);
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let seen = Arc::clone(&seen);
                        async move {
                            let path = req.uri().path().to_string();
                            let content_type = req
                                .headers()
                                .get(CONTENT_TYPE)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or_default()
                                .to_string();
                            let body = req.into_body().collect().await.unwrap().to_bytes();
                            {
                                let mut seen = seen.lock();
                                seen.paths.push(path);
                                seen.content_types.push(content_type);
                                seen.bodies.push(body);
                            }
                            let mut response = Response::new(Full::new(Bytes::from_static(b"{\"result\":\"ok\"}")));
                            *response.status_mut() = status;
                            Ok::<_, Infallible>(response)
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (addr, captured)
    }

    fn batch() -> OutboundBatch {
        OutboundBatch {
            sequences: vec![1],
            events: Vec::new(),
            body: Bytes::from_static(b"{\"events\":[]}"),
        }
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK), SendOutcome::Success);
        assert_eq!(classify_status(StatusCode::NO_CONTENT), SendOutcome::Success);
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            SendOutcome::RetryableFailure(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::REQUEST_TIMEOUT),
            SendOutcome::RetryableFailure(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            SendOutcome::RetryableFailure(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST),
            SendOutcome::PermanentFailure(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED),
            SendOutcome::PermanentFailure(_)
        ));
    }

    #[test]
    fn test_endpoint_appends_path() {
        let sender = HttpSender::new(&ClientConfig::new("key", "http://collector.local:8080/")).unwrap();
        assert_eq!(sender.endpoint().to_string(), "http://collector.local:8080/i");
    }

    #[test]
    fn test_https_host_rejected() {
        let err = HttpSender::new(&ClientConfig::new("key", "https://collector.local")).err().unwrap();
        assert!(matches!(err, AnalyticsError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_posts_body_to_collector() {
        let (addr, captured) = collector(StatusCode::OK).await;
        let sender = HttpSender::new(&ClientConfig::new("key", format!("http://{}", addr))).unwrap();

        assert_eq!(sender.send(&batch()).await, SendOutcome::Success);

        let captured = captured.lock();
        assert_eq!(captured.paths, vec!["/i"]);
        assert_eq!(captured.content_types, vec!["application/json"]);
        assert_eq!(captured.bodies[0], Bytes::from_static(b"{\"events\":[]}"));
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let (addr, _) = collector(StatusCode::BAD_GATEWAY).await;
        let sender = HttpSender::new(&ClientConfig::new("key", format!("http://{}", addr))).unwrap();
        assert!(matches!(sender.send(&batch()).await, SendOutcome::RetryableFailure(_)));
    }

    #[tokio::test]
    async fn test_connection_refused_is_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sender = HttpSender::new(&ClientConfig::new("key", format!("http://{}", addr))).unwrap();
        assert!(matches!(sender.send(&batch()).await, SendOutcome::RetryableFailure(_)));
    }
}
