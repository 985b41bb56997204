//! HTTP streaming transport built on reqwest.

use super::{ByteStream, PingRequest, StreamRequest, Transport, TransportError};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::StatusCode;
use std::collections::BTreeMap;
use tracing::debug;

/// Header carrying the resumption id.
const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

/// Streams events over a long-lived HTTP GET.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with a default client.
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Self { client })
    }

    /// Create a transport around an existing client (proxies, TLS roots, ...).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn stream_request(&self, request: &StreamRequest) -> Result<reqwest::Request, TransportError> {
        let mut builder = self
            .client
            .get(&request.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        builder = with_headers(builder, &request.headers);
        if let Some(id) = &request.last_event_id {
            builder = builder.header(LAST_EVENT_ID_HEADER, id.as_str());
        }
        builder
            .build()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }

    fn ping_request(&self, request: &PingRequest) -> Result<reqwest::Request, TransportError> {
        with_headers(self.client.post(&request.url), &request.headers)
            .json(&request.body)
            .build()
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

fn with_headers(
    mut builder: reqwest::RequestBuilder,
    headers: &BTreeMap<String, String>,
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
}

fn check_status(status: StatusCode) -> Result<(), TransportError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(TransportError::Status(status.as_u16()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, request: &StreamRequest) -> Result<ByteStream, TransportError> {
        let http_request = self.stream_request(request)?;
        let response = self.client.execute(http_request).await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::ConnectionFailed(e.to_string())
            }
        })?;

        check_status(response.status())?;
        debug!(url = %request.url, status = response.status().as_u16(), "stream opened");

        let chunks = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| TransportError::ReceiveFailed(e.to_string()))
        });
        Ok(Box::pin(chunks))
    }

    async fn ping(&self, request: &PingRequest) -> Result<(), TransportError> {
        let http_request = self.ping_request(request)?;
        let response = self
            .client
            .execute(http_request)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        check_status(response.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers() -> BTreeMap<String, String> {
        BTreeMap::from([("Authorization".to_string(), "Bearer t0ken".to_string())])
    }

    fn header<'a>(request: &'a reqwest::Request, name: &str) -> Option<&'a str> {
        request.headers().get(name).and_then(|v| v.to_str().ok())
    }

    #[test]
    fn stream_request_asks_for_event_stream() {
        let transport = HttpTransport::with_client(reqwest::Client::new());
        let request = transport
            .stream_request(&StreamRequest {
                url: "https://social.example/api/v1/streaming/user".into(),
                headers: headers(),
                last_event_id: Some("105".into()),
            })
            .unwrap();

        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(
            request.url().as_str(),
            "https://social.example/api/v1/streaming/user"
        );
        assert_eq!(header(&request, "accept"), Some("text/event-stream"));
        assert_eq!(header(&request, "cache-control"), Some("no-cache"));
        assert_eq!(header(&request, "authorization"), Some("Bearer t0ken"));
        assert_eq!(header(&request, "last-event-id"), Some("105"));
    }

    #[test]
    fn first_connect_sends_no_resume_header() {
        let transport = HttpTransport::with_client(reqwest::Client::new());
        let request = transport
            .stream_request(&StreamRequest {
                url: "https://social.example/stream".into(),
                headers: BTreeMap::new(),
                last_event_id: None,
            })
            .unwrap();

        assert!(request.headers().get(LAST_EVENT_ID_HEADER).is_none());
        assert!(request.headers().get("authorization").is_none());
    }

    #[test]
    fn ping_request_posts_json_body() {
        let transport = HttpTransport::with_client(reqwest::Client::new());
        let body = json!({ "type": "ping", "timestamp": 1_700_000_000_000u64 });
        let request = transport
            .ping_request(&PingRequest {
                url: "https://social.example/stream/ping".into(),
                headers: headers(),
                body: body.clone(),
            })
            .unwrap();

        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(header(&request, "content-type"), Some("application/json"));
        assert_eq!(header(&request, "authorization"), Some("Bearer t0ken"));

        let sent = request.body().and_then(|b| b.as_bytes()).unwrap();
        assert_eq!(serde_json::from_slice::<serde_json::Value>(sent).unwrap(), body);
    }

    #[test]
    fn invalid_header_is_a_connection_error() {
        let transport = HttpTransport::with_client(reqwest::Client::new());
        let err = transport
            .stream_request(&StreamRequest {
                url: "https://social.example/stream".into(),
                headers: BTreeMap::from([("bad header".to_string(), "x".to_string())]),
                last_event_id: None,
            })
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }

    #[test]
    fn non_success_status_is_reported() {
        assert_eq!(check_status(StatusCode::OK), Ok(()));
        assert_eq!(
            check_status(StatusCode::UNAUTHORIZED),
            Err(TransportError::Status(401))
        );
        assert_eq!(
            check_status(StatusCode::SERVICE_UNAVAILABLE),
            Err(TransportError::Status(503))
        );
    }
}
