use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, StatusCode, Uri};
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tracing::debug;

use crate::checker::{CheckContext, Checker};
use crate::error::CheckError;

/// `GET <url>` over HTTP/1.1; only a 200 response counts as ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCheck {
    url: String,
}

impl HttpCheck {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn probe(&self, uri: &Uri, authority: &str) -> Result<(), CheckError> {
        // `Uri::host` keeps the brackets of an IPv6 literal.
        let host = uri
            .host()
            .unwrap_or_default()
            .trim_start_matches('[')
            .trim_end_matches(']');
        let port = uri.port_u16().unwrap_or(80);

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| CheckError::not_ready(format!("failed to connect to {authority}: {e}")))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| CheckError::not_ready(format!("handshake with {authority} failed: {e}")))?;

        // Drive the connection in the background. Dropping the set aborts the
        // driver, so an abandoned probe releases its socket.
        let mut driver = JoinSet::new();
        driver.spawn(async move {
            let _ = conn.await;
        });

        let target = uri.path_and_query().map_or("/", |pq| pq.as_str());
        let req = Request::builder()
            .method("GET")
            .uri(target)
            .header("host", authority)
            .header("user-agent", concat!("comptest/", env!("CARGO_PKG_VERSION")))
            .body(Empty::<Bytes>::new())
            .map_err(|e| CheckError::terminal(format!("failed to prepare the request: {e}")))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| CheckError::not_ready(format!("failed to run the request: {e}")))?;

        if resp.status() == StatusCode::OK {
            Ok(())
        } else {
            debug!(status = %resp.status(), url = %self.url, "readiness probe non-200");
            Err(CheckError::not_ready(format!(
                "unexpected status code: {}",
                resp.status().as_u16()
            )))
        }
    }
}

#[async_trait]
impl Checker for HttpCheck {
    async fn check(&self, ctx: &CheckContext) -> Result<(), CheckError> {
        let uri: Uri = self
            .url
            .parse()
            .map_err(|e| CheckError::terminal(format!("invalid url {:?}: {e}", self.url)))?;
        match uri.scheme_str() {
            Some("http") => {}
            other => {
                return Err(CheckError::terminal(format!(
                    "unsupported scheme {:?} in {:?}",
                    other.unwrap_or(""),
                    self.url
                )));
            }
        }
        let Some(authority) = uri.authority().map(|a| a.as_str().to_string()) else {
            return Err(CheckError::terminal(format!("missing host in {:?}", self.url)));
        };

        tokio::select! {
            biased;
            reason = ctx.done() => Err(CheckError::not_ready(format!("request abandoned: {reason}"))),
            result = self.probe(&uri, &authority) => result,
        }
    }

    fn describe(&self) -> String {
        format!("[HTTPCheck: {}]", self.url)
    }
}
