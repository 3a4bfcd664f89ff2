//! Built-in checkers.
//!
//! - [`http`]: `GET <url>` answers 200
//! - [`tcp`]: `<host:port>` accepts a connection
//!
//! Anything else (databases, brokers, gRPC health) is a [`Checker`]
//! implementation supplied by the test suite.

mod http;
mod tcp;

pub use self::http::HttpCheck;
pub use self::tcp::TcpCheck;

use std::sync::Arc;

use crate::checker::Checker;
use crate::error::{ComptestError, ComptestResult};

/// Checker that succeeds once `GET url` returns 200.
pub fn http(url: impl Into<String>) -> HttpCheck {
    HttpCheck::new(url)
}

/// Checker that succeeds once `addr` accepts a TCP connection.
pub fn tcp(addr: impl Into<String>) -> TcpCheck {
    TcpCheck::new(addr)
}

/// Build a checker from `tcp://host:port` or `http://host:port/path`.
pub fn parse(spec: &str) -> ComptestResult<Arc<dyn Checker>> {
    let spec = spec.trim();
    if let Some(addr) = spec.strip_prefix("tcp://") {
        if addr.is_empty() {
            return Err(ComptestError::Config(format!("missing address in {spec:?}")));
        }
        return Ok(Arc::new(tcp(addr)));
    }
    if spec.starts_with("http://") {
        return Ok(Arc::new(http(spec)));
    }
    Err(ComptestError::Config(format!(
        "unsupported check {spec:?}, expected tcp://host:port or http://host:port/path"
    )))
}
