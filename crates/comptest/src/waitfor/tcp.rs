use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::checker::{CheckContext, Checker};
use crate::error::CheckError;

/// Succeeds once the address accepts a TCP connection.
///
/// Anything after `?` is ignored when dialing, so connection strings such as
/// `db:5432?sslmode=disable` can be passed as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpCheck {
    addr: String,
}

impl TcpCheck {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// The address that is actually dialed.
    pub fn dial_addr(&self) -> &str {
        self.addr.split('?').next().unwrap_or_default()
    }
}

#[async_trait]
impl Checker for TcpCheck {
    async fn check(&self, ctx: &CheckContext) -> Result<(), CheckError> {
        let addr = self.dial_addr();
        tokio::select! {
            biased;
            reason = ctx.done() => Err(CheckError::not_ready(format!("dial abandoned: {reason}"))),
            result = TcpStream::connect(addr) => result
                .map(drop)
                .map_err(|e| CheckError::not_ready(format!("failed to connect: {e}"))),
        }
    }

    fn describe(&self) -> String {
        format!("[TCPCheck: {}]", self.addr)
    }
}
