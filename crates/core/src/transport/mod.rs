//! Authenticated request pipeline.
//!
//! Every RETS request passes through the same fixed stack of layers, each
//! owning the one beneath it:
//!
//! ```text
//! DefaultHeaders   User-Agent, RETS-Version, Accept
//!   UserAgentAuth  RETS-UA-Authorization (only with a user-agent password)
//!     WwwAuth      401 + WWW-Authenticate -> Authorization, resend once
//!       Dispatch   session cookies, cancellation/deadline, HTTP round trip
//! ```
//!
//! Each layer implements [`Requester`]; the composed stack is what
//! [`crate::client::build`] returns. The bottom of the stack is a
//! [`Transport`], normally a [`reqwest::Client`], which can be replaced by a
//! stub in tests.

pub mod challenge;
pub mod dispatch;
pub mod headers;
pub mod ua;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Request, Response};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RetsError};

pub use challenge::{Challenge, Credentials, WwwAuth};
pub use dispatch::Dispatch;
pub use headers::DefaultHeaders;
pub use ua::{RetsUaDigest, SigningInput, UserAgentAuth, UserAgentSigner};

/// Cancellation and deadline for one request.
///
/// Cloning shares the cancellation token, so a clone handed to a request can
/// be cancelled from elsewhere.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that never expires on its own.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context cancelled together with `token`.
    pub fn with_token(token: CancellationToken) -> Self {
        Context {
            cancel: token,
            deadline: None,
        }
    }

    /// Add a deadline `timeout` from now. An earlier existing deadline wins.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Drive `fut` until it completes, the context is cancelled, or the
    /// deadline passes, whichever happens first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = async {
            match self.deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(RetsError::Cancelled),
            _ = deadline => Err(RetsError::DeadlineExceeded),
            result = fut => result,
        }
    }
}

/// Something that turns an HTTP request into a response.
///
/// Implementers should not assume any ordering between concurrent calls.
#[async_trait]
pub trait Requester: Send + Sync {
    async fn send(&self, ctx: &Context, request: Request) -> Result<Response>;
}

#[async_trait]
impl<T: Requester + ?Sized> Requester for Arc<T> {
    async fn send(&self, ctx: &Context, request: Request) -> Result<Response> {
        (**self).send(ctx, request).await
    }
}

/// A raw HTTP round trip with no session handling.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, request: Request) -> Result<Response>;
}

#[async_trait]
impl Transport for reqwest::Client {
    async fn round_trip(&self, request: Request) -> Result<Response> {
        Ok(self.execute(request).await?)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let ctx = Context::new();
        ctx.cancel();
        let result = ctx.run(async { Ok(1) }).await;
        assert!(matches!(result, Err(RetsError::Cancelled)));
    }

    #[tokio::test]
    async fn deadline_interrupts_slow_future() {
        let ctx = Context::new().with_timeout(Duration::from_millis(20));
        let result = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(RetsError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn earlier_deadline_wins() {
        let soon = Instant::now() + Duration::from_secs(1);
        let ctx = Context::new()
            .with_deadline(soon)
            .with_timeout(Duration::from_secs(60));
        assert_eq!(ctx.deadline(), Some(soon));
    }

    #[tokio::test]
    async fn token_cancels_clones() {
        let token = CancellationToken::new();
        let ctx = Context::with_token(token.clone());
        let child = ctx.clone();
        token.cancel();
        assert!(child.is_cancelled());
    }
}
