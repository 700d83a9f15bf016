//! RETS user-agent authentication (RETS 1.7 §3.10).
//!
//! Servers that register client software require every request to carry
//!
//! ```text
//! RETS-UA-Authorization: Digest <hex>
//! ```
//!
//! where the digest binds the user-agent credentials to the current session:
//!
//! ```text
//! a1     = MD5(user-agent ":" user-agent-password)
//! digest = MD5(hex(a1) ":" request-id ":" session-id ":" version)
//! ```
//!
//! The session id changes at login, so it is read from the cookie store on
//! every request rather than captured once.

use std::sync::Arc;

use async_trait::async_trait;
use md5::{Digest, Md5};
use reqwest::header::HeaderValue;
use reqwest::{Request, Response};

use crate::error::{Result, RetsError};
use crate::session::Session;
use crate::transport::headers::{RETS_REQUEST_ID, RETS_UA_AUTHORIZATION};
use crate::transport::{Context, Requester};

/// Everything a user-agent digest may depend on.
#[derive(Debug, Clone, Copy)]
pub struct SigningInput<'a> {
    pub user_agent: &'a str,
    pub user_agent_password: &'a str,
    /// `RETS-Request-ID` of the request, empty when not sent.
    pub request_id: &'a str,
    /// Current `RETS-Session-ID`, empty before login.
    pub session_id: &'a str,
    pub version: &'a str,
}

/// Computes the `RETS-UA-Authorization` header value.
pub trait UserAgentSigner: Send + Sync {
    fn sign(&self, input: &SigningInput<'_>) -> String;
}

/// The MD5 digest defined by RETS 1.7.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetsUaDigest;

impl UserAgentSigner for RetsUaDigest {
    fn sign(&self, input: &SigningInput<'_>) -> String {
        let a1 = md5_hex(format!("{}:{}", input.user_agent, input.user_agent_password));
        let digest = md5_hex(format!(
            "{a1}:{}:{}:{}",
            input.request_id, input.session_id, input.version
        ));
        format!("Digest {digest}")
    }
}

pub(crate) fn md5_hex(data: impl AsRef<[u8]>) -> String {
    hex::encode(Md5::digest(data))
}

/// Signs each request with the user-agent digest when a user-agent password
/// is configured; otherwise passes requests through untouched.
pub struct UserAgentAuth<R> {
    next: R,
    user_agent: String,
    password: Option<String>,
    session: Session,
    signer: Arc<dyn UserAgentSigner>,
}

impl<R: Requester> UserAgentAuth<R> {
    pub fn new(next: R, user_agent: &str, password: Option<&str>, session: Session) -> Self {
        UserAgentAuth {
            next,
            user_agent: user_agent.to_string(),
            password: password.filter(|p| !p.is_empty()).map(str::to_string),
            session,
            signer: Arc::new(RetsUaDigest),
        }
    }

    /// Replace the default [`RetsUaDigest`].
    pub fn with_signer(mut self, signer: Arc<dyn UserAgentSigner>) -> Self {
        self.signer = signer;
        self
    }

    fn sign(&self, password: &str, request: &mut Request) -> Result<()> {
        let session_id = self.session.session_id(request.url()).unwrap_or_default();
        let request_id = request
            .headers()
            .get(RETS_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let version = self.session.version();

        let digest = self.signer.sign(&SigningInput {
            user_agent: &self.user_agent,
            user_agent_password: password,
            request_id: &request_id,
            session_id: &session_id,
            version: &version,
        });
        let value = HeaderValue::from_str(&digest).map_err(|_| {
            RetsError::Authentication("user-agent digest is not a valid header value".to_string())
        })?;

        tracing::trace!(has_session = !session_id.is_empty(), "request signed");
        request.headers_mut().insert(RETS_UA_AUTHORIZATION, value);
        Ok(())
    }
}

#[async_trait]
impl<R: Requester> Requester for UserAgentAuth<R> {
    async fn send(&self, ctx: &Context, mut request: Request) -> Result<Response> {
        if let Some(password) = &self.password {
            self.sign(password, &mut request)?;
        }
        self.next.send(ctx, request).await
    }
}
