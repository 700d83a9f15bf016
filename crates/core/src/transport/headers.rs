use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderName, HeaderValue, USER_AGENT};
use reqwest::{Request, Response};

use crate::error::{Result, RetsError};
use crate::session::Session;
use crate::transport::{Context, Requester};

/// Protocol version requested by the client and echoed by the server.
pub const RETS_VERSION: HeaderName = HeaderName::from_static("rets-version");
/// Name of the session cookie set by the server at login.
pub const RETS_SESSION_ID: &str = "RETS-Session-ID";
/// Optional client-chosen request identifier, bound into the UA digest.
pub const RETS_REQUEST_ID: HeaderName = HeaderName::from_static("rets-request-id");
/// User-agent digest computed by [`UserAgentAuth`](super::UserAgentAuth).
pub const RETS_UA_AUTHORIZATION: HeaderName = HeaderName::from_static("rets-ua-authorization");

/// Outermost layer: stamps the identification headers every RETS server
/// expects, then delegates.
pub struct DefaultHeaders<R> {
    next: R,
    user_agent: HeaderValue,
    session: Session,
}

impl<R: Requester> DefaultHeaders<R> {
    pub fn new(next: R, user_agent: &str, session: Session) -> Result<Self> {
        let user_agent = HeaderValue::from_str(user_agent)
            .map_err(|_| RetsError::InvalidHeader("User-Agent"))?;
        Ok(DefaultHeaders {
            next,
            user_agent,
            session,
        })
    }
}

#[async_trait]
impl<R: Requester> Requester for DefaultHeaders<R> {
    async fn send(&self, ctx: &Context, mut request: Request) -> Result<Response> {
        let version = HeaderValue::from_str(&self.session.version())
            .map_err(|_| RetsError::InvalidHeader("RETS-Version"))?;

        let headers = request.headers_mut();
        headers.insert(USER_AGENT, self.user_agent.clone());
        headers.insert(RETS_VERSION, version);
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));

        self.next.send(ctx, request).await
    }
}
