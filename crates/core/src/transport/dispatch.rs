use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{COOKIE, SET_COOKIE};
use reqwest::{Request, Response};

use crate::error::Result;
use crate::session::Session;
use crate::transport::{Context, Requester, Transport};

/// Innermost layer: attaches session cookies, performs the round trip under
/// the caller's [`Context`] and records any cookies the server sets.
pub struct Dispatch {
    transport: Arc<dyn Transport>,
    session: Session,
}

impl Dispatch {
    pub fn new(transport: Arc<dyn Transport>, session: Session) -> Self {
        Dispatch { transport, session }
    }
}

#[async_trait]
impl Requester for Dispatch {
    async fn send(&self, ctx: &Context, mut request: Request) -> Result<Response> {
        let url = request.url().clone();
        let method = request.method().clone();

        // A Cookie header set by the caller is sent as given.
        if !request.headers().contains_key(COOKIE) {
            if let Some(cookies) = self.session.cookies().cookies(&url) {
                request.headers_mut().insert(COOKIE, cookies);
            }
        }

        tracing::debug!(%method, %url, "sending request");
        let response = ctx.run(self.transport.round_trip(request)).await?;

        let mut set_cookies = response.headers().get_all(SET_COOKIE).iter().peekable();
        if set_cookies.peek().is_some() {
            self.session.cookies().set_cookies(&mut set_cookies, &url);
        }
        tracing::debug!(%method, %url, status = response.status().as_u16(), "response received");
        Ok(response)
    }
}
