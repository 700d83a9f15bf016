use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{Request, Response, redirect};

use crate::error::Result;
use crate::session::Session;
use crate::transport::{
    Context, Credentials, DefaultHeaders, Dispatch, Requester, Transport, UserAgentAuth,
    UserAgentSigner, WwwAuth,
};

/// Identification sent when the caller configures none.
pub const DEFAULT_USER_AGENT: &str = concat!("rets-rs/", env!("CARGO_PKG_VERSION"));
/// Protocol version requested until the caller changes it.
pub const DEFAULT_VERSION: &str = "RETS/1.7.2";

/// Everything needed to assemble a [`Client`].
#[derive(Clone)]
pub struct ClientConfig {
    /// HTTP challenge credentials.
    pub credentials: Credentials,
    pub user_agent: String,
    /// Enables the `RETS-UA-Authorization` digest when set and non-empty.
    pub user_agent_password: Option<String>,
    /// Initial `RETS-Version`.
    pub version: String,
    /// Whole-request timeout of the default HTTP transport.
    pub timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            user_agent_password: None,
            version: DEFAULT_VERSION.to_string(),
            timeout: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("credentials", &self.credentials)
            .field("user_agent", &self.user_agent)
            .field(
                "user_agent_password",
                &self.user_agent_password.as_ref().map(|_| "<redacted>"),
            )
            .field("version", &self.version)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ClientConfig {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            credentials: Credentials::new(username, password),
            ..Self::default()
        }
    }
}

type Pipeline = DefaultHeaders<UserAgentAuth<WwwAuth<Dispatch>>>;

/// The composed request pipeline for one logical RETS connection.
///
/// Cheap to share behind an [`Arc`]; all layers see the same [`Session`].
pub struct Client {
    pipeline: Pipeline,
    session: Session,
}

/// Build a client over a [`reqwest::Client`] with an in-memory cookie jar.
///
/// Redirects are not followed so that every `Set-Cookie` passes through the
/// session store.
pub fn build(config: ClientConfig) -> Result<Client> {
    let mut http = reqwest::Client::builder()
        .redirect(redirect::Policy::none())
        .http1_title_case_headers();
    if let Some(timeout) = config.timeout {
        http = http.timeout(timeout);
    }
    let http = http.build()?;
    build_with_transport(config, Arc::new(http), Arc::new(Jar::default()))
}

/// Build a client over any [`Transport`] and cookie store.
pub fn build_with_transport(
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    cookies: Arc<dyn CookieStore>,
) -> Result<Client> {
    Builder::new(config, transport, cookies).finish()
}

/// Assembles the pipeline, optionally with a custom user-agent signer.
pub struct Builder {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    cookies: Arc<dyn CookieStore>,
    signer: Option<Arc<dyn UserAgentSigner>>,
}

impl Builder {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        cookies: Arc<dyn CookieStore>,
    ) -> Self {
        Builder {
            config,
            transport,
            cookies,
            signer: None,
        }
    }

    pub fn signer(mut self, signer: Arc<dyn UserAgentSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn finish(self) -> Result<Client> {
        let config = self.config;
        let session = Session::with_cookie_store(self.cookies, &config.version);

        let dispatch = Dispatch::new(self.transport, session.clone());
        let www = WwwAuth::new(dispatch, config.credentials.clone());
        let mut ua = UserAgentAuth::new(
            www,
            &config.user_agent,
            config.user_agent_password.as_deref(),
            session.clone(),
        );
        if let Some(signer) = self.signer {
            ua = ua.with_signer(signer);
        }
        let pipeline = DefaultHeaders::new(ua, &config.user_agent, session.clone())?;

        tracing::debug!(
            user = %config.credentials.username,
            user_agent = %config.user_agent,
            version = %config.version,
            ua_digest = config.user_agent_password.as_deref().is_some_and(|p| !p.is_empty()),
            "client built"
        );
        Ok(Client { pipeline, session })
    }
}

impl Client {
    pub fn session(&self) -> &Session {
        &self.session
    }
}

#[async_trait]
impl Requester for Client {
    async fn send(&self, ctx: &Context, request: Request) -> Result<Response> {
        self.pipeline.send(ctx, request).await
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
