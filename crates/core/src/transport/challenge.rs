//! HTTP challenge/response authentication (RFC 2617).
//!
//! RETS servers answer an unauthenticated request with
//!
//! ```text
//! HTTP/1.1 401 Unauthorized
//! WWW-Authenticate: Digest realm="rets@example.com", nonce="...", qop="auth", opaque="..."
//! ```
//!
//! [`WwwAuth`] answers the challenge exactly once. A second 401 means the
//! credentials were rejected and is returned as an error.

use std::fmt;

use async_trait::async_trait;
use base64::prelude::{BASE64_STANDARD, Engine as _};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, WWW_AUTHENTICATE};
use reqwest::{Request, Response, StatusCode, Url};

use crate::error::{Result, RetsError};
use crate::transport::ua::md5_hex;
use crate::transport::{Context, Requester};

/// Username and password for HTTP authentication.
#[derive(Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str) -> Self {
        Credentials {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Basic {
        realm: Option<String>,
    },
    Digest {
        realm: String,
        nonce: String,
        opaque: Option<String>,
        /// Offered quality-of-protection options, lowercased.
        qop: Vec<String>,
        algorithm: Option<String>,
    },
}

impl Challenge {
    /// Parse one `WWW-Authenticate` header value.
    ///
    /// Returns `None` for unknown schemes or a Digest challenge without a nonce.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, rest) = header
            .split_once(char::is_whitespace)
            .unwrap_or((header, ""));
        let params = parse_params(rest);
        let param = |name: &str| {
            params
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.clone())
        };

        if scheme.eq_ignore_ascii_case("basic") {
            Some(Challenge::Basic {
                realm: param("realm"),
            })
        } else if scheme.eq_ignore_ascii_case("digest") {
            Some(Challenge::Digest {
                realm: param("realm").unwrap_or_default(),
                nonce: param("nonce")?,
                opaque: param("opaque"),
                qop: param("qop")
                    .map(|q| {
                        q.split(',')
                            .map(|o| o.trim().to_ascii_lowercase())
                            .filter(|o| !o.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
                algorithm: param("algorithm"),
            })
        } else {
            None
        }
    }

    /// Pick the strongest supported challenge from a response's headers.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let mut challenges = headers
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(Challenge::parse);
        let first = challenges.next()?;
        if matches!(first, Challenge::Digest { .. }) {
            return Some(first);
        }
        Some(
            challenges
                .find(|c| matches!(c, Challenge::Digest { .. }))
                .unwrap_or(first),
        )
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Challenge::Basic { .. } => "Basic",
            Challenge::Digest { .. } => "Digest",
        }
    }

    /// Build the `Authorization` header value answering this challenge.
    ///
    /// `uri` is the request target (path and query), `cnonce` the client
    /// nonce used when the server offers `qop=auth`.
    pub fn authorization(
        &self,
        credentials: &Credentials,
        method: &str,
        uri: &str,
        cnonce: &str,
    ) -> Result<String> {
        match self {
            Challenge::Basic { .. } => {
                let token = BASE64_STANDARD
                    .encode(format!("{}:{}", credentials.username, credentials.password));
                Ok(format!("Basic {token}"))
            }
            Challenge::Digest {
                realm,
                nonce,
                opaque,
                qop,
                algorithm,
            } => {
                let sess = match algorithm.as_deref() {
                    None => false,
                    Some(a) if a.eq_ignore_ascii_case("MD5") => false,
                    Some(a) if a.eq_ignore_ascii_case("MD5-sess") => true,
                    Some(other) => {
                        return Err(RetsError::Authentication(format!(
                            "unsupported digest algorithm {other}"
                        )));
                    }
                };
                let qop_auth = qop.iter().any(|q| q == "auth");
                if !qop.is_empty() && !qop_auth {
                    return Err(RetsError::Authentication(format!(
                        "unsupported digest qop {}",
                        qop.join(",")
                    )));
                }

                let mut ha1 = md5_hex(format!(
                    "{}:{realm}:{}",
                    credentials.username, credentials.password
                ));
                if sess {
                    ha1 = md5_hex(format!("{ha1}:{nonce}:{cnonce}"));
                }
                let ha2 = md5_hex(format!("{method}:{uri}"));

                let mut header = format!(
                    "Digest username=\"{}\", realm=\"{realm}\", nonce=\"{nonce}\", uri=\"{uri}\"",
                    credentials.username
                );
                if qop_auth {
                    let nc = "00000001";
                    let response = md5_hex(format!("{ha1}:{nonce}:{nc}:{cnonce}:auth:{ha2}"));
                    header.push_str(&format!(
                        ", qop=auth, nc={nc}, cnonce=\"{cnonce}\", response=\"{response}\""
                    ));
                } else {
                    let response = md5_hex(format!("{ha1}:{nonce}:{ha2}"));
                    header.push_str(&format!(", response=\"{response}\""));
                }
                if let Some(algorithm) = algorithm {
                    header.push_str(&format!(", algorithm={algorithm}"));
                }
                if let Some(opaque) = opaque {
                    header.push_str(&format!(", opaque=\"{opaque}\""));
                }
                Ok(header)
            }
        }
    }
}

/// Split `name=value, name="quoted, value"` into lowercased names and
/// unquoted values.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim();

    while let Some(eq) = rest.find('=') {
        let name = rest[..eq].trim().trim_start_matches(',').trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let mut value = String::new();
            let mut end = quoted.len();
            let mut escaped = false;
            for (i, c) in quoted.char_indices() {
                if escaped {
                    value.push(c);
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    end = i + 1;
                    break;
                } else {
                    value.push(c);
                }
            }
            rest = &quoted[end..];
            value
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };

        rest = rest.trim_start().trim_start_matches(',').trim_start();
        params.push((name, value));
    }
    params
}

/// Request target used in the digest: path plus query.
fn request_uri(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}

/// Answers one HTTP authentication challenge per request.
pub struct WwwAuth<R> {
    next: R,
    credentials: Credentials,
}

impl<R: Requester> WwwAuth<R> {
    pub fn new(next: R, credentials: Credentials) -> Self {
        WwwAuth { next, credentials }
    }
}

#[async_trait]
impl<R: Requester> Requester for WwwAuth<R> {
    async fn send(&self, ctx: &Context, request: Request) -> Result<Response> {
        let replay = request.try_clone();
        let response = self.next.send(ctx, request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let Some(challenge) = Challenge::from_headers(response.headers()) else {
            tracing::debug!("401 without a usable challenge");
            return Ok(response);
        };

        let mut retry = replay.ok_or_else(|| {
            RetsError::Authentication("request body cannot be replayed for the challenge".to_string())
        })?;
        let cnonce = format!("{:016x}", rand::random::<u64>());
        let authorization = challenge.authorization(
            &self.credentials,
            retry.method().as_str(),
            &request_uri(retry.url()),
            &cnonce,
        )?;
        let value = HeaderValue::from_str(&authorization).map_err(|_| {
            RetsError::Authentication("authorization is not a valid header value".to_string())
        })?;
        retry.headers_mut().insert(AUTHORIZATION, value);

        tracing::info!(scheme = challenge.scheme(), url = %retry.url(), "answering authentication challenge");
        let response = self.next.send(ctx, retry).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!(scheme = challenge.scheme(), "credentials rejected after challenge");
            return Err(RetsError::Authentication(format!(
                "{} challenge repeated after credentials were sent",
                challenge.scheme()
            )));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use crate::transport::testing::{StubTransport, get, ok, reply};
    use crate::transport::{Dispatch, Transport};
    use std::sync::Arc;

    const DIGEST: &str = r#"Digest realm="rets@example.com", nonce="n0nce", qop="auth,auth-int", opaque="0paque""#;

    fn challenge_reply(header: &'static str) -> http::Response<&'static str> {
        reply(401).header("www-authenticate", header).body("").unwrap()
    }

    fn stack(stub: &Arc<StubTransport>) -> WwwAuth<Dispatch> {
        let dispatch = Dispatch::new(stub.clone() as Arc<dyn Transport>, Session::new("RETS/1.7.2"));
        WwwAuth::new(dispatch, Credentials::new("user", "pass"))
    }

    #[test]
    fn rfc2617_example() {
        let challenge = Challenge::parse(
            r#"Digest realm="testrealm@host.com", qop="auth,auth-int", nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093", opaque="5ccc069c403ebaf9f0171e9517f40e41""#,
        )
        .unwrap();
        let header = challenge
            .authorization(
                &Credentials::new("Mufasa", "Circle Of Life"),
                "GET",
                "/dir/index.html",
                "0a4f113b",
            )
            .unwrap();
        assert!(header.starts_with(r#"Digest username="Mufasa", realm="testrealm@host.com""#));
        assert!(header.contains(r#"response="6629fae49393a05397450978507c4ef1""#));
        assert!(header.contains("qop=auth, nc=00000001"));
        assert!(header.contains(r#"opaque="5ccc069c403ebaf9f0171e9517f40e41""#));
    }

    #[test]
    fn parse_params_handles_quotes_and_commas() {
        let params = parse_params(r#"realm="a, \"b\"", nonce=xyz ,qop="auth""#);
        assert_eq!(
            params,
            vec![
                ("realm".to_string(), r#"a, "b""#.to_string()),
                ("nonce".to_string(), "xyz".to_string()),
                ("qop".to_string(), "auth".to_string()),
            ]
        );
    }

    #[test]
    fn basic_challenge() {
        let challenge = Challenge::parse(r#"Basic realm="RETS""#).unwrap();
        let header = challenge
            .authorization(&Credentials::new("Aladdin", "open sesame"), "GET", "/", "")
            .unwrap();
        assert_eq!(header, "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
    }

    #[test]
    fn digest_preferred_over_basic() {
        let mut headers = HeaderMap::new();
        headers.append(WWW_AUTHENTICATE, HeaderValue::from_static(r#"Basic realm="x""#));
        headers.append(WWW_AUTHENTICATE, HeaderValue::from_static(DIGEST));
        assert_eq!(Challenge::from_headers(&headers).unwrap().scheme(), "Digest");
    }

    #[test]
    fn unsupported_digest_options() {
        let creds = Credentials::new("u", "p");
        let sha = Challenge::parse(r#"Digest realm="r", nonce="n", algorithm=SHA-256"#).unwrap();
        assert!(sha.authorization(&creds, "GET", "/", "c").unwrap_err().is_auth());
        let int = Challenge::parse(r#"Digest realm="r", nonce="n", qop="auth-int""#).unwrap();
        assert!(int.authorization(&creds, "GET", "/", "c").unwrap_err().is_auth());
        assert_eq!(Challenge::parse("Negotiate abc"), None);
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let text = format!("{:?}", Credentials::new("user", "hunter2"));
        assert!(!text.contains("hunter2"));
    }

    #[tokio::test]
    async fn challenge_then_success_sends_twice() {
        let stub = Arc::new(StubTransport::new(vec![challenge_reply(DIGEST), ok("welcome")]));
        let layer = stack(&stub);

        let response = layer
            .send(&Context::new(), get("http://rets.example.com/rets/login?x=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(stub.calls(), 2);
        assert_eq!(stub.header(0, "authorization"), None);

        let sent = stub.header(1, "authorization").unwrap();
        let cnonce = parse_params(sent.trim_start_matches("Digest "))
            .into_iter()
            .find(|(k, _)| k == "cnonce")
            .map(|(_, v)| v)
            .unwrap();
        let expected = Challenge::parse(DIGEST)
            .unwrap()
            .authorization(&Credentials::new("user", "pass"), "GET", "/rets/login?x=1", &cnonce)
            .unwrap();
        assert_eq!(sent, expected);
    }

    #[tokio::test]
    async fn second_challenge_is_fatal() {
        let stub = Arc::new(StubTransport::new(vec![
            challenge_reply(DIGEST),
            challenge_reply(DIGEST),
            ok("never"),
        ]));
        let layer = stack(&stub);

        let err = layer
            .send(&Context::new(), get("http://rets.example.com/login"))
            .await
            .unwrap_err();
        assert!(err.is_auth());
        assert_eq!(stub.calls(), 2);
    }

    #[tokio::test]
    async fn unauthorized_without_challenge_is_returned() {
        let stub = Arc::new(StubTransport::new(vec![reply(401).body("no").unwrap()]));
        let layer = stack(&stub);
        let response = layer
            .send(&Context::new(), get("http://rets.example.com/login"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn streaming_body_cannot_be_replayed() {
        let stub = Arc::new(StubTransport::new(vec![challenge_reply(DIGEST)]));
        let layer = stack(&stub);

        let chunks: Vec<std::result::Result<&'static str, std::io::Error>> = vec![Ok("a=b")];
        let mut request = get("http://rets.example.com/search");
        *request.body_mut() = Some(reqwest::Body::wrap_stream(futures::stream::iter(chunks)));

        let err = layer.send(&Context::new(), request).await.unwrap_err();
        assert!(err.is_auth());
        assert_eq!(stub.calls(), 1);
    }
}
