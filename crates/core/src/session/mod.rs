//! Client-side RETS session state.
//!
//! A RETS session begins when the server answers Login with a
//! `RETS-Session-ID` cookie and ends at Logout. The state shared by every
//! layer of the request pipeline is small:
//!
//! - the cookie store, written by [`Dispatch`](crate::transport::Dispatch)
//!   and read by the user-agent digest;
//! - the protocol version sent in `RETS-Version`, which a caller may change
//!   after the server reports what it supports.
//!
//! [`Session`] is a cheap handle; clones share the same state.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::Url;
use reqwest::cookie::{CookieStore, Jar};

use crate::transport::headers::RETS_SESSION_ID;

struct Inner {
    cookies: Arc<dyn CookieStore>,
    version: RwLock<String>,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// A session with an empty in-memory cookie jar.
    pub fn new(version: &str) -> Self {
        Self::with_cookie_store(Arc::new(Jar::default()), version)
    }

    /// A session backed by a caller-supplied cookie store, e.g. one shared
    /// with other clients or restored from disk.
    pub fn with_cookie_store(cookies: Arc<dyn CookieStore>, version: &str) -> Self {
        Session {
            inner: Arc::new(Inner {
                cookies,
                version: RwLock::new(version.to_string()),
            }),
        }
    }

    pub fn cookies(&self) -> &Arc<dyn CookieStore> {
        &self.inner.cookies
    }

    /// The `RETS-Session-ID` cookie the store would send to `url`.
    pub fn session_id(&self, url: &Url) -> Option<String> {
        let header = self.inner.cookies.cookies(url)?;
        let header = header.to_str().ok()?;
        header.split(';').find_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            name.trim()
                .eq_ignore_ascii_case(RETS_SESSION_ID)
                .then(|| value.trim().to_string())
        })
    }

    pub fn version(&self) -> String {
        self.inner.version.read().clone()
    }

    pub fn set_version(&self, version: &str) {
        let mut current = self.inner.version.write();
        if *current != version {
            tracing::debug!(old = %*current, new = version, "protocol version changed");
            *current = version.to_string();
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("version", &*self.inner.version.read())
            .finish_non_exhaustive()
    }
}
