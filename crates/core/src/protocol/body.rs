//! Reading HTTP response bodies with the blocking decoders.
//!
//! The decoders pull bytes through [`std::io::BufRead`] so that a search
//! result is consumed row by row instead of being collected first. An async
//! [`reqwest::Response`] is adapted with [`blocking_reader`]; the decoding
//! itself then belongs on a blocking thread:
//!
//! ```no_run
//! # async fn demo(response: reqwest::Response) -> rets::Result<()> {
//! use rets::protocol::{CompactResult, XmlReader, body};
//!
//! let charset = body::content_charset(&response);
//! let reader = body::blocking_reader(response);
//! tokio::task::spawn_blocking(move || -> rets::Result<()> {
//!     let mut xml = XmlReader::new(reader, false);
//!     if let Some(label) = charset {
//!         xml = xml.with_charset(&label)?;
//!     }
//!     let mut result = CompactResult::from_xml(xml)?;
//!     result.listen(|row| row.map(|fields| println!("{fields:?}")))
//! })
//! .await
//! .expect("decode task panicked")
//! # }
//! ```

use std::io::{self, BufRead, BufReader};

use futures::TryStreamExt;
use reqwest::Response;
use reqwest::header::CONTENT_TYPE;
use tokio_util::io::{StreamReader, SyncIoBridge};

/// Adapt a response body into a blocking reader.
///
/// Must be called from within a Tokio runtime. The returned reader blocks
/// the calling thread on each read, so drive it from
/// [`tokio::task::spawn_blocking`] or a dedicated thread.
pub fn blocking_reader(response: Response) -> impl BufRead + Send + 'static {
    let stream = Box::pin(response.bytes_stream().map_err(io::Error::other));
    BufReader::new(SyncIoBridge::new(StreamReader::new(stream)))
}

/// The `charset` parameter of the response `Content-Type`, if any.
pub fn content_charset(response: &Response) -> Option<String> {
    let content_type = response.headers().get(CONTENT_TYPE)?.to_str().ok()?;
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_string())
    })
}
