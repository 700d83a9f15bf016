//! RETS response decoding.
//!
//! RETS (Real Estate Transaction Standard) carries every transaction over
//! HTTP and wraps every reply in a `<RETS>` element:
//!
//! ```text
//! <RETS ReplyCode="0" ReplyText="Success">
//!   ...transaction specific payload...
//! </RETS>
//! ```
//!
//! Two payload shapes are decoded here:
//!
//! | Shape | Used by | Decoder |
//! |-------|---------|---------|
//! | `Key=Value` lines in `<RETS-RESPONSE>` | Login, Logout | [`ResponseBlock`], [`LoginResponse`], [`LogoutResponse`] |
//! | Delimited rows in `<COLUMNS>`/`<DATA>` | Search (`COMPACT`, `COMPACT-DECODED`) | [`CompactResult`] |
//!
//! Both sit on [`XmlReader`], which handles charset translation and the
//! strict/lenient switch. Decoders are synchronous over [`std::io::BufRead`];
//! see [`body`] for reading an HTTP response body from async code.

pub mod body;
pub mod compact;
pub mod response;
pub mod xml;

pub use compact::CompactResult;
pub use response::{LoginResponse, LogoutResponse, ResponseBlock};
pub use xml::{CharsetResolver, LabelResolver, Token, XmlReader};

use crate::error::{DecodeErrorKind, Result, RetsError};

/// Read `ReplyCode` (required, integer) and `ReplyText` (required, may be
/// empty) from a `<RETS>` start token.
pub(crate) fn reply_status(token: &Token) -> Result<(i32, String)> {
    let code = token.attribute("ReplyCode").ok_or(RetsError::decode(
        DecodeErrorKind::MissingAttribute {
            element: "RETS",
            attribute: "ReplyCode",
        },
    ))?;
    let code = code.trim().parse().map_err(|_| {
        RetsError::decode(DecodeErrorKind::InvalidAttribute {
            attribute: "ReplyCode",
            value: code.to_string(),
        })
    })?;
    let text = token.attribute("ReplyText").ok_or(RetsError::decode(
        DecodeErrorKind::MissingAttribute {
            element: "RETS",
            attribute: "ReplyText",
        },
    ))?;
    Ok((code, text.to_string()))
}
