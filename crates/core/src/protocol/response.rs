use std::collections::BTreeMap;
use std::io::BufRead;

use crate::error::{DecodeErrorKind, Result, RetsError};
use crate::protocol::xml::{Token, XmlReader, is_truncation};

/// Capability URL keys a login response may advertise.
pub const CAPABILITIES: &[&str] = &[
    "Action",
    "ChangePassword",
    "GetMetadata",
    "GetObject",
    "GetPayloadList",
    "Login",
    "LoginComplete",
    "Logout",
    "PostObject",
    "Search",
    "ServerInformation",
    "Update",
];

/// The `Key=Value` block of a short RETS reply.
///
/// ```text
/// <RETS ReplyCode="0" ReplyText="Logging out">
///   <RETS-RESPONSE>
///     ConnectTime=12345
///     SignOffMessage=Goodbye
///   </RETS-RESPONSE>
/// </RETS>
/// ```
///
/// The block is line-oriented text, not XML structure. Lines without `=` are
/// skipped, keys and values are trimmed, and values may contain spaces or
/// further `=` characters. RETS 1.0 servers put the block directly inside
/// `<RETS>`; that form is accepted as well.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseBlock {
    pub reply_code: i32,
    pub reply_text: String,
    /// Entries in body order.
    pub entries: Vec<(String, String)>,
}

impl ResponseBlock {
    /// Decode a body in lenient mode.
    pub fn decode<R: BufRead>(input: R) -> Result<Self> {
        Self::from_xml(XmlReader::new(input, false))
    }

    pub fn from_xml<R: BufRead>(mut xml: XmlReader<R>) -> Result<Self> {
        let mut reply = None;
        let mut root_text = String::new();
        let mut block = None;

        loop {
            let token = match xml.next_token() {
                Ok(token) => token,
                Err(e) if is_truncation(&e) => Token::Eof,
                Err(e) => return Err(e),
            };

            match token {
                Token::Start { ref name, .. } if name == "RETS" => {
                    reply = Some(super::reply_status(&token)?);
                }
                Token::Start { ref name, .. } if name == "RETS-RESPONSE" => {
                    block = match xml.read_text() {
                        Ok(Some(text)) => Some(text),
                        Ok(None) => None,
                        Err(e) if is_truncation(&e) => None,
                        Err(e) => return Err(e),
                    };
                    if block.is_none() {
                        return Err(RetsError::decode(DecodeErrorKind::UnexpectedEof));
                    }
                }
                Token::Text(text) if reply.is_some() => root_text.push_str(&text),
                Token::End { ref name } if name == "RETS" => break,
                Token::Eof => break,
                _ => {}
            }
        }

        let (reply_code, reply_text) = reply.ok_or(RetsError::decode(
            DecodeErrorKind::MissingElement("RETS"),
        ))?;
        let entries = parse_entries(block.as_deref().unwrap_or(&root_text));

        tracing::debug!(reply_code, entries = entries.len(), "response block decoded");

        Ok(ResponseBlock {
            reply_code,
            reply_text,
            entries,
        })
    }

    /// First value for `key`, matched case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

fn parse_entries(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim(), value.trim()))
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        RetsError::decode(DecodeErrorKind::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    })
}

/// Reply to a Logout transaction.
///
/// Every key in the block is optional; an absent key leaves its zero value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogoutResponse {
    pub reply_code: i32,
    pub reply_text: String,
    /// Session length in seconds.
    pub connect_time: i64,
    pub billing: String,
    pub sign_off_message: String,
}

impl LogoutResponse {
    pub fn decode<R: BufRead>(input: R) -> Result<Self> {
        Self::try_from(ResponseBlock::decode(input)?)
    }
}

impl TryFrom<ResponseBlock> for LogoutResponse {
    type Error = RetsError;

    fn try_from(block: ResponseBlock) -> Result<Self> {
        let mut logout = LogoutResponse {
            reply_code: block.reply_code,
            reply_text: block.reply_text,
            ..Default::default()
        };

        for (key, value) in block.entries {
            match key.to_ascii_lowercase().as_str() {
                "connecttime" => logout.connect_time = parse_number(&key, &value)?,
                "billing" => logout.billing = value,
                "signoffmessage" => logout.sign_off_message = value,
                _ => {}
            }
        }

        Ok(logout)
    }
}

/// Reply to a Login transaction: session details and capability URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginResponse {
    pub reply_code: i32,
    pub reply_text: String,
    pub member_name: String,
    /// Raw `User` value: `user-id,user-level,user-class,agent-code`.
    pub user: String,
    pub broker: String,
    pub metadata_version: String,
    pub min_metadata_version: String,
    pub metadata_timestamp: String,
    pub min_metadata_timestamp: String,
    /// Server idle timeout, when advertised.
    pub timeout_secs: Option<u64>,
    /// Capability name (as listed in [`CAPABILITIES`]) to URL.
    pub capabilities: BTreeMap<String, String>,
}

impl LoginResponse {
    pub fn decode<R: BufRead>(input: R) -> Result<Self> {
        Self::try_from(ResponseBlock::decode(input)?)
    }

    /// URL advertised for a capability, e.g. `"Search"`.
    pub fn capability_url(&self, name: &str) -> Option<&str> {
        self.capabilities
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl TryFrom<ResponseBlock> for LoginResponse {
    type Error = RetsError;

    fn try_from(block: ResponseBlock) -> Result<Self> {
        let mut login = LoginResponse {
            reply_code: block.reply_code,
            reply_text: block.reply_text,
            ..Default::default()
        };

        for (key, value) in block.entries {
            match key.to_ascii_lowercase().as_str() {
                "membername" => login.member_name = value,
                "user" => login.user = value,
                "broker" => login.broker = value,
                "metadataversion" => login.metadata_version = value,
                "minmetadataversion" => login.min_metadata_version = value,
                "metadatatimestamp" => login.metadata_timestamp = value,
                "minmetadatatimestamp" => login.min_metadata_timestamp = value,
                "timeoutseconds" => login.timeout_secs = Some(parse_number(&key, &value)?),
                _ => {
                    if let Some(name) = CAPABILITIES.iter().find(|c| c.eq_ignore_ascii_case(&key)) {
                        login.capabilities.insert(name.to_string(), value);
                    }
                }
            }
        }

        Ok(login)
    }
}
