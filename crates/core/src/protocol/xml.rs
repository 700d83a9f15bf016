//! Charset-aware XML token reader shared by every RETS body decoder.
//!
//! Wraps a [`quick_xml::Reader`] over any [`BufRead`] and flattens its event
//! stream into owned [`Token`]s. Markup is tokenized byte-wise, so only
//! ASCII-compatible charsets are accepted; names, attribute values and text
//! are translated to UTF-8 with `encoding_rs` according to the charset
//! declared in `<?xml ... encoding="..."?>` (or one supplied by the caller,
//! e.g. from the HTTP `Content-Type`).
//!
//! ## Strict vs. lenient
//!
//! RETS servers routinely emit raw `&` inside data and occasionally mismatched
//! closing tags. In lenient mode (the default for all decoders):
//!
//! - entity references that do not resolve are kept verbatim,
//! - bytes invalid in the active charset are replaced with U+FFFD,
//! - closing tag names are not checked against the open element,
//! - attribute well-formedness checks are skipped.
//!
//! Strict mode turns each of these into an error.

use std::borrow::Cow;
use std::io::BufRead;
use std::sync::Arc;

use encoding_rs::{Encoding, UTF_8};
use quick_xml::Reader;
use quick_xml::errors::SyntaxError;
use quick_xml::events::{BytesStart, Event};

use crate::error::{DecodeErrorKind, Result, RetsError};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Longest entity name considered when recovering from a bad reference.
const MAX_ENTITY_LEN: usize = 10;

/// Maps a charset label to an encoding.
pub trait CharsetResolver: Send + Sync {
    fn resolve(&self, label: &str) -> Option<&'static Encoding>;
}

/// Resolves labels per the WHATWG Encoding Standard (`latin1`, `cp1252`, ...).
#[derive(Debug, Default, Clone, Copy)]
pub struct LabelResolver;

impl CharsetResolver for LabelResolver {
    fn resolve(&self, label: &str) -> Option<&'static Encoding> {
        Encoding::for_label(label.trim().as_bytes())
    }
}

/// A single XML token with all text already translated and unescaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Opening tag (self-closing tags produce a `Start` followed by an `End`).
    Start {
        name: String,
        attributes: Vec<(String, String)>,
    },
    End {
        name: String,
    },
    /// Character data, including CDATA sections.
    Text(String),
    Eof,
}

impl Token {
    /// Attribute value of a `Start` token, matched case-insensitively.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        match self {
            Token::Start { attributes, .. } => attributes
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TextDecoder {
    encoding: &'static Encoding,
    strict: bool,
}

impl TextDecoder {
    fn decode<'a>(&self, bytes: &'a [u8]) -> Result<Cow<'a, str>> {
        if self.strict {
            self.encoding
                .decode_without_bom_handling_and_without_replacement(bytes)
                .ok_or_else(|| {
                    RetsError::decode(DecodeErrorKind::InvalidText(self.encoding.name()))
                })
        } else {
            Ok(self.encoding.decode_without_bom_handling(bytes).0)
        }
    }

    fn text(&self, bytes: &[u8]) -> Result<String> {
        let raw = self.decode(bytes)?;
        if self.strict {
            Ok(quick_xml::escape::unescape(&raw)?.into_owned())
        } else {
            Ok(unescape_lenient(&raw))
        }
    }

    fn start(&self, e: &BytesStart<'_>) -> Result<Token> {
        let name = self.decode(e.local_name().as_ref())?.into_owned();
        let mut attributes = Vec::new();
        for attr in e.attributes().with_checks(self.strict) {
            let attr = attr.map_err(quick_xml::Error::from)?;
            let key = self.decode(attr.key.local_name().as_ref())?.into_owned();
            let value = self.text(&attr.value)?;
            attributes.push((key, value));
        }
        Ok(Token::Start { name, attributes })
    }
}

/// Pull-based XML tokenizer with charset translation.
pub struct XmlReader<R> {
    reader: Reader<R>,
    buf: Vec<u8>,
    decoder: TextDecoder,
    resolver: Arc<dyn CharsetResolver>,
    started: bool,
}

impl<R: BufRead> XmlReader<R> {
    /// Wrap `input`, starting in UTF-8 with the default [`LabelResolver`].
    pub fn new(input: R, strict: bool) -> Self {
        let mut reader = Reader::from_reader(input);
        let config = reader.config_mut();
        config.trim_text(false);
        config.expand_empty_elements = true;
        config.check_end_names = strict;

        XmlReader {
            reader,
            buf: Vec::new(),
            decoder: TextDecoder {
                encoding: UTF_8,
                strict,
            },
            resolver: Arc::new(LabelResolver),
            started: false,
        }
    }

    /// Replace the resolver used for declared charset labels.
    pub fn with_resolver(mut self, resolver: Arc<dyn CharsetResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Preselect a charset, e.g. from the HTTP `Content-Type` parameter.
    ///
    /// A later `encoding` in the XML declaration still takes precedence.
    pub fn with_charset(mut self, label: &str) -> Result<Self> {
        self.select_charset(label)?;
        Ok(self)
    }

    pub fn is_strict(&self) -> bool {
        self.decoder.strict
    }

    /// The charset currently used to translate text.
    pub fn encoding(&self) -> &'static Encoding {
        self.decoder.encoding
    }

    /// Byte offset of the tokenizer in the underlying stream.
    pub fn buffer_position(&self) -> u64 {
        self.reader.buffer_position() as u64
    }

    /// Give back the underlying stream so the caller can close it.
    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }

    /// Read the next significant token.
    ///
    /// Declarations, comments, processing instructions and doctypes are
    /// consumed silently. End of input is reported as [`Token::Eof`].
    pub fn next_token(&mut self) -> Result<Token> {
        if !self.started {
            self.started = true;
            self.skip_bom()?;
        }

        loop {
            self.buf.clear();
            let decoder = self.decoder;
            let declared = match self.reader.read_event_into(&mut self.buf)? {
                Event::Start(e) => return decoder.start(&e),
                Event::End(e) => {
                    let name = decoder.decode(e.local_name().as_ref())?.into_owned();
                    return Ok(Token::End { name });
                }
                Event::Text(t) => return Ok(Token::Text(decoder.text(&t)?)),
                Event::CData(c) => return Ok(Token::Text(decoder.decode(&c)?.into_owned())),
                Event::Eof => return Ok(Token::Eof),
                Event::Decl(decl) => match decl.encoding() {
                    Some(label) => {
                        let label = label.map_err(quick_xml::Error::from)?;
                        Some(String::from_utf8_lossy(&label).into_owned())
                    }
                    None => None,
                },
                _ => None,
            };
            if let Some(label) = declared {
                self.select_charset(&label)?;
            }
        }
    }

    /// Collect the character data of the element whose `Start` was just read,
    /// consuming through its matching `End`.
    ///
    /// Returns `Ok(None)` if the input ends first. A text translation error
    /// does not stop the scan; the element is consumed and the first such
    /// error is returned, leaving the reader positioned after the element.
    pub fn read_text(&mut self) -> Result<Option<String>> {
        let mut text = String::new();
        let mut depth = 0usize;
        let mut failure = None;

        loop {
            match self.next_token() {
                Ok(Token::Text(t)) => text.push_str(&t),
                Ok(Token::Start { .. }) => depth += 1,
                Ok(Token::End { .. }) if depth == 0 => break,
                Ok(Token::End { .. }) => depth -= 1,
                Ok(Token::Eof) => return Ok(None),
                Err(e @ (RetsError::Escape(_) | RetsError::Decode { .. })) => {
                    failure.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(Some(text)),
        }
    }

    /// Like [`read_text`](Self::read_text), but returns the element's
    /// character data untranslated and still escaped.
    ///
    /// Used where the payload is split on a raw byte before decoding; each
    /// piece is then translated with [`decode_text`](Self::decode_text).
    /// CDATA content is re-escaped so that it survives that step verbatim.
    pub fn read_raw_text(&mut self) -> Result<Option<Vec<u8>>> {
        let strict = self.decoder.strict;
        let mut raw = Vec::new();
        let mut depth = 0usize;

        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf)? {
                Event::Text(t) => raw.extend_from_slice(&t),
                Event::CData(c) => {
                    for &b in c.iter() {
                        match b {
                            b'&' => raw.extend_from_slice(b"&amp;"),
                            _ => raw.push(b),
                        }
                    }
                }
                Event::Start(e) => {
                    for attr in e.attributes().with_checks(strict) {
                        attr.map_err(quick_xml::Error::from)?;
                    }
                    depth += 1;
                }
                Event::End(_) if depth == 0 => return Ok(Some(raw)),
                Event::End(_) => depth -= 1,
                Event::Eof => return Ok(None),
                _ => {}
            }
        }
    }

    /// Translate and unescape a piece of raw character data with the active
    /// charset and strictness.
    pub fn decode_text(&self, raw: &[u8]) -> Result<String> {
        self.decoder.text(raw)
    }

    fn skip_bom(&mut self) -> Result<()> {
        let input = self.reader.get_mut();
        if input.fill_buf()?.starts_with(UTF8_BOM) {
            input.consume(UTF8_BOM.len());
        }
        Ok(())
    }

    fn select_charset(&mut self, label: &str) -> Result<()> {
        match self.resolver.resolve(label) {
            Some(encoding) if encoding.is_ascii_compatible() => {
                tracing::debug!(charset = encoding.name(), "selected body charset");
                self.decoder.encoding = encoding;
                Ok(())
            }
            _ if self.decoder.strict => Err(RetsError::decode(
                DecodeErrorKind::UnsupportedCharset(label.to_string()),
            )),
            _ => {
                tracing::warn!(charset = label, "unsupported charset, keeping {}", self.decoder.encoding.name());
                Ok(())
            }
        }
    }
}

/// Whether a tokenizer error means the body was cut off rather than malformed.
pub(crate) fn is_truncation(err: &RetsError) -> bool {
    match err {
        RetsError::Xml(quick_xml::Error::Syntax(kind)) => {
            !matches!(kind, SyntaxError::InvalidBangMarkup)
        }
        RetsError::Xml(quick_xml::Error::Io(e)) => e.kind() == std::io::ErrorKind::UnexpectedEof,
        RetsError::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
        _ => false,
    }
}

/// Resolve what can be resolved and keep every other `&` verbatim.
fn unescape_lenient(raw: &str) -> String {
    if let Ok(text) = quick_xml::escape::unescape(raw) {
        return text.into_owned();
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];

        let resolved = rest[1..]
            .find(';')
            .filter(|&end| end <= MAX_ENTITY_LEN)
            .and_then(|end| resolve_entity(&rest[1..1 + end]).map(|value| (value, end + 2)));

        match resolved {
            Some((value, consumed)) => {
                out.push_str(&value);
                rest = &rest[consumed..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn resolve_entity(name: &str) -> Option<String> {
    if let Some(number) = name.strip_prefix('#') {
        let code = match number.strip_prefix(['x', 'X']) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => number.parse().ok()?,
        };
        return char::from_u32(code).map(String::from);
    }
    quick_xml::escape::resolve_predefined_entity(name).map(str::to_string)
}
