//! Streaming decoder for `COMPACT` / `COMPACT-DECODED` search results.
//!
//! ## Wire format
//!
//! ```text
//! <RETS ReplyCode="0" ReplyText="Success">
//! <COUNT Records="10" />
//! <DELIMITER value="09"/>
//! <COLUMNS>\tA\tB\tC\t</COLUMNS>
//! <DATA>\t1\t2\t3\t</DATA>
//! ...
//! <MAXROWS/>
//! </RETS>
//! ```
//!
//! [`CompactResult::open`] reads through `<COLUMNS>`; rows are then produced
//! one `<DATA>` element at a time, never buffered ahead of the consumer.
//!
//! ## States
//!
//! ```text
//! open()          -> header parsed (Streaming)
//! <DATA>          -> Streaming     (one row yielded)
//! <MAXROWS>       -> Streaming     (flag set)
//! </RETS> or EOF  -> Done
//! ```
//!
//! A body cut off anywhere after the header ends iteration normally: every
//! complete row before the cut has been delivered and the partial one is
//! dropped.

use std::io::BufRead;

use crate::error::{DecodeErrorKind, Result, RetsError};
use crate::protocol::xml::{Token, XmlReader, is_truncation};

/// Tab, the delimiter assumed when the body carries no `<DELIMITER>`.
pub const DEFAULT_DELIMITER: u8 = 0x09;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Streaming,
    Done,
}

/// Header of a compact search result plus a lazy cursor over its rows.
pub struct CompactResult<R> {
    pub reply_code: i32,
    pub reply_text: String,
    /// Value of `<COUNT Records>`, 0 when absent.
    pub count: i64,
    pub columns: Vec<String>,
    pub delimiter: u8,
    max_rows: bool,
    state: State,
    xml: XmlReader<R>,
    /// Tokenizer offset of the last row error, to stop on a stuck reader.
    last_error_at: Option<u64>,
}

impl<R: BufRead> CompactResult<R> {
    /// Open a body in lenient mode and read its header.
    pub fn open(input: R) -> Result<Self> {
        Self::from_xml(XmlReader::new(input, false))
    }

    /// Read the header from a preconfigured reader (strictness, charset).
    pub fn from_xml(mut xml: XmlReader<R>) -> Result<Self> {
        let mut reply: Option<(i32, String)> = None;
        let mut count = 0;
        let mut delimiter = None;

        loop {
            let token = match xml.next_token() {
                Ok(token) => token,
                Err(e) if is_truncation(&e) => Token::Eof,
                Err(e) => return Err(e),
            };

            match token {
                Token::Start { ref name, .. } => match name.as_str() {
                    "RETS" => reply = Some(super::reply_status(&token)?),
                    "COUNT" => {
                        if let Some(records) = token.attribute("Records") {
                            count = records.trim().parse().map_err(|_| {
                                RetsError::decode(DecodeErrorKind::InvalidAttribute {
                                    attribute: "Records",
                                    value: records.to_string(),
                                })
                            })?;
                        }
                    }
                    "DELIMITER" => delimiter = Some(parse_delimiter(&token)?),
                    "COLUMNS" => {
                        let (reply_code, reply_text) = reply.ok_or(RetsError::decode(
                            DecodeErrorKind::MissingElement("RETS"),
                        ))?;
                        let raw = match xml.read_raw_text() {
                            Ok(Some(raw)) => raw,
                            Ok(None) => {
                                return Err(RetsError::decode(DecodeErrorKind::UnexpectedEof));
                            }
                            Err(e) if is_truncation(&e) => {
                                return Err(RetsError::decode(DecodeErrorKind::UnexpectedEof));
                            }
                            Err(e) => return Err(e),
                        };
                        let delimiter = delimiter.unwrap_or(DEFAULT_DELIMITER);
                        let columns = split_fields(&raw, delimiter)
                            .map(|c| xml.decode_text(c).map(|name| name.trim().to_string()))
                            .collect::<Result<Vec<String>>>()?;

                        tracing::debug!(
                            reply_code,
                            count,
                            columns = columns.len(),
                            delimiter,
                            "compact header decoded"
                        );

                        return Ok(CompactResult {
                            reply_code,
                            reply_text,
                            count,
                            columns,
                            delimiter,
                            max_rows: false,
                            state: State::Streaming,
                            xml,
                            last_error_at: None,
                        });
                    }
                    _ => {}
                },
                Token::End { ref name } if name == "RETS" => {
                    return Err(match reply {
                        Some((code, text)) if code != 0 => RetsError::Reply { code, text },
                        _ => RetsError::decode(DecodeErrorKind::MissingElement("COLUMNS")),
                    });
                }
                Token::Eof => {
                    return Err(match reply {
                        Some((code, text)) if code != 0 => RetsError::Reply { code, text },
                        _ => RetsError::decode(DecodeErrorKind::UnexpectedEof),
                    });
                }
                _ => {}
            }
        }
    }

    /// Whether `<MAXROWS>` has been seen so far.
    ///
    /// The marker follows the last row, so this is only final once iteration
    /// has finished.
    pub fn max_rows_exceeded(&self) -> bool {
        self.max_rows
    }

    /// Decode the next row.
    ///
    /// Returns `None` once the result is exhausted (closing tag or end of
    /// body). A row that cannot be tokenized is returned as `Some(Err(_))`;
    /// calling again resumes after it.
    pub fn next_row(&mut self) -> Option<Result<Vec<String>>> {
        while self.state == State::Streaming {
            let token = match self.xml.next_token() {
                Ok(token) => token,
                Err(e) => return self.row_error(e),
            };

            match token {
                Token::Start { name, .. } => match name.as_str() {
                    "DATA" => match self.xml.read_raw_text() {
                        Ok(Some(raw)) => match self.split_row(&raw) {
                            Ok(row) => {
                                tracing::trace!(fields = row.len(), "row decoded");
                                return Some(Ok(row));
                            }
                            Err(e) => return self.row_error(e),
                        },
                        Ok(None) => self.finish("body ended inside a row"),
                        Err(e) => return self.row_error(e),
                    },
                    "MAXROWS" => self.max_rows = true,
                    _ => {}
                },
                Token::End { name } if name == "RETS" => self.finish("end of result"),
                Token::Eof => self.finish("end of body"),
                _ => {}
            }
        }
        None
    }

    /// Push every remaining row through `each`, in body order.
    ///
    /// Iteration stops at the first `Err` returned by `each`, which becomes
    /// the result of `listen`. Row decode errors are handed to `each` and do
    /// not stop iteration unless `each` returns them. Reaching the end of the
    /// body, whether or not the closing tags were sent, returns `Ok(())`.
    pub fn listen<F, E>(&mut self, mut each: F) -> std::result::Result<(), E>
    where
        F: FnMut(Result<Vec<String>>) -> std::result::Result<(), E>,
    {
        while let Some(row) = self.next_row() {
            each(row)?;
        }
        Ok(())
    }

    /// Give back the underlying stream so the caller can close it.
    pub fn into_inner(self) -> R {
        self.xml.into_inner()
    }

    fn split_row(&self, raw: &[u8]) -> Result<Vec<String>> {
        let mut row = split_fields(raw, self.delimiter)
            .map(|field| self.xml.decode_text(field))
            .collect::<Result<Vec<String>>>()?;
        row.resize(self.columns.len(), String::new());
        Ok(row)
    }

    fn finish(&mut self, reason: &'static str) {
        tracing::debug!(reason, max_rows = self.max_rows, "compact result finished");
        self.state = State::Done;
    }

    fn row_error(&mut self, err: RetsError) -> Option<Result<Vec<String>>> {
        if is_truncation(&err) {
            self.finish("body truncated");
            return None;
        }

        let position = self.xml.buffer_position();
        if self.last_error_at == Some(position) {
            tracing::warn!(error = %err, position, "reader made no progress after error");
            self.finish("stalled on error");
            return None;
        }
        self.last_error_at = Some(position);
        tracing::debug!(error = %err, position, "row decode failed");
        Some(Err(err))
    }
}

impl<R: BufRead> Iterator for CompactResult<R> {
    type Item = Result<Vec<String>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row()
    }
}

/// Split a raw `<COLUMNS>`/`<DATA>` payload on the delimiter byte.
///
/// Splitting happens before charset translation, so any byte value works as
/// a delimiter. Payloads are framed by a leading and trailing delimiter,
/// which are dropped along with any surrounding line breaks or padding.
fn split_fields(raw: &[u8], delimiter: u8) -> impl Iterator<Item = &[u8]> {
    let padding = |b: &u8| *b != delimiter && b.is_ascii_whitespace();
    let start = raw.iter().position(|b| !padding(b)).unwrap_or(raw.len());
    let end = raw.iter().rposition(|b| !padding(b)).map_or(start, |i| i + 1);
    let raw = &raw[start..end];
    let raw = raw.strip_prefix(&[delimiter]).unwrap_or(raw);
    let raw = raw.strip_suffix(&[delimiter]).unwrap_or(raw);
    raw.split(move |b| *b == delimiter)
}

/// Parse `<DELIMITER value="09"/>`: two hex digits naming one byte.
fn parse_delimiter(token: &Token) -> Result<u8> {
    let value = token.attribute("value").ok_or(RetsError::decode(
        DecodeErrorKind::MissingAttribute {
            element: "DELIMITER",
            attribute: "value",
        },
    ))?;
    let hex = value.trim();
    if hex.is_empty() || hex.len() > 2 {
        return Err(invalid_delimiter(value));
    }
    u8::from_str_radix(hex, 16).map_err(|_| invalid_delimiter(value))
}

fn invalid_delimiter(value: &str) -> RetsError {
    RetsError::decode(DecodeErrorKind::InvalidAttribute {
        attribute: "value",
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMPACT_DECODED: &str = "<RETS ReplyCode=\"0\" ReplyText=\"V2.7.0 2315: Success\">
<COUNT Records=\"10\" />
<DELIMITER value = \"09\"/>
<COLUMNS>\tA\tB\tC\tD\tE\tF\t</COLUMNS>
<DATA>\t1\t2\t3\t4\t\t6\t</DATA>
<DATA>\t1\t2\t3\t4\t\t6\t</DATA>
<DATA>\t1\t2\t3\t4\t\t6\t</DATA>
<DATA>\t1\t2\t3\t4\t\t6\t</DATA>
<DATA>\t1\t2\t3\t4\t\t6\t</DATA>
<DATA>\t1\t2\t3\t4\t\t6\t</DATA>
<DATA>\t1\t2\t3\t4\t\t6\t</DATA>
<DATA>\t1\t2\t3\t4\t\t6\t</DATA>
<MAXROWS/>
</RETS>
";

    fn until_maxrows() -> &'static str {
        COMPACT_DECODED.split("<MAXROWS/>").next().unwrap()
    }

    #[test]
    fn parse_compact_header_and_rows() {
        let mut result = CompactResult::open(COMPACT_DECODED.as_bytes()).unwrap();
        assert_eq!(result.reply_code, 0);
        assert_eq!(result.reply_text, "V2.7.0 2315: Success");
        assert_eq!(result.count, 10);
        assert_eq!(result.delimiter, b'\t');
        assert_eq!(result.columns, vec!["A", "B", "C", "D", "E", "F"]);

        let mut rows = 0;
        result
            .listen(|row| -> Result<()> {
                assert_eq!(row?.join(","), "1,2,3,4,,6");
                rows += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(rows, 8);
        assert!(result.max_rows_exceeded());
    }

    #[test]
    fn truncated_before_marker_delivers_all_rows() {
        let mut result = CompactResult::open(until_maxrows().as_bytes()).unwrap();
        let mut rows = 0;
        let outcome = result.listen(|row| -> Result<()> {
            assert_eq!(row?.join(","), "1,2,3,4,,6");
            rows += 1;
            Ok(())
        });
        assert!(outcome.is_ok());
        assert_eq!(rows, 8);
        assert!(!result.max_rows_exceeded());
    }

    #[test]
    fn truncated_inside_a_row_drops_only_that_row() {
        let body = COMPACT_DECODED.split("<DATA>").take(4).collect::<Vec<_>>().join("<DATA>");
        let body = format!("{body}<DATA>\t1\t2");
        let rows: Vec<_> = CompactResult::open(body.as_bytes()).unwrap().collect();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.is_ok()));

        let cut_in_tag = format!("{}<DA", until_maxrows());
        let rows: Vec<_> = CompactResult::open(cut_in_tag.as_bytes()).unwrap().collect();
        assert_eq!(rows.len(), 8);
    }

    #[test]
    fn empty_body_is_a_decode_error() {
        match CompactResult::open(&b""[..]) {
            Err(RetsError::Decode {
                kind: DecodeErrorKind::UnexpectedEof,
            }) => {}
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("empty body opened"),
        }
    }

    #[test]
    fn body_cut_before_columns_is_a_decode_error() {
        let body = COMPACT_DECODED.split("<COLUMNS>").next().unwrap();
        let err = CompactResult::open(body.as_bytes()).err().unwrap();
        assert!(err.is_decode());
    }

    #[test]
    fn non_zero_reply_without_columns() {
        let body = r#"<RETS ReplyCode="20201" ReplyText="No Records Found" ></RETS>"#;
        match CompactResult::open(body.as_bytes()) {
            Err(RetsError::Reply { code, text }) => {
                assert_eq!(code, 20201);
                assert_eq!(text, "No Records Found");
            }
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("opened without columns"),
        }
    }

    #[test]
    fn callback_error_stops_iteration() {
        let mut result = CompactResult::open(COMPACT_DECODED.as_bytes()).unwrap();
        let mut calls = 0;
        let outcome = result.listen(|_row| {
            calls += 1;
            if calls == 3 { Err("stop") } else { Ok(()) }
        });
        assert_eq!(outcome, Err("stop"));
        assert_eq!(calls, 3);
    }

    #[test]
    fn short_and_padded_rows_are_normalized() {
        let body = "<RETS ReplyCode=\"0\" ReplyText=\"ok\">
<DELIMITER value=\"7C\"/>
<COLUMNS>|ListPrice | City|Beds|</COLUMNS>
<DATA>|100000|Austin|
</DATA>
<DATA>|1|2|3|4|</DATA>
</RETS>";
        let mut result = CompactResult::open(body.as_bytes()).unwrap();
        assert_eq!(result.delimiter, b'|');
        assert_eq!(result.count, 0);
        assert_eq!(result.columns, vec!["ListPrice", "City", "Beds"]);
        assert_eq!(result.next_row().unwrap().unwrap(), vec!["100000", "Austin", ""]);
        assert_eq!(result.next_row().unwrap().unwrap(), vec!["1", "2", "3"]);
        assert!(result.next_row().is_none());
    }

    #[test]
    fn missing_delimiter_defaults_to_tab() {
        let body = "<RETS ReplyCode=\"0\" ReplyText=\"ok\"><COLUMNS>\tA\tB\t</COLUMNS><DATA>\tx\ty\t</DATA></RETS>";
        let mut result = CompactResult::open(body.as_bytes()).unwrap();
        assert_eq!(result.delimiter, DEFAULT_DELIMITER);
        assert_eq!(result.next_row().unwrap().unwrap(), vec!["x", "y"]);
    }

    #[test]
    fn invalid_delimiter_is_rejected() {
        let body = "<RETS ReplyCode=\"0\" ReplyText=\"ok\"><DELIMITER value=\"tab\"/><COLUMNS>A</COLUMNS></RETS>";
        let err = CompactResult::open(body.as_bytes()).err().unwrap();
        assert!(matches!(
            err,
            RetsError::Decode {
                kind: DecodeErrorKind::InvalidAttribute { attribute: "value", .. }
            }
        ));
    }

    #[test]
    fn lenient_rows_keep_raw_ampersands() {
        let body = "<RETS ReplyCode=\"0\" ReplyText=\"ok\"><COLUMNS>\tName\t</COLUMNS><DATA>\tSmith & Sons\t</DATA></RETS>";
        let mut result = CompactResult::open(body.as_bytes()).unwrap();
        assert_eq!(result.next_row().unwrap().unwrap(), vec!["Smith & Sons"]);
    }

    #[test]
    fn strict_row_errors_reach_the_callback() {
        let body = "<RETS ReplyCode=\"0\" ReplyText=\"ok\"><COLUMNS>\tName\t</COLUMNS>\
<DATA>\tfirst\t</DATA><DATA>\tSmith & Sons\t</DATA><DATA>\tlast\t</DATA></RETS>";
        let mut result = CompactResult::from_xml(XmlReader::new(body.as_bytes(), true)).unwrap();

        let mut seen = Vec::new();
        result
            .listen(|row| -> std::result::Result<(), ()> {
                seen.push(row.map(|r| r.join(",")).map_err(|e| e.to_string()));
                Ok(())
            })
            .unwrap();

        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].as_deref(), Ok("first"));
        assert!(seen[1].is_err());
        assert_eq!(seen[2].as_deref(), Ok("last"));
    }

    #[test]
    fn callback_can_abort_on_row_error() {
        let body = "<RETS ReplyCode=\"0\" ReplyText=\"ok\"><COLUMNS>\tName\t</COLUMNS>\
<DATA>\tSmith & Sons\t</DATA><DATA>\tlast\t</DATA></RETS>";
        let mut result = CompactResult::from_xml(XmlReader::new(body.as_bytes(), true)).unwrap();
        let mut calls = 0;
        let outcome = result.listen(|row| {
            calls += 1;
            row.map(|_| ())
        });
        assert!(matches!(outcome, Err(RetsError::Escape(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn high_byte_delimiter_splits_before_decoding() {
        let body = b"<RETS ReplyCode=\"0\" ReplyText=\"ok\"><DELIMITER value=\"A7\"/>\
<COLUMNS>\xA7A\xA7B\xA7</COLUMNS><DATA>\xA71\xA7caf\xC3\xA9\xA7</DATA></RETS>";
        let mut result = CompactResult::open(&body[..]).unwrap();
        assert_eq!(result.delimiter, 0xA7);
        assert_eq!(result.columns, vec!["A", "B"]);
        assert_eq!(result.next_row().unwrap().unwrap(), vec!["1", "caf\u{e9}"]);
        assert!(result.next_row().is_none());

        let strict = CompactResult::from_xml(XmlReader::new(&body[..], true)).unwrap();
        let rows: Vec<_> = strict.collect::<Result<_>>().unwrap();
        assert_eq!(rows, vec![vec!["1", "caf\u{e9}"]]);
    }

    #[test]
    fn high_byte_delimiter_in_declared_charset() {
        let body = b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?>\
<RETS ReplyCode=\"0\" ReplyText=\"ok\"><DELIMITER value=\"A7\"/>\
<COLUMNS>\xA7City\xA7</COLUMNS><DATA>\xA7Montr\xE9al\xA7</DATA></RETS>";
        let mut result = CompactResult::open(&body[..]).unwrap();
        assert_eq!(result.columns, vec!["City"]);
        assert_eq!(result.next_row().unwrap().unwrap(), vec!["Montr\u{e9}al"]);
    }

    #[test]
    fn lenient_untokenizable_row_is_reported_and_skipped() {
        let body = "<RETS ReplyCode=\"0\" ReplyText=\"ok\"><COLUMNS>\tA\tB\t</COLUMNS>\
<DATA>\t1\t2\t</DATA>\
<DATA>\tx<y z\t</DATA>\
<DATA>\t3\t4\t</DATA>\
<DATA>\t5\t6\t</DATA>\
</RETS>";
        let rows: Vec<_> = CompactResult::open(body.as_bytes()).unwrap().collect();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].as_ref().unwrap(), &vec!["1", "2"]);
        assert!(matches!(rows[1], Err(RetsError::Xml(_))));
        assert_eq!(rows[2].as_ref().unwrap(), &vec!["3", "4"]);
        assert_eq!(rows[3].as_ref().unwrap(), &vec!["5", "6"]);
    }

    #[test]
    fn into_inner_returns_remaining_stream() {
        let result = CompactResult::open(COMPACT_DECODED.as_bytes()).unwrap();
        let rest = result.into_inner();
        assert!(std::str::from_utf8(rest).unwrap().contains("<MAXROWS/>"));
    }
}
