//! Push-driven multipart/form-data parser
//!
//! The parser is sans-IO: callers feed raw body bytes with
//! [`write`](MultipartParser::write) and close the input with
//! [`finish`](MultipartParser::finish); both return the events produced by
//! those bytes. Limit violations and protocol errors are fatal for the
//! request.

use crate::config::UploadLimits;
use crate::multipart::scanner::{BoundaryScanner, ScanOutcome};

use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use memchr::memmem;

/// Which configured limit was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    FileSize,
    Files,
    Fields,
    FieldSize,
    FieldNameSize,
    HeaderSize,
}

impl LimitKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileSize => "file_size",
            Self::Files => "files",
            Self::Fields => "fields",
            Self::FieldSize => "field_size",
            Self::FieldNameSize => "field_name_size",
            Self::HeaderSize => "header_size",
        }
    }

    /// Count limits suggest 400; size limits suggest 413.
    #[must_use]
    pub fn is_count(self) -> bool {
        matches!(self, Self::Files | Self::Fields)
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MultipartError {
    #[error("MultipartError: MissingBoundary")]
    MissingBoundary,
    #[error("MultipartError: MalformedHeader")]
    MalformedHeader,
    #[error("MultipartError: MissingContentDisposition")]
    MissingContentDisposition,
    #[error("MultipartError: UnexpectedEnd")]
    UnexpectedEnd,
    #[error("MultipartError: LimitExceeded: {kind} limit of {limit} exceeded")]
    LimitExceeded { kind: LimitKind, limit: u64 },
}

impl From<MultipartError> for crate::UploadError {
    fn from(err: MultipartError) -> Self {
        use crate::UploadErrorCode;
        let code = match err {
            MultipartError::MissingBoundary => UploadErrorCode::MissingBoundary,
            MultipartError::MalformedHeader => UploadErrorCode::MalformedHeader,
            MultipartError::MissingContentDisposition => UploadErrorCode::MissingContentDisposition,
            MultipartError::UnexpectedEnd => UploadErrorCode::UnexpectedEnd,
            MultipartError::LimitExceeded { .. } => UploadErrorCode::LimitExceeded,
        };
        let mut ans = Self::with_message(code, err.to_string());
        if let MultipartError::LimitExceeded { kind, .. } = err
            && kind.is_count()
        {
            ans.set_status(http::StatusCode::BAD_REQUEST);
        }
        ans
    }
}

/// Immutable description of a file part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub field_name: String,
    pub filename: String,
    pub mime_type: String,
    pub encoding: String,
}

/// Events produced by the parser, in byte order of the request.
#[derive(Debug)]
pub enum ParseEvent {
    /// A completed text field.
    Field { name: String, value: String },
    /// A file part begins; `FileData` events follow until `FileEnd`.
    FileBegin(FileInfo),
    /// Body bytes of the current file part, trailing CRLF already stripped.
    FileData(Bytes),
    /// The current file part is complete.
    FileEnd,
    /// The final boundary was seen; any trailing bytes are ignored.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    AfterBoundary,
    Header,
    FieldBody,
    FileBody,
    Epilogue,
}

pub struct MultipartParser {
    scanner: BoundaryScanner,
    limits: UploadLimits,
    state: State,
    /// up to 2 bytes following a boundary, deciding CRLF vs `--`
    after_buf: Vec<u8>,
    header_buf: Vec<u8>,
    field_name: String,
    field_buf: Vec<u8>,
    /// body holdback so the CRLF preceding a boundary is never released
    hold: Vec<u8>,
    files_seen: usize,
    fields_seen: usize,
    bytes_received: u64,
    poisoned: bool,
}

impl MultipartParser {
    #[must_use]
    pub fn new(boundary: &str, limits: UploadLimits) -> Self {
        Self {
            scanner: BoundaryScanner::new(boundary.as_bytes()),
            limits,
            state: State::Preamble,
            after_buf: Vec::with_capacity(2),
            header_buf: Vec::new(),
            field_name: String::new(),
            field_buf: Vec::new(),
            hold: Vec::with_capacity(2),
            files_seen: 0,
            fields_seen: 0,
            bytes_received: 0,
            poisoned: false,
        }
    }

    /// Bytes delivered for the current file part so far.
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Feeds one body chunk, returning the events it produced.
    pub fn write(&mut self, chunk: &[u8]) -> Result<Vec<ParseEvent>, MultipartError> {
        let mut events = Vec::new();
        if self.poisoned || self.state == State::Epilogue {
            return Ok(events);
        }
        let out = self.scanner.scan(chunk);
        match self.consume(&mut events, out) {
            Ok(()) => Ok(events),
            Err(e) => Err(self.poison(e)),
        }
    }

    /// Signals end of input.
    pub fn finish(&mut self) -> Result<Vec<ParseEvent>, MultipartError> {
        if self.poisoned {
            return Ok(Vec::new());
        }
        let mut events = Vec::new();
        // the retained tail is shorter than the delimiter, so it cannot
        // contain a boundary and is plain data for the current state
        let leftover = self.scanner.flush();
        if let Err(e) = self.feed_data(&mut events, leftover) {
            return Err(self.poison(e));
        }
        if self.state == State::Epilogue {
            Ok(events)
        } else {
            Err(self.poison(MultipartError::UnexpectedEnd))
        }
    }

    fn consume(&mut self, events: &mut Vec<ParseEvent>, out: ScanOutcome) -> Result<(), MultipartError> {
        for part in out.parts {
            self.feed_data(events, part.data)?;
            self.feed_boundary(events)?;
        }
        self.feed_data(events, out.emit)
    }

    fn poison(&mut self, err: MultipartError) -> MultipartError {
        self.poisoned = true;
        if let MultipartError::LimitExceeded { kind, limit } = err {
            tracing::warn!(limit.kind = %kind, limit.value = limit, "multipart limit exceeded");
        }
        err
    }

    fn feed_data(&mut self, events: &mut Vec<ParseEvent>, data: Bytes) -> Result<(), MultipartError> {
        let mut data = data;
        while !data.is_empty() {
            match self.state {
                State::Preamble | State::Epilogue => return Ok(()),
                State::AfterBoundary => {
                    let byte = data[0];
                    data.advance(1);
                    self.after_buf.push(byte);
                    if self.after_buf.len() < 2 {
                        if byte != b'\r' && byte != b'-' {
                            return Err(MultipartError::MalformedHeader);
                        }
                        continue;
                    }
                    match self.after_buf.as_slice() {
                        b"\r\n" => {
                            self.state = State::Header;
                            self.header_buf.clear();
                        }
                        b"--" => {
                            self.state = State::Epilogue;
                            events.push(ParseEvent::Finished);
                            return Ok(());
                        }
                        _ => return Err(MultipartError::MalformedHeader),
                    }
                }
                State::Header => {
                    // rescan the seam in case CRLFCRLF straddles two feeds
                    let rescan_from = self.header_buf.len().saturating_sub(3);
                    self.header_buf.extend_from_slice(&data);
                    data.clear();
                    match memmem::find(&self.header_buf[rescan_from..], b"\r\n\r\n") {
                        Some(pos) => {
                            let end = rescan_from + pos;
                            if end + 4 > self.limits.header_size {
                                return Err(MultipartError::LimitExceeded {
                                    kind: LimitKind::HeaderSize,
                                    limit: self.limits.header_size as u64,
                                });
                            }
                            let rest = Bytes::copy_from_slice(&self.header_buf[end + 4..]);
                            self.header_buf.truncate(end + 4);
                            self.begin_part(events)?;
                            data = rest;
                        }
                        None => {
                            if self.header_buf.len() > self.limits.header_size {
                                return Err(MultipartError::LimitExceeded {
                                    kind: LimitKind::HeaderSize,
                                    limit: self.limits.header_size as u64,
                                });
                            }
                        }
                    }
                }
                State::FieldBody => {
                    let emit = self.drain_body(data.split_to(data.len()));
                    self.append_field(&emit)?;
                }
                State::FileBody => {
                    let emit = self.drain_body(data.split_to(data.len()));
                    if !emit.is_empty() {
                        self.push_file_data(events, emit)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn feed_boundary(&mut self, events: &mut Vec<ParseEvent>) -> Result<(), MultipartError> {
        match self.state {
            State::Preamble => {
                self.state = State::AfterBoundary;
                self.after_buf.clear();
                Ok(())
            }
            State::FieldBody => {
                if self.hold != b"\r\n" {
                    let tail = std::mem::take(&mut self.hold);
                    self.append_field(&tail)?;
                }
                self.hold.clear();
                let name = std::mem::take(&mut self.field_name);
                let value = String::from_utf8(std::mem::take(&mut self.field_buf))
                    .map_err(|_| MultipartError::MalformedHeader)?;
                events.push(ParseEvent::Field { name, value });
                self.state = State::AfterBoundary;
                self.after_buf.clear();
                Ok(())
            }
            State::FileBody => {
                if self.hold != b"\r\n" {
                    let tail = Bytes::from(std::mem::take(&mut self.hold));
                    if !tail.is_empty() {
                        self.push_file_data(events, tail)?;
                    }
                }
                self.hold.clear();
                events.push(ParseEvent::FileEnd);
                self.state = State::AfterBoundary;
                self.after_buf.clear();
                Ok(())
            }
            State::Epilogue => Ok(()),
            State::AfterBoundary | State::Header => Err(MultipartError::MalformedHeader),
        }
    }

    /// Releases body bytes except the last two, which stay held back until
    /// it is known whether a boundary follows them.
    fn drain_body(&mut self, data: Bytes) -> Bytes {
        if self.hold.is_empty() && data.len() > 2 {
            let mut data = data;
            let emit = data.split_to(data.len() - 2);
            self.hold.extend_from_slice(&data);
            return emit;
        }
        let mut combined = BytesMut::with_capacity(self.hold.len() + data.len());
        combined.extend_from_slice(&self.hold);
        combined.extend_from_slice(&data);
        self.hold.clear();
        if combined.len() <= 2 {
            self.hold.extend_from_slice(&combined);
            return Bytes::new();
        }
        let emit = combined.split_to(combined.len() - 2).freeze();
        self.hold.extend_from_slice(&combined);
        emit
    }

    fn append_field(&mut self, bytes: &[u8]) -> Result<(), MultipartError> {
        if self.field_buf.len() + bytes.len() > self.limits.field_size {
            return Err(MultipartError::LimitExceeded {
                kind: LimitKind::FieldSize,
                limit: self.limits.field_size as u64,
            });
        }
        self.field_buf.extend_from_slice(bytes);
        Ok(())
    }

    fn push_file_data(&mut self, events: &mut Vec<ParseEvent>, bytes: Bytes) -> Result<(), MultipartError> {
        if self.bytes_received + bytes.len() as u64 > self.limits.file_size {
            return Err(MultipartError::LimitExceeded {
                kind: LimitKind::FileSize,
                limit: self.limits.file_size,
            });
        }
        self.bytes_received += bytes.len() as u64;
        events.push(ParseEvent::FileData(bytes));
        Ok(())
    }

    /// Parses the accumulated header block and opens the next part.
    fn begin_part(&mut self, events: &mut Vec<ParseEvent>) -> Result<(), MultipartError> {
        let headers = parse_part_headers(&self.header_buf)?;
        self.header_buf.clear();
        self.hold.clear();

        if headers.disposition.name.len() > self.limits.field_name_size {
            return Err(MultipartError::LimitExceeded {
                kind: LimitKind::FieldNameSize,
                limit: self.limits.field_name_size as u64,
            });
        }

        match headers.disposition.filename {
            Some(filename) => {
                self.files_seen += 1;
                if self.files_seen > self.limits.files {
                    return Err(MultipartError::LimitExceeded {
                        kind: LimitKind::Files,
                        limit: self.limits.files as u64,
                    });
                }
                self.bytes_received = 0;
                self.state = State::FileBody;
                events.push(ParseEvent::FileBegin(FileInfo {
                    field_name: headers.disposition.name,
                    filename,
                    mime_type: headers.content_type,
                    encoding: headers.encoding,
                }));
            }
            None => {
                self.fields_seen += 1;
                if self.fields_seen > self.limits.fields {
                    return Err(MultipartError::LimitExceeded {
                        kind: LimitKind::Fields,
                        limit: self.limits.fields as u64,
                    });
                }
                self.field_name = headers.disposition.name;
                self.field_buf.clear();
                self.state = State::FieldBody;
            }
        }
        Ok(())
    }
}

struct PartHeaders {
    disposition: ContentDisposition,
    content_type: String,
    encoding: String,
}

struct ContentDisposition {
    name: String,
    filename: Option<String>,
}

/// Parses one part's header block (terminated by CRLFCRLF).
fn parse_part_headers(block: &[u8]) -> Result<PartHeaders, MultipartError> {
    let mut headers = [httparse::EMPTY_HEADER; 8];
    let parsed = match httparse::parse_headers(block, &mut headers) {
        Ok(httparse::Status::Complete((_, parsed))) => parsed,
        Ok(httparse::Status::Partial) | Err(_) => return Err(MultipartError::MalformedHeader),
    };

    let mut disposition = None;
    let mut content_type = None;
    let mut encoding = None;
    for header in parsed {
        if header.name.eq_ignore_ascii_case("Content-Disposition") {
            disposition = Some(parse_content_disposition(header.value)?);
        } else if header.name.eq_ignore_ascii_case("Content-Type") {
            let value = std::str::from_utf8(header.value).map_err(|_| MultipartError::MalformedHeader)?;
            content_type = Some(value.trim().to_owned());
        } else if header.name.eq_ignore_ascii_case("Content-Transfer-Encoding") {
            let value = std::str::from_utf8(header.value).map_err(|_| MultipartError::MalformedHeader)?;
            encoding = Some(value.trim().to_ascii_lowercase());
        }
    }

    Ok(PartHeaders {
        disposition: disposition.ok_or(MultipartError::MissingContentDisposition)?,
        content_type: content_type.unwrap_or_else(|| "application/octet-stream".to_owned()),
        encoding: encoding.unwrap_or_else(|| "7bit".to_owned()),
    })
}

/// Parses `form-data; name="…"[; filename="…"]`, unescaping `\"` and `\\`
/// in quoted values and accepting unquoted tokens.
fn parse_content_disposition(input: &[u8]) -> Result<ContentDisposition, MultipartError> {
    use nom::IResult;
    use nom::Parser;
    use nom::branch::alt;
    use nom::bytes::complete::{escaped_transform, is_not, tag, take_while1};
    use nom::character::complete::{char, multispace0};
    use nom::combinator::{all_consuming, map, value};
    use nom::multi::many0;
    use nom::sequence::{delimited, preceded, separated_pair};

    fn quoted(i: &str) -> IResult<&str, String> {
        delimited(
            char('"'),
            alt((
                escaped_transform(
                    is_not("\\\""),
                    '\\',
                    alt((value("\"", char('"')), value("\\", char('\\')))),
                ),
                map(tag(""), |_: &str| String::new()),
            )),
            char('"'),
        )
        .parse(i)
    }

    fn token(i: &str) -> IResult<&str, String> {
        map(take_while1(|c: char| c != ';' && c != '"'), |s: &str| s.trim().to_owned()).parse(i)
    }

    fn param(i: &str) -> IResult<&str, (String, String)> {
        separated_pair(
            map(
                take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '*'),
                str::to_owned,
            ),
            char('='),
            alt((quoted, token)),
        )
        .parse(i)
    }

    let text = std::str::from_utf8(input).map_err(|_| MultipartError::MalformedHeader)?;

    let mut parser = all_consuming(preceded(
        tag("form-data"),
        many0(preceded((char(';'), multispace0), param)),
    ));
    let (_, params) = parser.parse(text.trim()).map_err(|_| MultipartError::MalformedHeader)?;

    let mut name = None;
    let mut filename = None;
    for (key, val) in params {
        match key.as_str() {
            "name" => name = Some(val),
            "filename" => filename = Some(val),
            _ => {}
        }
    }

    Ok(ContentDisposition {
        name: name.ok_or(MultipartError::MalformedHeader)?,
        filename,
    })
}
