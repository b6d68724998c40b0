//! Async adaptation of the push parser
//!
//! [`parse_stream`] spawns a driver task that feeds the request body
//! through [`MultipartParser`](super::MultipartParser) and emits tagged
//! parts over a bounded channel. A file part carries its own bounded byte
//! channel, so a slow pipeline backpressures the driver and, through it,
//! the request body.

use crate::UploadError;
use crate::UploadResult;
use crate::config::UploadLimits;
use crate::error::StdError;
use crate::multipart::parser::{FileInfo, MultipartParser, ParseEvent};
use crate::stream::ChannelByteStream;
use crate::upload_error;

use std::ops::ControlFlow;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::pin_mut;
use futures::stream::{Stream, StreamExt};
use mime::Mime;
use tokio::sync::mpsc;

const PART_CHANNEL_CAPACITY: usize = 8;
const FILE_CHANNEL_CAPACITY: usize = 8;

/// Byte stream of one file part's body.
pub type FilePartStream = ChannelByteStream;

/// A decoded form entry, in request byte order.
#[derive(Debug)]
pub enum Part {
    Field { name: String, value: String },
    File { info: FileInfo, stream: FilePartStream },
}

/// Stream of [`Part`]s produced by [`parse_stream`].
///
/// Dropping it cancels the driver task at its next send.
pub struct PartStream {
    rx: mpsc::Receiver<Result<Part, UploadError>>,
}

impl Stream for PartStream {
    type Item = Result<Part, UploadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Extracts and validates the boundary token from a `Content-Type` value.
///
/// # Errors
/// `INVALID_CONTENT_TYPE` unless the value is `multipart/form-data`;
/// `MISSING_BOUNDARY` when the boundary parameter is absent or not a valid
/// RFC 2046 token.
pub fn extract_boundary(content_type: &str) -> UploadResult<String> {
    let mime: Mime = content_type
        .parse()
        .map_err(|e| upload_error!(e, InvalidContentType, "invalid content-type: {:?}", content_type))?;
    if mime.type_() != mime::MULTIPART || mime.subtype() != mime::FORM_DATA {
        return Err(upload_error!(
            InvalidContentType,
            "expected multipart/form-data, got {}/{}",
            mime.type_(),
            mime.subtype()
        ));
    }
    let boundary = mime
        .get_param(mime::BOUNDARY)
        .ok_or_else(|| upload_error!(MissingBoundary, "content-type has no boundary parameter"))?;
    let token = boundary.as_str();
    if !is_valid_boundary(token) {
        return Err(upload_error!(MissingBoundary, "invalid boundary token: {:?}", token));
    }
    Ok(token.to_owned())
}

/// RFC 2046: 1 to 70 bchars, where the last may not be a space.
fn is_valid_boundary(token: &str) -> bool {
    if token.is_empty() || token.len() > 70 || token.ends_with(' ') {
        return false;
    }
    token.bytes().all(|b| {
        b.is_ascii_alphanumeric() || matches!(b, b'\'' | b'(' | b')' | b'+' | b'_' | b',' | b'-' | b'.' | b'/' | b':' | b'=' | b'?' | b' ')
    })
}

/// Parses a request body into a stream of parts.
///
/// Must be called within a tokio runtime: the driver runs as a spawned
/// task so file pipelines can consume concurrently with parsing.
pub fn parse_stream<S>(body: S, boundary: &str, limits: UploadLimits) -> PartStream
where
    S: Stream<Item = Result<Bytes, StdError>> + Send + 'static,
{
    let parser = MultipartParser::new(boundary, limits);
    let (part_tx, part_rx) = mpsc::channel(PART_CHANNEL_CAPACITY);
    tokio::spawn(drive(body, parser, part_tx));
    PartStream { rx: part_rx }
}

struct Driver {
    parser: MultipartParser,
    part_tx: mpsc::Sender<Result<Part, UploadError>>,
    file_tx: Option<mpsc::Sender<Result<Bytes, UploadError>>>,
    /// set when the file's consumer went away; remaining bytes of the
    /// current part are discarded but parsing continues
    discard_file: bool,
}

async fn drive<S>(body: S, parser: MultipartParser, part_tx: mpsc::Sender<Result<Part, UploadError>>)
where
    S: Stream<Item = Result<Bytes, StdError>> + Send + 'static,
{
    pin_mut!(body);
    let mut driver = Driver {
        parser,
        part_tx,
        file_tx: None,
        discard_file: false,
    };

    loop {
        match body.next().await {
            None => {
                match driver.parser.finish() {
                    Ok(events) => {
                        let _ = driver.dispatch(events).await;
                    }
                    Err(e) => driver.fail(e.into()).await,
                }
                break;
            }
            Some(Err(e)) => {
                let mut err = upload_error!(UnexpectedEnd, "request body failed");
                err.set_source(e);
                driver.fail(err).await;
                break;
            }
            Some(Ok(chunk)) => match driver.parser.write(&chunk) {
                Ok(events) => {
                    if driver.dispatch(events).await.is_break() {
                        break;
                    }
                }
                Err(e) => {
                    driver.fail(e.into()).await;
                    break;
                }
            },
        }
    }
}

impl Driver {
    async fn dispatch(&mut self, events: Vec<ParseEvent>) -> ControlFlow<()> {
        for event in events {
            match event {
                ParseEvent::Field { name, value } => {
                    if self.part_tx.send(Ok(Part::Field { name, value })).await.is_err() {
                        return ControlFlow::Break(());
                    }
                }
                ParseEvent::FileBegin(info) => {
                    let (tx, rx) = mpsc::channel(FILE_CHANNEL_CAPACITY);
                    self.discard_file = false;
                    let part = Part::File {
                        info,
                        stream: ChannelByteStream::new(rx),
                    };
                    if self.part_tx.send(Ok(part)).await.is_err() {
                        return ControlFlow::Break(());
                    }
                    self.file_tx = Some(tx);
                }
                ParseEvent::FileData(bytes) => {
                    if self.discard_file {
                        continue;
                    }
                    if let Some(ref tx) = self.file_tx
                        && tx.send(Ok(bytes)).await.is_err()
                    {
                        self.discard_file = true;
                    }
                }
                ParseEvent::FileEnd => {
                    self.file_tx = None;
                    self.discard_file = false;
                }
                ParseEvent::Finished => return ControlFlow::Break(()),
            }
        }
        ControlFlow::Continue(())
    }

    /// Delivers a fatal error to the open file stream and the part stream.
    async fn fail(&mut self, err: UploadError) {
        if let Some(tx) = self.file_tx.take() {
            let _ = tx.send(Err(err.replicate())).await;
        }
        let _ = self.part_tx.send(Err(err)).await;
    }
}
