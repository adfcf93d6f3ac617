use std::io::Read;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use http::{HeaderMap, header::CONTENT_ENCODING};
use hyper::Body;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseBodyError {
    #[error("body exceeds limit of {0} bytes")]
    RequestSizeExceeded(usize),

    #[error("invalid content encoding: {0}")]
    InvalidContentEncoding(String),

    #[error("content-encoding header is not utf8: {0}")]
    NonUtf8ContentEncoding(#[from] http::header::ToStrError),

    #[error("error decompressing body as gzip: {0}")]
    InvalidGzip(std::io::Error),

    #[error("client hung up while sending body: {0}")]
    ClientHangup(#[from] hyper::Error),
}

/// Read the request body, gunzipping it when `Content-Encoding: gzip` is set
///
/// The limit applies to the body as received and again after decompression.
pub(crate) async fn parse_body(
    headers: &HeaderMap,
    mut payload: Body,
    max_size: usize,
) -> Result<Bytes, ParseBodyError> {
    let ungzip = match headers
        .get(CONTENT_ENCODING)
        .map(|v| v.to_str())
        .transpose()?
    {
        None | Some("identity") => false,
        Some("gzip") => true,
        Some(other) => return Err(ParseBodyError::InvalidContentEncoding(other.to_string())),
    };

    let mut body = BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk?;
        if body.len() + chunk.len() > max_size {
            return Err(ParseBodyError::RequestSizeExceeded(max_size));
        }
        body.extend_from_slice(&chunk);
    }
    let body = body.freeze();

    if !ungzip {
        return Ok(body);
    }

    // one byte past the limit tells a complete stream from a truncated one
    let mut decoder =
        flate2::read::MultiGzDecoder::new(&body[..]).take((max_size as u64).saturating_add(1));
    let mut decoded = Vec::new();
    decoder
        .read_to_end(&mut decoded)
        .map_err(ParseBodyError::InvalidGzip)?;
    if decoded.len() > max_size {
        return Err(ParseBodyError::RequestSizeExceeded(max_size));
    }
    Ok(decoded.into())
}
