//! HTTP response adapter for stream sessions.
//!
//! Serves a started stream as an axum response: attributes become headers
//! and the body is pulled from the stream reader chunk by chunk, so the
//! consumer's pace is what drives the reassembly worker.

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::{Stream, stream};
use tokio::io::AsyncReadExt;
use tracing::warn;

use super::session::{StreamBody, StreamResponse};

/// Size of chunks pulled from the stream body per HTTP frame.
const CHUNK_SIZE: usize = 64 * 1024; // 64KB

/// Turns a stream body into a chunk stream that ends after the first error.
fn body_stream(body: StreamBody) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    stream::unfold(Some(body), |state| async move {
        let mut body = state?;
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
        match body.read_buf(&mut buf).await {
            Ok(0) => None,
            Ok(_) => Some((Ok(buf.freeze()), Some(body))),
            Err(error) => Some((Err(error), None)),
        }
    })
}

impl StreamResponse {
    /// Converts the stream into an HTTP response.
    ///
    /// Attributes that are not valid header names or values are skipped.
    pub fn into_http_response(self) -> Response {
        let mut builder = Response::builder().status(StatusCode::OK);

        for (key, value) in &self.attributes {
            match (
                HeaderName::try_from(key.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => builder = builder.header(name, value),
                _ => warn!("Skipping attribute {} that is not a valid header", key),
            }
        }

        builder
            .body(Body::from_stream(body_stream(self.body)))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

impl IntoResponse for StreamResponse {
    fn into_response(self) -> Response {
        self.into_http_response()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Cursor;

    use axum::http::header;
    use futures::StreamExt;

    use super::*;
    use crate::streaming::pipe::pipe;
    use crate::streaming::{HEADER_TASK_ID, StreamError};

    #[tokio::test]
    async fn test_attributes_become_headers() {
        let response = StreamResponse {
            body: Box::new(Cursor::new(Bytes::from_static(b"payload"))),
            attributes: HashMap::from([
                (HEADER_TASK_ID.to_string(), "task-1".to_string()),
                (header::CONTENT_LENGTH.to_string(), "7".to_string()),
                ("bad header".to_string(), "ignored".to_string()),
            ]),
        }
        .into_http_response();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[HEADER_TASK_ID], "task-1");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "7");

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"payload");
    }

    #[tokio::test]
    async fn test_body_stream_ends_after_error() {
        let (mut writer, reader) = pipe(4);
        writer.write(Bytes::from_static(b"abc")).await.unwrap();
        writer.close_with_error(StreamError::Cancelled);

        let items: Vec<_> = body_stream(Box::new(reader)).collect().await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), &Bytes::from_static(b"abc"));
        assert!(items[1].is_err());
    }
}
