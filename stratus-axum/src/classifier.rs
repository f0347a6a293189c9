//! Multipart classification over an axum request body.
//!
//! Fields arrive from `multer` strictly in body order, so a file's bytes
//! must be consumed before the next part can be read. Each file's chunks
//! are forwarded through a bounded channel: the file pipeline reads at its
//! own pace and parsing only stalls when that channel is full.

use std::io;

use axum::body::Body;
use axum::http::{header, HeaderMap};
use bytes::Bytes;
use stratus_upload::{ByteStream, FilePart, FormEvent, FormEventStream, UploadError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// True when the request carries a `multipart/form-data` body
pub fn is_multipart(headers: &HeaderMap) -> bool {
    content_type(headers)
        .map(|ct| ct.trim_start().to_ascii_lowercase().starts_with("multipart/form-data"))
        .unwrap_or(false)
}

/// Boundary of a multipart content type
pub fn boundary(headers: &HeaderMap) -> Option<String> {
    content_type(headers).and_then(|ct| multer::parse_boundary(ct).ok())
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok())
}

/// Turn a multipart body into a lazy stream of form events.
///
/// Framing errors between parts end the stream with a `ClassifierFraming`
/// item. An error inside a file's body is delivered on that file's byte
/// stream instead, and the event stream simply ends there.
pub fn classify(body: Body, boundary: String, chunk_capacity: usize) -> FormEventStream {
    let mut multipart = multer::Multipart::new(body.into_data_stream(), boundary);
    let capacity = chunk_capacity.max(1);

    Box::pin(async_stream::stream! {
        loop {
            let mut field = match multipart.next_field().await {
                Ok(Some(field)) => field,
                Ok(None) => break,
                Err(e) => {
                    yield Err(UploadError::framing(e.to_string()));
                    break;
                }
            };

            let name = field.name().unwrap_or_default().to_string();
            let Some(filename) = field.file_name().map(str::to_string) else {
                match field.text().await {
                    Ok(value) => yield Ok(FormEvent::Field { name, value }),
                    Err(e) => {
                        yield Err(UploadError::framing(e.to_string()));
                        break;
                    }
                }
                continue;
            };

            let mime_type = field
                .content_type()
                .map(|m| m.to_string())
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let encoding = field
                .headers()
                .get("content-transfer-encoding")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("7bit")
                .to_string();

            let (tx, rx) = mpsc::channel(capacity);
            debug!(field = %name, filename = %filename, "file part classified");
            yield Ok(FormEvent::File(
                FilePart::new(name.clone(), filename, receiver_stream(rx))
                    .with_mime_type(mime_type)
                    .with_encoding(encoding),
            ));

            let mut receiver_open = true;
            loop {
                match field.chunk().await {
                    Ok(Some(chunk)) => {
                        // A pipeline that stopped reading still lets the body drain
                        if receiver_open && tx.send(Ok(chunk)).await.is_err() {
                            receiver_open = false;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(field = %name, error = %e, "file part failed mid-stream");
                        let _ = tx.send(Err(io::Error::new(io::ErrorKind::UnexpectedEof, e.to_string()))).await;
                        // The body cannot be read past this point; parts already
                        // observed still complete.
                        return;
                    }
                }
            }
        }
    })
}

fn receiver_stream(mut rx: mpsc::Receiver<Result<Bytes, io::Error>>) -> ByteStream {
    Box::pin(async_stream::stream! {
        while let Some(item) = rx.recv().await {
            yield item;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use futures::StreamExt;

    const BODY: &str = "--XB\r\n\
        Content-Disposition: form-data; name=\"title\"\r\n\r\n\
        hello\r\n\
        --XB\r\n\
        Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\
        Content-Type: text/plain\r\n\
        Content-Transfer-Encoding: binary\r\n\r\n\
        file body\r\n\
        --XB--\r\n";

    fn headers(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn multipart_detection_reads_content_type() {
        assert!(is_multipart(&headers("multipart/form-data; boundary=XB")));
        assert!(!is_multipart(&headers("application/json")));
        assert!(!is_multipart(&HeaderMap::new()));
        assert_eq!(boundary(&headers("multipart/form-data; boundary=XB")).as_deref(), Some("XB"));
    }

    #[tokio::test]
    async fn events_follow_body_order() {
        let mut events = classify(Body::from(BODY), "XB".to_string(), 4);

        match events.next().await {
            Some(Ok(FormEvent::Field { name, value })) => {
                assert_eq!(name, "title");
                assert_eq!(value, "hello");
            }
            other => panic!("expected field, got {:?}", other),
        }

        let part = match events.next().await {
            Some(Ok(FormEvent::File(part))) => part,
            other => panic!("expected file, got {:?}", other),
        };
        assert_eq!(part.field_name, "doc");
        assert_eq!(part.filename, "a.txt");
        assert_eq!(part.mime_type, "text/plain");
        assert_eq!(part.encoding, "binary");

        // Drive the classifier and the file stream together
        let reader = tokio::spawn(async move {
            let chunks: Vec<_> = part.stream.collect().await;
            chunks.into_iter().map(|c| c.unwrap()).fold(Vec::new(), |mut acc, c| {
                acc.extend_from_slice(&c);
                acc
            })
        });
        assert!(events.next().await.is_none());
        assert_eq!(reader.await.unwrap(), b"file body");
    }

    #[tokio::test]
    async fn truncated_files_fail_only_their_stream() {
        let truncated = "--XB\r\n\
            Content-Disposition: form-data; name=\"doc\"; filename=\"a.txt\"\r\n\r\n\
            partial data";
        let mut events = classify(Body::from(truncated), "XB".to_string(), 4);

        let part = match events.next().await {
            Some(Ok(FormEvent::File(part))) => part,
            other => panic!("expected file, got {:?}", other),
        };
        let reader = tokio::spawn(async move { part.stream.collect::<Vec<_>>().await });

        assert!(events.next().await.is_none());
        let chunks = reader.await.unwrap();
        assert!(matches!(chunks.last(), Some(Err(_))));
    }

    #[tokio::test]
    async fn truncated_bodies_are_framing_errors() {
        let truncated = "--XB\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nhel";
        let mut events = classify(Body::from(truncated), "XB".to_string(), 4);
        assert!(matches!(events.next().await, Some(Err(UploadError::ClassifierFraming { .. }))));
        assert!(events.next().await.is_none());
    }
}
