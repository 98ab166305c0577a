// Chunked streaming of record lines
use crate::application::record_store::BATCH_SIZE;
use crate::domain::timeseries::TimeseriesData;
use crate::infrastructure::http_response::TEXT_CONTENT_TYPE;
use crate::infrastructure::text_format::format_record;
use axum::body::Body;
use axum::http::{header, Response, StatusCode};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::FixedOffset;
use futures::stream::Stream;
use futures::StreamExt;

/// Splits a series into chunks of formatted lines, `BATCH_SIZE` records each.
pub fn record_chunks(data: TimeseriesData, tz: FixedOffset, precision: i32) -> impl Stream<Item = Bytes> {
    async_stream::stream! {
        let mut chunk = BytesMut::new();
        let mut lines = 0;
        for record in data.records() {
            chunk.put_slice(format_record(&record, tz, precision).as_bytes());
            chunk.put_slice(b"\r\n");
            lines += 1;
            if lines == BATCH_SIZE {
                yield chunk.split().freeze();
                lines = 0;
            }
        }
        if !chunk.is_empty() {
            yield chunk.freeze();
        }
    }
}

/// Streams the chunks as a chunked response. Chunks go out uncompressed so
/// clients can consume lines as they arrive.
pub fn chunked_text_stream<S>(stream: S) -> Result<Response<Body>, StatusCode>
where
    S: Stream<Item = Bytes> + Send + 'static,
{
    let body = Body::from_stream(stream.map(Ok::<_, std::io::Error>));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)
        .header(header::TRANSFER_ENCODING, "chunked")
        .body(body)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    #[tokio::test]
    async fn test_chunks_split_on_batch_size() {
        let start = Utc.with_ymd_and_hms(2019, 5, 21, 0, 0, 0).unwrap();
        let mut data = TimeseriesData::new();
        for i in 0..(BATCH_SIZE as i64 + 1) {
            data.push(start + Duration::minutes(10 * i), Some(1.0), "");
        }
        let utc = FixedOffset::east_opt(0).unwrap();
        let chunks: Vec<Bytes> = record_chunks(data, utc, 1).collect().await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(&chunks[1][..], b"2019-05-27 22:40,1.0,\r\n");
        assert!(chunks[0].starts_with(b"2019-05-21 00:00,1.0,\r\n"));
    }
}
