//! Newline-delimited record decoder over a streaming HTTP body

use super::error::{Result, RuntimeError};
use bytes::{Bytes, BytesMut};
use http_body_util::BodyExt;
use hyper::body::Body;
use serde::de::DeserializeOwned;

/// Splits a response body into newline-delimited records.
///
/// Records may arrive split across any number of transport chunks. Blank
/// lines are skipped and a final record without a trailing newline is
/// yielded once the body ends.
pub struct FrameDecoder<B> {
    body: B,
    buffer: BytesMut,
    finished: bool,
}

impl<B> FrameDecoder<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<RuntimeError>,
{
    pub fn new(body: B) -> Self {
        Self {
            body,
            buffer: BytesMut::new(),
            finished: false,
        }
    }

    /// Next non-blank record, `None` at end of body
    pub async fn next_line(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line = self.buffer.split_to(pos + 1).freeze();
                match trim_record(line) {
                    Some(record) => return Ok(Some(record)),
                    None => continue,
                }
            }

            if self.finished {
                let rest = self.buffer.split().freeze();
                return Ok(trim_record(rest));
            }

            match self.body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.buffer.extend_from_slice(&data);
                    }
                }
                Some(Err(err)) => return Err(err.into()),
                None => self.finished = true,
            }
        }
    }

    /// Next record decoded as `T`, `None` at end of body
    pub async fn next_record<T: DeserializeOwned>(
        &mut self,
        what: &'static str,
    ) -> Result<Option<T>> {
        match self.next_line().await? {
            Some(line) => serde_json::from_slice(&line)
                .map(Some)
                .map_err(|source| RuntimeError::Decode { what, source }),
            None => Ok(None),
        }
    }
}

/// Strips the line terminator and surrounding whitespace; `None` if nothing remains
fn trim_record(line: Bytes) -> Option<Bytes> {
    let start = line.iter().position(|b| !b.is_ascii_whitespace())?;
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace())?;
    Some(line.slice(start..=end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use http_body_util::StreamBody;
    use hyper::body::Frame;
    use serde::Deserialize;

    type TestBody = StreamBody<
        stream::Iter<std::vec::IntoIter<std::result::Result<Frame<Bytes>, RuntimeError>>>,
    >;

    fn body_of(chunks: &[&str]) -> TestBody {
        let frames: Vec<std::result::Result<Frame<Bytes>, RuntimeError>> = chunks
            .iter()
            .map(|chunk| Ok(Frame::data(Bytes::copy_from_slice(chunk.as_bytes()))))
            .collect();
        StreamBody::new(stream::iter(frames))
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Record {
        n: u32,
    }

    #[tokio::test]
    async fn test_records_split_across_chunks() {
        let mut decoder = FrameDecoder::new(body_of(&["{\"n\":", "1}\n{\"n\"", ":2}\n"]));

        assert_eq!(
            decoder.next_record::<Record>("record").await.unwrap(),
            Some(Record { n: 1 })
        );
        assert_eq!(
            decoder.next_record::<Record>("record").await.unwrap(),
            Some(Record { n: 2 })
        );
        assert!(decoder.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blank_lines_skipped() {
        let mut decoder = FrameDecoder::new(body_of(&["\n\r\n{\"n\":3}\r\n", "\n"]));

        assert_eq!(
            decoder.next_record::<Record>("record").await.unwrap(),
            Some(Record { n: 3 })
        );
        assert!(decoder.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_trailing_record_without_newline() {
        let mut decoder = FrameDecoder::new(body_of(&["{\"n\":4}\n{\"n\":5}"]));

        assert_eq!(decoder.next_line().await.unwrap().unwrap(), "{\"n\":4}");
        assert_eq!(decoder.next_line().await.unwrap().unwrap(), "{\"n\":5}");
        assert!(decoder.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_record_is_decode_error() {
        let mut decoder = FrameDecoder::new(body_of(&["not json\n{\"n\":6}\n"]));

        let err = decoder.next_record::<Record>("record").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Decode { what: "record", .. }));

        // The stream stays usable after a bad record
        assert_eq!(
            decoder.next_record::<Record>("record").await.unwrap(),
            Some(Record { n: 6 })
        );
    }

    #[tokio::test]
    async fn test_body_error_is_surfaced() {
        let frames: Vec<std::result::Result<Frame<Bytes>, RuntimeError>> = vec![
            Ok(Frame::data(Bytes::from_static(b"{\"n\":"))),
            Err(RuntimeError::StreamClosed),
        ];
        let mut decoder = FrameDecoder::new(StreamBody::new(stream::iter(frames)));

        let err = decoder.next_line().await.unwrap_err();
        assert!(matches!(err, RuntimeError::StreamClosed));
    }
}
