//! Server-Sent Events decoding for upstream HTTP streams.

use axum::body::Bytes;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures::{Stream, StreamExt, stream::BoxStream};

use super::{AdapterError, AdapterResult};

/// One dispatched SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// `None` for the default `message` event.
    pub event: Option<String>,
    pub data: String,
}

impl From<Event> for SseFrame {
    fn from(event: Event) -> Self {
        let name = (!event.event.is_empty() && event.event != "message").then_some(event.event);
        Self {
            event: name,
            data: event.data,
        }
    }
}

impl SseFrame {
    /// OpenAI-compatible APIs close the stream with a literal `[DONE]` payload.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }

    /// Decodes the data payload as JSON.
    ///
    /// # Errors
    /// Returns [`AdapterError::Decode`] when the payload is not valid JSON for `T`.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> AdapterResult<T> {
        serde_json::from_str(&self.data).map_err(|err| AdapterError::Decode(err.to_string()))
    }
}

/// Splits a streamed response body into SSE frames.
pub fn frames(response: reqwest::Response) -> BoxStream<'static, AdapterResult<SseFrame>> {
    decode(response.bytes_stream()).boxed()
}

/// Decodes SSE frames from a raw byte stream.
pub fn decode<S>(body: S) -> impl Stream<Item = AdapterResult<SseFrame>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    body.eventsource()
        .map(|item| item.map(SseFrame::from).map_err(stream_error))
}

fn stream_error(err: EventStreamError<reqwest::Error>) -> AdapterError {
    match err {
        EventStreamError::Transport(err) => AdapterError::Http(err),
        other => AdapterError::Decode(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn collect(chunks: &[&'static str]) -> Vec<SseFrame> {
        let body = futures::stream::iter(
            chunks
                .iter()
                .map(|chunk| Ok::<_, reqwest::Error>(Bytes::from_static(chunk.as_bytes())))
                .collect::<Vec<_>>(),
        );
        decode(body).try_collect().await.unwrap()
    }

    #[tokio::test]
    async fn frames_split_on_blank_lines_across_chunk_boundaries() {
        let frames = collect(&[
            "event: message_start\nda",
            "ta: {\"a\":1}\n\n: keep-alive\n\ndata: two\r\n\r\n",
        ])
        .await;

        assert_eq!(
            frames,
            vec![
                SseFrame {
                    event: Some("message_start".into()),
                    data: "{\"a\":1}".into(),
                },
                SseFrame {
                    event: None,
                    data: "two".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn multi_line_data_is_joined() {
        let frames = collect(&["data: first\ndata: second\n\ndata: [DONE]\n\n"]).await;
        assert_eq!(frames[0].data, "first\nsecond");
        assert!(frames[1].is_done());
    }
}
