//! HTTP client for the discoverd event stream.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::ACCEPT;

use super::{Discovery, ServiceEvent, ServiceStream};
use crate::error::RouterError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Discovery over `GET {base}/services/{name}` as server-sent events.
#[derive(Debug, Clone)]
pub struct DiscoverdClient {
    base_url: String,
    http: reqwest::Client,
}

impl DiscoverdClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RouterError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| RouterError::Discovery(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl Discovery for DiscoverdClient {
    async fn watch(&self, service: &str) -> Result<ServiceStream, RouterError> {
        let url = format!("{}/services/{}", self.base_url, service);
        let response = self
            .http
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| RouterError::Discovery(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RouterError::Discovery(format!(
                "{url}: unexpected status {status}"
            )));
        }

        Ok(event_stream(response.bytes_stream().boxed()))
    }
}

struct StreamState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    done: bool,
}

fn event_stream(body: BoxStream<'static, reqwest::Result<Bytes>>) -> ServiceStream {
    let state = StreamState {
        body,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        done: false,
    };
    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(data) = state.pending.pop_front() {
                let event = serde_json::from_str::<ServiceEvent>(&data)
                    .map_err(|e| RouterError::Discovery(format!("invalid event: {e}")));
                return Some((event, state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => state.decoder.feed(&chunk, &mut state.pending),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(RouterError::Discovery(e.to_string())), state));
                }
                None => return None,
            }
        }
    })
    .boxed()
}

/// Incremental `text/event-stream` decoder yielding `data` payloads.
#[derive(Debug, Default)]
struct SseDecoder {
    line: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    fn feed(&mut self, chunk: &[u8], out: &mut VecDeque<String>) {
        for &byte in chunk {
            if byte == b'\n' {
                let mut line = std::mem::take(&mut self.line);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.end_line(&line, out);
            } else {
                self.line.push(byte);
            }
        }
    }

    fn end_line(&mut self, line: &[u8], out: &mut VecDeque<String>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                out.push_back(self.data.join("\n"));
                self.data.clear();
            }
            return;
        }
        let line = String::from_utf8_lossy(line);
        if let Some(value) = line.strip_prefix("data:") {
            self.data
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
    }
}
