use std::collections::VecDeque;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cdp::{self, CdpMessage};
use crate::error::Result;
use crate::types::LifecycleEvent;

/// Anything that yields lifecycle events in arrival order
#[async_trait]
pub trait EventSource: Send {
    /// Next event, or `None` once the source is exhausted.
    async fn next_event(&mut self) -> Option<LifecycleEvent>;
}

/// Replays a recorded JSON Lines capture. Each line is either a native
/// lifecycle event or a raw CDP `{method, params}` message.
pub struct ReplaySource<R> {
    lines: Lines<R>,
    pending: VecDeque<LifecycleEvent>,
    /// Latest event time seen; stands in for CDP events without a wall time.
    clock: Option<DateTime<Utc>>,
    line_no: usize,
    skipped: usize,
}

impl ReplaySource<BufReader<File>> {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref()).await?;
        Ok(Self::from_reader(BufReader::new(file)))
    }
}

impl<R: AsyncBufRead + Unpin + Send> ReplaySource<R> {
    pub fn from_reader(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            pending: VecDeque::new(),
            clock: None,
            line_no: 0,
            skipped: 0,
        }
    }

    /// Lines that could not be turned into events.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn parse_line(&mut self, line: &str) -> Result<Vec<LifecycleEvent>> {
        let value: Value = serde_json::from_str(line)?;
        let is_cdp = value.get("method").map_or(false, Value::is_string)
            && value.get("exchangeId").is_none();

        let events = if is_cdp {
            let message: CdpMessage = serde_json::from_value(value)?;
            let received_at = self.clock.unwrap_or_else(Utc::now);
            cdp::translate_message(&message, received_at)
        } else {
            vec![serde_json::from_value::<LifecycleEvent>(value)?]
        };

        for event in &events {
            if self.clock.map_or(true, |clock| event.timestamp > clock) {
                self.clock = Some(event.timestamp);
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> EventSource for ReplaySource<R> {
    async fn next_event(&mut self) -> Option<LifecycleEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    warn!("replay read failed at line {}: {}", self.line_no + 1, e);
                    return None;
                }
            };
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match self.parse_line(trimmed) {
                Ok(events) if events.is_empty() => {
                    debug!(line = self.line_no, "no lifecycle event on line");
                }
                Ok(events) => self.pending.extend(events),
                Err(e) => {
                    self.skipped += 1;
                    warn!(line = self.line_no, "skipping malformed replay line: {}", e);
                }
            }
        }
    }
}

/// Events pushed by a live collector over a channel
pub struct ChannelSource {
    rx: mpsc::Receiver<LifecycleEvent>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<LifecycleEvent>) -> Self {
        Self { rx }
    }

    pub fn channel(buffer: usize) -> (mpsc::Sender<LifecycleEvent>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self::new(rx))
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn next_event(&mut self) -> Option<LifecycleEvent> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventFields, Phase};

    #[tokio::test]
    async fn test_replay_mixes_native_and_cdp_lines() {
        let capture = r#"
{"method":"Network.requestWillBeSent","params":{"requestId":"1","wallTime":1700000000.0,"request":{"url":"https://x.com/a","method":"GET","headers":{}}}}
not json at all
{"method":"Page.frameNavigated","params":{}}
{"method":"Network.responseReceivedExtraInfo","params":{"requestId":"1","statusCode":200,"headers":{}}}
{"exchangeId":"2","phase":"request-start","timestamp":"2023-11-14T22:13:25Z","fields":{"method":"GET","url":"https://x.com/b"}}
"#;
        let mut source = ReplaySource::from_reader(capture.as_bytes());
        let mut phases = Vec::new();
        while let Some(event) = source.next_event().await {
            phases.push((event.exchange_id.0.clone(), event.phase, event.timestamp.timestamp()));
        }
        assert_eq!(
            phases,
            vec![
                ("1".to_string(), Phase::RequestStart, 1_700_000_000),
                ("1".to_string(), Phase::ResponseHeadersExtra, 1_700_000_000),
                ("2".to_string(), Phase::RequestStart, 1_700_000_005),
            ]
        );
        assert_eq!(source.skipped(), 1);
    }

    #[tokio::test]
    async fn test_channel_source_ends_when_senders_drop() {
        let (tx, mut source) = ChannelSource::channel(4);
        tx.send(LifecycleEvent::new(
            "1",
            Phase::RequestStart,
            Utc::now(),
            EventFields::default(),
        ))
        .await
        .unwrap();
        drop(tx);
        assert!(source.next_event().await.is_some());
        assert!(source.next_event().await.is_none());
    }
}
