//! Scripted in-memory link for exercising modem and sensor flows in tests

use crate::transport::traits::SerialLink;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};

/// Replies queued when a write containing `trigger` is seen
struct Rule {
    trigger: String,
    replies: Vec<(Duration, Bytes)>,
}

/// Bytes scheduled to become readable at `at`
struct Pending {
    at: Instant,
    data: Bytes,
}

/// Everything written to the link, shared with the test body
#[derive(Clone, Default)]
pub struct Transcript {
    writes: Arc<Mutex<Vec<Bytes>>>,
}

impl Transcript {
    /// Every write, decoded lossily
    pub fn writes(&self) -> Vec<String> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    /// Raw bytes of every write
    pub fn raw(&self) -> Vec<Bytes> {
        self.writes.lock().unwrap().clone()
    }

    /// Writes that look like AT commands, without the CRLF
    pub fn commands(&self) -> Vec<String> {
        self.writes()
            .into_iter()
            .filter(|w| w.starts_with("AT"))
            .map(|w| w.trim_end().to_string())
            .collect()
    }
}

/// A link that answers writes from a script
pub struct MockLink {
    name: String,
    rules: Vec<Rule>,
    incoming: VecDeque<Pending>,
    transcript: Transcript,
    /// Report end-of-stream once all scheduled input has been read
    eof_when_empty: bool,
}

impl MockLink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rules: Vec::new(),
            incoming: VecDeque::new(),
            transcript: Transcript::default(),
            eof_when_empty: false,
        }
    }

    /// Answer the next write containing `trigger` with `reply` right away
    pub fn reply(self, trigger: &str, reply: &str) -> Self {
        self.reply_after(trigger, &[(Duration::ZERO, reply)])
    }

    /// Answer the next write containing `trigger` with delayed chunks
    pub fn reply_after(mut self, trigger: &str, replies: &[(Duration, &str)]) -> Self {
        self.rules.push(Rule {
            trigger: trigger.to_string(),
            replies: replies
                .iter()
                .map(|(d, s)| (*d, Bytes::copy_from_slice(s.as_bytes())))
                .collect(),
        });
        self
    }

    /// Make `data` readable `delay` after the link is created
    pub fn feed(mut self, delay: Duration, data: &[u8]) -> Self {
        self.incoming.push_back(Pending {
            at: Instant::now() + delay,
            data: Bytes::copy_from_slice(data),
        });
        self
    }

    /// Fail reads with `UnexpectedEof` once the fed input is consumed
    pub fn eof_when_empty(mut self) -> Self {
        self.eof_when_empty = true;
        self
    }

    pub fn transcript(&self) -> Transcript {
        self.transcript.clone()
    }

    fn schedule(&mut self, written: &[u8]) {
        let text = String::from_utf8_lossy(written);
        let Some(idx) = self.rules.iter().position(|r| text.contains(&r.trigger)) else {
            return;
        };
        let rule = self.rules.remove(idx);
        let now = Instant::now();
        for (delay, data) in rule.replies {
            self.incoming.push_back(Pending {
                at: now + delay,
                data,
            });
        }
        self.incoming.make_contiguous().sort_by_key(|p| p.at);
    }

    fn take_ready(&mut self) -> Bytes {
        let now = Instant::now();
        let mut out = BytesMut::new();
        while self.incoming.front().is_some_and(|p| p.at <= now) {
            if let Some(p) = self.incoming.pop_front() {
                out.extend_from_slice(&p.data);
            }
        }
        out.freeze()
    }
}

#[async_trait]
impl SerialLink for MockLink {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.transcript
            .writes
            .lock()
            .unwrap()
            .push(Bytes::copy_from_slice(data));
        self.schedule(data);
        Ok(())
    }

    async fn read_chunk(&mut self, wait: Duration) -> io::Result<Bytes> {
        let ready = self.take_ready();
        if !ready.is_empty() {
            return Ok(ready);
        }
        if self.incoming.is_empty() && self.eof_when_empty {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "script exhausted"));
        }

        let deadline = Instant::now() + wait;
        match self.incoming.front().map(|p| p.at) {
            Some(at) if at <= deadline => {
                sleep_until(at).await;
                Ok(self.take_ready())
            }
            _ => {
                sleep(wait).await;
                Ok(Bytes::new())
            }
        }
    }

    async fn drain(&mut self) -> io::Result<Bytes> {
        Ok(self.take_ready())
    }

    fn bytes_available(&self) -> io::Result<usize> {
        let now = Instant::now();
        Ok(self
            .incoming
            .iter()
            .take_while(|p| p.at <= now)
            .map(|p| p.data.len())
            .sum())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.take_ready();
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
