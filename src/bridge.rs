//! Main loop: sensor lines in, HTTP requests out over the modem socket

use crate::config::{BridgeConfig, LoopTimings};
use crate::modem::ModemSession;
use crate::sensor::{LineReader, SensorEvent};
use crate::transport::SerialLink;
use crate::uplink::{TransmissionOutcome, TransmissionPipeline};
use anyhow::{bail, Context, Result};
use cellbridge_shared::{EncodeOutcome, FrameAssembler, FrameOutcome, TelemetryEncoder};
use futures::FutureExt;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Why `Bridge::run` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The shutdown future resolved
    Shutdown,
    /// The sensor link closed
    SensorClosed,
    /// The main loop panicked
    Panicked,
}

enum Flow {
    /// Pause for this long before the next read
    Continue(Duration),
    Stop,
}

fn shutdown_requested() -> StopReason {
    info!("[Bridge] Shutdown requested");
    StopReason::Shutdown
}

/// Owns both links and everything between them
pub struct Bridge<M, S> {
    session: ModemSession<M>,
    sensor: LineReader<S>,
    assembler: FrameAssembler,
    encoder: TelemetryEncoder,
    pipeline: TransmissionPipeline,
    timing: LoopTimings,
}

impl<M: SerialLink, S: SerialLink> Bridge<M, S> {
    pub fn new(
        session: ModemSession<M>,
        sensor: LineReader<S>,
        assembler: FrameAssembler,
        encoder: TelemetryEncoder,
        pipeline: TransmissionPipeline,
        timing: LoopTimings,
    ) -> Self {
        Self {
            session,
            sensor,
            assembler,
            encoder,
            pipeline,
            timing,
        }
    }

    /// Wire a bridge from resolved configuration
    pub fn from_config(session: ModemSession<M>, sensor: S, config: &BridgeConfig) -> Self {
        let pipeline = TransmissionPipeline::new(session.socket_id(), config.pipeline);
        Self::new(
            session,
            LineReader::new(sensor, config.sensor_port.read_timeout),
            FrameAssembler::new(config.frame_policy.clone()),
            config.encoder(),
            pipeline,
            config.loop_timing,
        )
    }

    pub fn session(&self) -> &ModemSession<M> {
        &self.session
    }

    /// Release both links
    pub fn into_links(self) -> (M, S) {
        (self.session.into_link(), self.sensor.into_inner())
    }

    /// Run until `shutdown` resolves, the sensor closes, or the loop panics.
    ///
    /// Shutdown is only observed between cycles, so an exchange already on
    /// the modem link runs to the end of its response window first. Teardown
    /// runs afterwards in every case.
    pub async fn run<F>(&mut self, shutdown: F) -> StopReason
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let reason = match AssertUnwindSafe(self.main_loop(shutdown.as_mut()))
            .catch_unwind()
            .await
        {
            Ok(reason) => reason,
            Err(_) => {
                error!("[Bridge] Main loop panicked");
                StopReason::Panicked
            }
        };

        self.session.shutdown().await;
        info!("[Bridge] Stopped ({:?})", reason);
        reason
    }

    async fn main_loop<F>(&mut self, mut shutdown: Pin<&mut F>) -> StopReason
    where
        F: Future<Output = ()>,
    {
        info!(
            "[Bridge] Forwarding sensor data from {} to socket {}",
            self.sensor.link().name(),
            self.pipeline.socket_id()
        );
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.as_mut() => return shutdown_requested(),
                event = self.sensor.next_event() => event,
            };

            let pause = match self.handle_event(event).await {
                Ok(Flow::Continue(pause)) => pause,
                Ok(Flow::Stop) => return StopReason::SensorClosed,
                Err(e) => {
                    warn!("[Bridge] Cycle failed: {:#}", e);
                    self.timing.idle_delay
                }
            };

            tokio::select! {
                biased;
                _ = shutdown.as_mut() => return shutdown_requested(),
                _ = sleep(pause) => {}
            }
        }
    }

    async fn handle_event(&mut self, event: io::Result<SensorEvent>) -> Result<Flow> {
        match event.context("sensor read failed")? {
            SensorEvent::Line(line) => {
                self.process_line(&line).await?;
                Ok(Flow::Continue(self.timing.line_delay))
            }
            SensorEvent::Idle => Ok(Flow::Continue(self.timing.idle_delay)),
            SensorEvent::Closed => {
                warn!("[Bridge] Sensor link closed");
                Ok(Flow::Stop)
            }
        }
    }

    /// Feed one sensor line through assembly, encoding and transmission.
    ///
    /// Returns `None` when the line did not complete a frame worth sending.
    pub async fn process_line(&mut self, line: &str) -> Result<Option<TransmissionOutcome>> {
        debug!("[Bridge] Sensor line: {}", line);

        let report = self.assembler.push_line(line);
        for ignored in &report.ignored {
            warn!("[Sensor] Ignored {}", ignored);
        }

        let frame = match report.outcome {
            FrameOutcome::Complete(frame) => frame,
            FrameOutcome::Pending { missing } => {
                debug!("[Bridge] Frame pending, missing {:?}", missing);
                return Ok(None);
            }
            FrameOutcome::Discarded => {
                debug!("[Bridge] No usable pairs in line");
                return Ok(None);
            }
        };

        let payload = match self.encoder.encode(&frame).context("encode failed")? {
            EncodeOutcome::Ready {
                payload,
                readings,
                rejected,
            } => {
                for r in &rejected {
                    warn!("[Bridge] Non-numeric value {}={}", r.key, r.value);
                }
                debug!(
                    "[Bridge] Encoded {} readings into {} bytes",
                    readings.len(),
                    payload.len()
                );
                payload
            }
            EncodeOutcome::NothingToSend { rejected } => {
                warn!(
                    "[Bridge] No numeric readings in frame ({} rejected)",
                    rejected.len()
                );
                return Ok(None);
            }
        };

        if !self.session.is_ready() {
            bail!("modem session not ready ({})", self.session.state());
        }

        let outcome = self
            .pipeline
            .transmit(self.session.exchange(), &payload)
            .await
            .context("transmit failed")?;
        match &outcome {
            TransmissionOutcome::Sent {
                announced,
                response,
            } => {
                info!("[Bridge] Sent {} bytes", announced);
                debug!("[Bridge] Modem reply: {}", response.trim());
            }
            TransmissionOutcome::Skipped { announced } => {
                warn!("[Bridge] Transmission of {} bytes skipped", announced);
            }
        }
        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::ModemConfig;
    use crate::transport::mock::{MockLink, Transcript};
    use crate::uplink::PipelineTimings;
    use cellbridge_shared::{FramePolicy, HttpMethod, ModemState};
    use tokio::time::Instant;

    fn healthy_modem() -> MockLink {
        MockLink::new("modem")
            .reply("AT+CPIN?", "\r\n+CPIN: READY\r\n\r\nOK\r\n")
            .reply("AT+CGATT?", "\r\n+CGATT: 1\r\n\r\nOK\r\n")
            .reply("AT+NETOPEN", "\r\nOK\r\n\r\n+NETOPEN: 0\r\n")
            .reply("AT+CIPOPEN", "\r\nOK\r\n\r\n+CIPOPEN: 0,0\r\n")
    }

    async fn bridge(
        modem: MockLink,
        sensor: MockLink,
        policy: FramePolicy,
    ) -> (Bridge<MockLink, MockLink>, Transcript) {
        let transcript = modem.transcript();
        let mut session = ModemSession::new(
            modem,
            ModemConfig {
                host: "example.net".into(),
                ..Default::default()
            },
        );
        session.bring_up().await.expect("bring-up failed");

        let bridge = Bridge::new(
            session,
            LineReader::new(sensor, Duration::from_secs(1)),
            FrameAssembler::new(policy),
            TelemetryEncoder::new(HttpMethod::Post, "example.net", "/api/data"),
            TransmissionPipeline::new(0, PipelineTimings::default()),
            LoopTimings::default(),
        );
        (bridge, transcript)
    }

    fn sends(transcript: &Transcript) -> Vec<String> {
        transcript
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("AT+CIPSEND"))
            .collect()
    }

    fn body_of(transcript: &Transcript) -> String {
        transcript
            .writes()
            .into_iter()
            .find(|w| w.starts_with("POST"))
            .expect("a request was written")
    }

    #[tokio::test(start_paused = true)]
    async fn test_line_to_request() {
        let modem = healthy_modem().reply("AT+CIPSEND", "\r\n>");
        let sensor = MockLink::new("sensor")
            .feed(Duration::ZERO, b"speed=50,temp=36.2,gear=3,fuel=80,rpm=3200\n")
            .eof_when_empty();
        let (mut bridge, transcript) = bridge(modem, sensor, FramePolicy::line_atomic()).await;

        let reason = bridge.run(std::future::pending()).await;

        assert_eq!(reason, StopReason::SensorClosed);
        assert_eq!(sends(&transcript).len(), 1);
        let request = body_of(&transcript);
        assert!(request.contains("\"sensor_type\":\"temperature\",\"value\":36.2"));
        assert!(request.contains("\"sensor_type\":\"speed\",\"value\":50.0"));
        assert!(request.contains("\"sensor_type\":\"rpm\",\"value\":3200.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skipped_send_moves_on() {
        // First announce gets no prompt, second one does
        let modem = healthy_modem()
            .reply("AT+CIPSEND", "\r\nERROR\r\n")
            .reply("AT+CIPSEND", "\r\n>");
        let sensor = MockLink::new("sensor")
            .feed(Duration::ZERO, b"rpm=1000\n")
            .feed(Duration::from_secs(1), b"rpm=2000\n")
            .eof_when_empty();
        let (mut bridge, transcript) = bridge(modem, sensor, FramePolicy::line_atomic()).await;

        bridge.run(std::future::pending()).await;

        assert_eq!(sends(&transcript).len(), 2);
        assert!(body_of(&transcript).contains("2000"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_line_without_pairs_sends_nothing() {
        let (mut bridge, transcript) = bridge(
            healthy_modem(),
            MockLink::new("sensor"),
            FramePolicy::line_atomic(),
        )
        .await;

        assert_eq!(bridge.process_line("garbage").await.expect("no error"), None);
        assert_eq!(bridge.process_line("=5,x=").await.expect("no error"), None);
        assert_eq!(
            bridge.process_line("speed=fast").await.expect("no error"),
            None
        );
        assert!(sends(&transcript).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accumulating_sends_once_per_frame() {
        let modem = healthy_modem()
            .reply("AT+CIPSEND", "\r\n>")
            .reply("AT+CIPSEND", "\r\n>");
        let (mut bridge, transcript) = bridge(
            modem,
            MockLink::new("sensor"),
            FramePolicy::accumulating(["SPEED", "TEMP", "GEAR", "FUEL", "RPM"]),
        )
        .await;

        for line in ["rpm=3200", "gear=3", "speed=50", "rpm=3300", "fuel=80"] {
            assert_eq!(bridge.process_line(line).await.expect("no error"), None);
        }
        let outcome = bridge.process_line("temp=36.2").await.expect("no error");
        assert!(matches!(outcome, Some(TransmissionOutcome::Sent { .. })));
        assert_eq!(sends(&transcript).len(), 1);

        // Nothing carries over into the next frame
        assert_eq!(bridge.process_line("temp=30").await.expect("no error"), None);
        assert_eq!(sends(&transcript).len(), 1);
        let request = body_of(&transcript);
        assert!(request.contains("3300"));
        assert!(!request.contains("3200"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_tears_down() {
        let sensor = MockLink::new("sensor");
        let (mut bridge, transcript) =
            bridge(healthy_modem(), sensor, FramePolicy::line_atomic()).await;

        let reason = bridge.run(sleep(Duration::from_secs(5))).await;

        assert_eq!(reason, StopReason::Shutdown);
        let commands = transcript.commands();
        let tail = &commands[commands.len() - 2..];
        assert_eq!(tail, ["AT+CIPCLOSE=0", "AT+NETCLOSE"]);
        assert_eq!(bridge.session().state(), ModemState::SocketClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_open_send_window() {
        // No prompt ever comes; shutdown lands inside the prompt wait
        let sensor = MockLink::new("sensor").feed(Duration::ZERO, b"rpm=1\n");
        let (mut bridge, transcript) =
            bridge(healthy_modem(), sensor, FramePolicy::line_atomic()).await;

        let started = Instant::now();
        let reason = bridge.run(sleep(Duration::from_secs(1))).await;

        assert_eq!(reason, StopReason::Shutdown);
        let commands = transcript.commands();
        let tail = &commands[commands.len() - 3..];
        assert!(tail[0].starts_with("AT+CIPSEND=0,"));
        assert_eq!(tail[1..], ["AT+CIPCLOSE=0", "AT+NETCLOSE"]);

        // Prompt timeout, then both teardown settles
        let timings = PipelineTimings::default();
        let teardown = Duration::from_millis(
            cellbridge_shared::timing::SOCKET_CLOSE_SETTLE_MS
                + cellbridge_shared::timing::BEARER_CLOSE_SETTLE_MS,
        );
        assert!(started.elapsed() >= timings.prompt_timeout + teardown);
    }
}
