//! Modem Lifecycle
//!
//! Drives the modem from power-on to an open TCP socket with a fixed sequence
//! of command/response pairs, and tears the socket and bearer down again on
//! shutdown. Every step goes through `AtExchange`; the shared state machine
//! records where the session stands.

use crate::modem::commands;
use crate::modem::{AtExchange, ModemError, RetryOutcome, RetryPolicy};
use crate::transport::SerialLink;
use cellbridge_shared::{timing, ModemEvent, ModemState, ModemStateMachine, TransitionResult};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Dwell times and retry policy for each lifecycle step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModemTimings {
    /// Local AT commands (AT, ATE0, CPIN, CGATT, IPADDR)
    pub local_settle: Duration,
    pub apn_settle: Duration,
    pub bearer_close_settle: Duration,
    pub bearer_open_settle: Duration,
    pub socket_open_immediate: Duration,
    /// Second read window for the delayed +CIPOPEN notification
    pub socket_open_delayed: Duration,
    pub socket_close_settle: Duration,
    pub attach: RetryPolicy,
}

impl Default for ModemTimings {
    fn default() -> Self {
        Self {
            local_settle: Duration::from_millis(timing::LOCAL_SETTLE_MS),
            apn_settle: Duration::from_millis(timing::APN_SETTLE_MS),
            bearer_close_settle: Duration::from_millis(timing::BEARER_CLOSE_SETTLE_MS),
            bearer_open_settle: Duration::from_millis(timing::BEARER_OPEN_SETTLE_MS),
            socket_open_immediate: Duration::from_millis(timing::SOCKET_OPEN_IMMEDIATE_MS),
            socket_open_delayed: Duration::from_millis(timing::SOCKET_OPEN_DELAYED_MS),
            socket_close_settle: Duration::from_millis(timing::SOCKET_CLOSE_SETTLE_MS),
            attach: RetryPolicy::new(
                timing::ATTACH_MAX_ATTEMPTS,
                Duration::from_millis(timing::ATTACH_BACKOFF_MS),
            ),
        }
    }
}

/// Network and socket parameters for the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModemConfig {
    /// Carrier access point name
    pub apn: String,
    /// Remote host the socket connects to
    pub host: String,
    /// Remote TCP port
    pub port: u16,
    /// Modem socket identifier (0-9)
    pub socket_id: u8,
    pub timings: ModemTimings,
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            apn: "internet".into(),
            host: "localhost".into(),
            port: 80,
            socket_id: 0,
            timings: ModemTimings::default(),
        }
    }
}

/// One modem session: the exchange, its state and its configuration
pub struct ModemSession<L> {
    config: ModemConfig,
    exchange: AtExchange<L>,
    fsm: ModemStateMachine,
    ip_address: Option<String>,
}

impl<L: SerialLink> ModemSession<L> {
    pub fn new(link: L, config: ModemConfig) -> Self {
        Self::with_exchange(AtExchange::new(link), config)
    }

    pub fn with_exchange(exchange: AtExchange<L>, config: ModemConfig) -> Self {
        Self {
            config,
            exchange,
            fsm: ModemStateMachine::new(),
            ip_address: None,
        }
    }

    pub fn state(&self) -> ModemState {
        self.fsm.state()
    }

    pub fn is_ready(&self) -> bool {
        self.fsm.is_ready()
    }

    pub fn socket_id(&self) -> u8 {
        self.config.socket_id
    }

    /// Response to the IP address query, if the bearer came up
    pub fn ip_address(&self) -> Option<&str> {
        self.ip_address.as_deref()
    }

    /// Exchange for follow-up traffic on the open socket
    pub fn exchange(&mut self) -> &mut AtExchange<L> {
        &mut self.exchange
    }

    /// Release the modem link
    pub fn into_link(self) -> L {
        self.exchange.into_inner()
    }

    /// Run the whole bring-up sequence, stopping at the first fatal step
    pub async fn bring_up(&mut self) -> Result<(), ModemError> {
        info!(
            "[Modem] Initialization starting on {}",
            self.exchange.link().name()
        );

        self.disable_echo().await?;
        self.check_sim().await?;

        match self.attach().await? {
            RetryOutcome::Succeeded { attempts, .. } => {
                info!("[Modem] Attached to packet network (attempt {})", attempts);
            }
            RetryOutcome::Exhausted { attempts } => {
                return Err(self.fail(
                    ModemEvent::AttachExhausted { attempts },
                    ModemError::AttachExhausted { attempts },
                ));
            }
        }

        self.configure_bearer().await?;
        self.open_bearer().await?;
        self.open_socket().await?;

        info!(
            "[Modem] Socket {} open to {}:{}",
            self.config.socket_id, self.config.host, self.config.port
        );
        Ok(())
    }

    async fn disable_echo(&mut self) -> Result<(), ModemError> {
        let settle = self.config.timings.local_settle;
        self.exchange.send(commands::PROBE, settle).await?;
        // No success test; a modem that keeps echoing still works
        self.exchange.send(commands::ECHO_OFF, settle).await?;
        self.advance(ModemEvent::EchoDisabled)?;
        Ok(())
    }

    async fn check_sim(&mut self) -> Result<(), ModemError> {
        let response = self
            .exchange
            .send(commands::SIM_STATUS, self.config.timings.local_settle)
            .await?;

        if response.contains(commands::SIM_READY) {
            self.advance(ModemEvent::SimReady)?;
            Ok(())
        } else {
            Err(self.fail(ModemEvent::SimNotReady, ModemError::SimNotReady { response }))
        }
    }

    /// Query packet attach under the bounded retry policy.
    ///
    /// Exhaustion is returned as a value, not an error, so the caller decides
    /// whether it is fatal.
    pub async fn attach(&mut self) -> Result<RetryOutcome<()>, ModemError> {
        let mut retry = self.config.timings.attach.start();

        while let Some(attempt) = retry.next_attempt().await {
            let response = self
                .exchange
                .send(commands::ATTACH_STATUS, self.config.timings.local_settle)
                .await?;

            if response.contains(commands::ATTACHED) {
                self.advance(ModemEvent::Attached)?;
                return Ok(RetryOutcome::Succeeded {
                    value: (),
                    attempts: attempt,
                });
            }

            warn!(
                "[Modem] Not attached yet (attempt {}/{})",
                attempt,
                retry.max_attempts()
            );
            self.advance(ModemEvent::AttachAttemptFailed)?;
        }

        Ok(RetryOutcome::Exhausted {
            attempts: retry.attempts(),
        })
    }

    async fn configure_bearer(&mut self) -> Result<(), ModemError> {
        let command = commands::define_context(&self.config.apn);
        self.exchange
            .send(&command, self.config.timings.apn_settle)
            .await?;
        self.advance(ModemEvent::BearerConfigured)?;
        Ok(())
    }

    async fn open_bearer(&mut self) -> Result<(), ModemError> {
        // Clear a bearer left open by a previous run; the reply doesn't matter
        self.exchange
            .send(commands::BEARER_CLOSE, self.config.timings.bearer_close_settle)
            .await?;

        let response = self
            .exchange
            .send(commands::BEARER_OPEN, self.config.timings.bearer_open_settle)
            .await?;
        if !response.contains(commands::BEARER_OPENED) {
            return Err(self.fail(
                ModemEvent::BearerOpenFailed,
                ModemError::BearerOpenFailed { response },
            ));
        }
        self.advance(ModemEvent::BearerOpened)?;

        let ip = self
            .exchange
            .send(commands::IP_ADDRESS, self.config.timings.local_settle)
            .await?;
        let ip = ip.trim();
        if !ip.is_empty() {
            debug!("[Modem] Bearer address: {}", ip);
            self.ip_address = Some(ip.to_string());
        }
        Ok(())
    }

    /// Open the TCP socket, reading both the immediate reply and the delayed
    /// notification window before deciding.
    async fn open_socket(&mut self) -> Result<(), ModemError> {
        let socket_id = self.config.socket_id;
        let command = commands::socket_open(socket_id, &self.config.host, self.config.port);

        let immediate = self
            .exchange
            .send(&command, self.config.timings.socket_open_immediate)
            .await?;
        let delayed = self
            .exchange
            .collect(self.config.timings.socket_open_delayed)
            .await?;
        let response = immediate + &delayed;

        if response.contains(&commands::socket_opened(socket_id)) {
            self.advance(ModemEvent::SocketOpened { socket_id })?;
            Ok(())
        } else {
            Err(self.fail(
                ModemEvent::SocketOpenFailed { socket_id },
                ModemError::SocketOpenFailed {
                    socket_id,
                    response,
                },
            ))
        }
    }

    /// Best-effort teardown: close the socket, then the bearer.
    ///
    /// Runs whatever the current state is; link errors are logged, not
    /// returned, so teardown always reaches the end.
    pub async fn shutdown(&mut self) {
        info!("[Modem] Closing socket {} and bearer", self.config.socket_id);

        let close = commands::socket_close(self.config.socket_id);
        if let Err(e) = self
            .exchange
            .send(&close, self.config.timings.socket_close_settle)
            .await
        {
            warn!("[Modem] Socket close failed: {}", e);
        }
        if let Err(e) = self
            .exchange
            .send(commands::BEARER_CLOSE, self.config.timings.bearer_close_settle)
            .await
        {
            warn!("[Modem] Bearer close failed: {}", e);
        }

        let _ = self.fsm.process_event(ModemEvent::SocketClosed);
        debug!("[Modem] Session state after teardown: {}", self.fsm.state());
    }

    /// Apply a progress event; anything but a clean transition is an error
    fn advance(&mut self, event: ModemEvent) -> Result<ModemState, ModemError> {
        let from = self.fsm.state();
        match self.fsm.process_event(event.clone()) {
            TransitionResult::Success(state) => {
                debug!("[Modem] {} -> {}", from, state);
                Ok(state)
            }
            TransitionResult::Invalid { from, event } => {
                Err(ModemError::InvalidTransition { from, event })
            }
            TransitionResult::Fatal { reason } => {
                error!("[Modem] FATAL: {}", reason);
                Err(ModemError::InvalidTransition { from, event })
            }
        }
    }

    /// Record a fatal event and hand back the matching error
    fn fail(&mut self, event: ModemEvent, err: ModemError) -> ModemError {
        match self.fsm.process_event(event) {
            TransitionResult::Fatal { reason } => error!("[Modem] FATAL: {}", reason),
            other => warn!("[Modem] Unexpected transition on failure: {:?}", other),
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockLink, Transcript};

    fn healthy_modem() -> MockLink {
        MockLink::new("modem")
            .reply("AT+CPIN?", "\r\n+CPIN: READY\r\n\r\nOK\r\n")
            .reply("AT+CGATT?", "\r\n+CGATT: 1\r\n\r\nOK\r\n")
            .reply("AT+NETOPEN", "\r\nOK\r\n\r\n+NETOPEN: 0\r\n")
            .reply("AT+IPADDR", "\r\n+IPADDR: 10.64.12.7\r\n\r\nOK\r\n")
    }

    fn config() -> ModemConfig {
        ModemConfig {
            apn: "internet.example".into(),
            host: "example.net".into(),
            ..Default::default()
        }
    }

    fn session(link: MockLink) -> (ModemSession<MockLink>, Transcript) {
        let transcript = link.transcript();
        (ModemSession::new(link, config()), transcript)
    }

    #[tokio::test(start_paused = true)]
    async fn test_bring_up_sequence() {
        let link = healthy_modem().reply("AT+CIPOPEN", "\r\nOK\r\n\r\n+CIPOPEN: 0,0\r\n");
        let (mut session, transcript) = session(link);

        session.bring_up().await.expect("bring-up failed");

        assert_eq!(session.state(), ModemState::SocketOpen);
        assert!(session.is_ready());
        assert!(session.ip_address().unwrap_or("").contains("10.64.12.7"));
        assert_eq!(
            transcript.commands(),
            vec![
                "AT",
                "ATE0",
                "AT+CPIN?",
                "AT+CGATT?",
                "AT+CGDCONT=1,\"IP\",\"internet.example\"",
                "AT+NETCLOSE",
                "AT+NETOPEN",
                "AT+IPADDR",
                "AT+CIPOPEN=0,\"TCP\",\"example.net\",80",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_socket_open_marker_in_delayed_window() {
        let link = healthy_modem().reply_after(
            "AT+CIPOPEN",
            &[
                (Duration::from_millis(50), "\r\nOK\r\n"),
                (Duration::from_secs(4), "\r\n+CIPOPEN: 0,0\r\n"),
            ],
        );
        let (mut session, _) = session(link);

        session.bring_up().await.expect("bring-up failed");
        assert_eq!(session.state(), ModemState::SocketOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_socket_open_marker_for_other_socket_is_fatal() {
        let link = healthy_modem().reply("AT+CIPOPEN", "\r\nOK\r\n\r\n+CIPOPEN: 1,0\r\n");
        let (mut session, transcript) = session(link);

        let err = session.bring_up().await.expect_err("bring-up should fail");
        assert!(matches!(
            err,
            ModemError::SocketOpenFailed { socket_id: 0, .. }
        ));
        assert_eq!(session.state(), ModemState::Failed);
        assert!(!transcript
            .writes()
            .iter()
            .any(|w| w.starts_with("AT+CIPSEND")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_socket_open_marker_after_both_windows_is_fatal() {
        let link = healthy_modem().reply_after(
            "AT+CIPOPEN",
            &[(Duration::from_secs(7), "\r\n+CIPOPEN: 0,0\r\n")],
        );
        let (mut session, _) = session(link);

        let err = session.bring_up().await.expect_err("bring-up should fail");
        assert!(matches!(err, ModemError::SocketOpenFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sim_not_ready_stops_early() {
        let link = MockLink::new("modem").reply("AT+CPIN?", "\r\n+CME ERROR: 10\r\n");
        let (mut session, transcript) = session(link);

        let err = session.bring_up().await.expect_err("bring-up should fail");
        assert!(matches!(err, ModemError::SimNotReady { .. }));
        assert_eq!(session.state(), ModemState::Failed);
        assert_eq!(transcript.commands(), vec!["AT", "ATE0", "AT+CPIN?"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_retries_then_succeeds() {
        let link = MockLink::new("modem")
            .reply("AT+CPIN?", "+CPIN: READY\r\nOK\r\n")
            .reply("AT+CGATT?", "+CGATT: 0\r\nOK\r\n")
            .reply("AT+CGATT?", "+CGATT: 0\r\nOK\r\n")
            .reply("AT+CGATT?", "+CGATT: 1\r\nOK\r\n");
        let (mut session, _) = session(link);

        session.disable_echo().await.expect("echo off failed");
        session.check_sim().await.expect("sim check failed");
        let outcome = session.attach().await.expect("attach errored");

        assert_eq!(
            outcome,
            RetryOutcome::Succeeded {
                value: (),
                attempts: 3
            }
        );
        assert_eq!(session.state(), ModemState::NetworkAttached);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_exhaustion_is_fatal() {
        let link = MockLink::new("modem")
            .reply("AT+CPIN?", "+CPIN: READY\r\nOK\r\n")
            .reply("AT+CGATT?", "+CGATT: 0\r\nOK\r\n")
            .reply("AT+CGATT?", "+CGATT: 0\r\nOK\r\n")
            .reply("AT+CGATT?", "+CGATT: 0\r\nOK\r\n");
        let (mut session, transcript) = session(link);

        let err = session.bring_up().await.expect_err("bring-up should fail");
        assert!(matches!(err, ModemError::AttachExhausted { attempts: 3 }));
        assert_eq!(session.state(), ModemState::Failed);

        let attach_queries = transcript
            .commands()
            .iter()
            .filter(|c| *c == "AT+CGATT?")
            .count();
        assert_eq!(attach_queries, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bearer_open_failure() {
        let link = MockLink::new("modem")
            .reply("AT+CPIN?", "+CPIN: READY\r\n")
            .reply("AT+CGATT?", "+CGATT: 1\r\n")
            .reply("AT+NETOPEN", "\r\n+NETOPEN: 1\r\n");
        let (mut session, transcript) = session(link);

        let err = session.bring_up().await.expect_err("bring-up should fail");
        assert!(matches!(err, ModemError::BearerOpenFailed { .. }));
        assert!(!transcript.commands().iter().any(|c| c.starts_with("AT+CIPOPEN")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_socket_then_bearer() {
        let link = healthy_modem().reply("AT+CIPOPEN", "+CIPOPEN: 0,0\r\n");
        let (mut session, transcript) = session(link);
        session.bring_up().await.expect("bring-up failed");

        session.shutdown().await;

        let commands = transcript.commands();
        let tail = &commands[commands.len() - 2..];
        assert_eq!(tail, ["AT+CIPCLOSE=0", "AT+NETCLOSE"]);
        assert_eq!(session.state(), ModemState::SocketClosed);
    }
}
