mod bridge;
mod config;
mod modem;
mod sensor;
mod transport;
mod uplink;

use anyhow::{Context, Result};
use bridge::{Bridge, StopReason};
use cellbridge_shared::HttpMethod;
use clap::Parser;
use config::{BridgeConfig, BridgeConfigInput, Overrides, PolicyKind};
use modem::ModemSession;
use std::path::PathBuf;
use transport::{SerialLink, SerialPortLink};

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum MethodArg {
    Post,
    Get,
}

impl From<MethodArg> for HttpMethod {
    fn from(arg: MethodArg) -> Self {
        match arg {
            MethodArg::Post => HttpMethod::Post,
            MethodArg::Get => HttpMethod::Get,
        }
    }
}

/// Forward serial sensor readings to an HTTP endpoint over a cellular modem
#[derive(Debug, Parser)]
#[command(name = "cellbridge", version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial device of the modem
    #[arg(long)]
    modem_port: Option<String>,

    /// Serial device of the sensor
    #[arg(long)]
    sensor_port: Option<String>,

    /// Carrier access point name
    #[arg(long)]
    apn: Option<String>,

    /// Remote host to send telemetry to
    #[arg(long)]
    host: Option<String>,

    #[arg(long, value_enum)]
    method: Option<MethodArg>,

    #[arg(long, value_enum)]
    policy: Option<PolicyKind>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            modem_port: self.modem_port.clone(),
            sensor_port: self.sensor_port.clone(),
            apn: self.apn.clone(),
            host: self.host.clone(),
            method: self.method.map(Into::into),
            policy: self.policy,
        }
    }

    fn resolve(&self) -> Result<BridgeConfig> {
        let mut input = match &self.config {
            Some(path) => BridgeConfig::load_input(path)?,
            None => BridgeConfigInput::default(),
        };
        input.apply(self.overrides());
        input.resolve()
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let config = cli.resolve().context("Invalid configuration")?;

    info!("Cellbridge starting");
    info!("  Modem:  {} @ {}", config.modem_port.path, config.modem_port.baud);
    info!("  Sensor: {} @ {}", config.sensor_port.path, config.sensor_port.baud);
    info!(
        "  Target: {} {}:{}{}",
        config.method, config.modem.host, config.modem.port, config.path
    );

    let modem_link = SerialPortLink::open(&config.modem_port)?;
    let sensor_link = SerialPortLink::open(&config.sensor_port)?;

    let exchange = modem::AtExchange::new(modem_link).with_poll_interval(config.keyword_poll);
    let mut session = ModemSession::with_exchange(exchange, config.modem.clone());

    if let Err(e) = session.bring_up().await {
        error!("Modem initialization failed: {}", e);
        session.shutdown().await;
        return Err(e).context("Modem initialization failed");
    }
    if let Some(ip) = session.ip_address() {
        info!("Modem online: {}", ip);
    }

    let mut bridge = Bridge::from_config(session, sensor_link, &config);
    let reason = bridge
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for interrupt: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("Modem state after teardown: {}", bridge.session().state());
    let (modem_link, sensor_link) = bridge.into_links();
    info!("Releasing {} and {}", modem_link.name(), sensor_link.name());

    match reason {
        StopReason::Panicked => anyhow::bail!("main loop panicked"),
        StopReason::Shutdown | StopReason::SensorClosed => Ok(()),
    }
}
