use clap::Parser;
use clap_derive::Parser;
use crtplink::config::CrazyflieConfig;
use crtplink::connection::connection_events::ConnectionEvent;
use crtplink::connection::crazyflie::Crazyflie;
use crtplink::logging::log_config::{LogConfig, LogVariable};
use anyhow::anyhow;
use tokio::select;
use tracing::{info, warn, Level};

/// Connects to a vehicle, logs some of its variables and prints the samples
#[derive(Parser)]
struct Args {
    /// e.g. udp://127.0.0.1:19850
    uri: String,

    /// complete names of the variables to log, e.g. pm.vbat
    #[clap(required = true)]
    variable: Vec<String>,

    #[clap(long, default_value_t = 100)]
    period_ms: u32,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let crazyflie = Crazyflie::new(CrazyflieConfig::new()).await?;
    let mut events = crazyflie.subscribe();
    crazyflie.open(&args.uri).await?;

    loop {
        match events.recv().await? {
            ConnectionEvent::SetupFinished { .. } => break,
            ConnectionEvent::ConnectionFailed { message, .. } => return Err(anyhow!("connection failed: {}", message)),
            ConnectionEvent::ConnectionLost { message, .. } => return Err(anyhow!("connection lost: {}", message)),
            event => info!("{:?}", event),
        }
    }

    let toc = crazyflie.log().toc().await;
    info!("log TOC has {} variables", toc.len());

    let mut config = LogConfig::new("log_client", args.period_ms);
    for name in &args.variable {
        config = config.with_variable(LogVariable::toc(name));
    }
    let block = crazyflie.log().register_config(config).await?;
    let mut samples = block.subscribe();
    block.start().await;

    let result = loop {
        select! {
            sample = samples.recv() => {
                match sample {
                    Ok(sample) => {
                        let values = sample.values.iter()
                            .map(|(name, value)| format!("{}={}", name, value))
                            .collect::<Vec<_>>()
                            .join(" ");
                        println!("[{}] {}", sample.timestamp, values);
                    }
                    Err(e) => warn!("missed samples: {}", e),
                }
            }
            event = events.recv() => {
                if let Ok(ConnectionEvent::ConnectionLost { message, .. }) = event {
                    break Err(anyhow!("connection lost: {}", message));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                break Ok(());
            }
        }
    };

    block.stop().await;
    block.close().await;
    crazyflie.close().await;
    result
}
