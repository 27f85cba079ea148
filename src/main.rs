use amqp_influx::stats::{StatsLog, TracingSink};
use amqp_influx::{Bridge, Config};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "amqp-influx")]
#[command(about = "Forwards metrics from a RabbitMQ queue to InfluxDB", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(long, help = "Infer the timestamp unit from its magnitude instead of assuming nanoseconds")]
    verify_timestamp: bool,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting amqp-influx");
    info!("Loading configuration from {:?}", args.config);

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;
    if args.verify_timestamp {
        config.parser.infer_timestamp_unit = true;
    }

    info!(
        broker_host = %config.broker.host,
        broker_port = config.broker.port,
        virtual_host = %config.broker.virtual_host,
        queue = %config.broker.queue,
        influx_url = %config.influx.url,
        influx_database = %config.influx.database,
        "Configuration summary"
    );

    let stats = StatsLog::new(Arc::new(TracingSink));
    if let Err(e) = Bridge::new(config, stats).run().await {
        error!(error = %e, "Bridge stopped");
        return Err(e.into());
    }

    info!("Bridge stopped");
    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("amqp_influx=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("amqp_influx=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
