use anyhow::{Context, Result};
use std::{env, fs::OpenOptions, sync::Arc, sync::Mutex};
use structopt::StructOpt;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};
use train::config::{Args, Experiment};

#[tokio::main]
pub async fn main() -> Result<()> {
    // parse arguments
    let args = Args::from_args();

    // prepare and validate the experiment before logging to a file in it
    let experiment = Experiment::prepare(args)?;
    let log_file = {
        let path = experiment.log_file();
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file {}", path.display()))?
    };

    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(log_file));
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        let filter = if env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        };
        filter
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(file_layer)
        .init();

    // log parameters
    for warning in &experiment.warnings {
        warn!("{}", warning);
    }
    info!("Training using the following parameters:");
    match serde_json::to_value(&experiment.args)? {
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                info!("{:>24}: {}", key, value);
            }
        }
        value => info!("{}", value),
    }

    // start training program
    let result = train::start(Arc::new(experiment))
        .instrument(info_span!("train"))
        .await;
    if let Err(err) = &result {
        error!("training failed: {:#}", err);
    }
    result
}
