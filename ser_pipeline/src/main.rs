use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::util::SubscriberInitExt;

use ser_pipeline::telemetry;

mod args;

fn main() -> eyre::Result<()> {
    // We don't care if it can't find a .env file
    let _ = dotenv::dotenv();

    color_eyre::install()?;
    let args = args::ClapArgs::parse();

    telemetry::create_subscriber(telemetry::DEFAULT_DIRECTIVES)?.init();

    let mut conf = match &args.config {
        Some(path) => ser_pipeline::config::initialise_config_at(path)?,
        None => ser_pipeline::config::initialise_config()?,
    };
    args.commands.apply_overrides(&mut conf);
    conf.validate()?;
    let conf = Arc::new(conf);

    let now = std::time::Instant::now();

    args.commands.run(conf)?;

    tracing::info!("Runtime: {:.2?}", now.elapsed());

    Ok(())
}
