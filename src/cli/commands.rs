use crate::cli::args::{CheckConfigArgs, StartArgs};
use crate::core::config::Config;
use crate::core::runtime::App;
use crate::telemetry;
use anyhow::Result;

pub async fn run_start(args: StartArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_from_env()?,
    };
    let _log_handle = telemetry::init_tracing(&config.telemetry)?;
    let app = App::new(config)?;
    app.run().await
}

pub fn run_check_config(args: CheckConfigArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    config.validate()?;
    println!("{} OK", args.config.display());
    Ok(())
}
