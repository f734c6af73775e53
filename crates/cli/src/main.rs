mod cmd;

use std::process::ExitCode;

use argp::FromArgs;
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

#[derive(FromArgs, PartialEq, Debug)]
/// Orchestration hub for a multi-repository CI fleet.
struct TopLevel {
    #[argp(subcommand)]
    command: Command,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand)]
enum Command {
    Aggregate(cmd::aggregate::Args),
}

#[tokio::main]
async fn main() -> ExitCode {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let args: TopLevel = argp::parse_args_or_exit(argp::DEFAULT);
    let result = match args.command {
        Command::Aggregate(args) => cmd::aggregate::run(args).await,
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:?}");
            ExitCode::FAILURE
        }
    }
}
