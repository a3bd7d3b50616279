mod config;
mod failure;
mod generate;
mod output;
mod server;
mod session;
mod signals;

use clap::Parser;
use session::{PreviewError, PreviewSession, SessionEnd};
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

/// Serve a generated static site on localhost until Enter or Ctrl-C,
/// making sure the server process never outlives the preview.
#[derive(Parser, Debug)]
#[command(name = "preview-server", version, about)]
pub struct Cli {
    /// Site root folder that contains the generated output directory
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Port to serve on (overrides config)
    #[arg(short, long, value_parser = clap::value_parser!(u16).range(1..))]
    port: Option<u16>,

    /// Config file path
    #[arg(short, long, default_value = "preview.toml")]
    config: PathBuf,

    /// Skip the configured generate command
    #[arg(long)]
    no_generate: bool,

    /// Extra logging (server stderr, state transitions, signal handling)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "preview_server=debug"
    } else {
        "preview_server=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    match run(&cli).await {
        Ok(SessionEnd::Input) => ExitCode::SUCCESS,
        // Only reached if re-raising SIGINT did not end the process.
        Ok(SessionEnd::Interrupted) => ExitCode::from(130),
        Err(PreviewError::Server(e)) => {
            eprintln!("\n❌ Failed to start local web server:\n{e}\n");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<SessionEnd, PreviewError> {
    let file = config::load_config(&cli.config)?;
    let port = cli.port.unwrap_or(file.server.port);
    let preview = config::PreviewConfig::new(cli.root.clone(), port)?;

    let generator = if cli.no_generate {
        generate::Generator::Skip
    } else {
        generate::Generator::from_config(file.generate.command.as_deref())
    };

    let mut session = PreviewSession::new(preview)
        .command(server::ServerCommand::new(
            file.server.command,
            file.server.args,
        ))
        .generator(generator)
        .output_locator(output::OutputLocator::new(file.output.dir_name))
        .grace_period(file.shutdown.grace_period());

    session.run(BufReader::new(std::io::stdin())).await
}
