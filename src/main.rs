use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use xsens_dot_streamer::app;
use xsens_dot_streamer::domain::settings::SettingsService;
use xsens_dot_streamer::infrastructure::logging;

#[derive(Parser, Debug)]
#[command(name = "xsens_dot_streamer")]
#[command(about = "Stream Xsens DOT sensors and compute joint angles", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan, connect and stream until Ctrl-C (default)
    Stream,
    /// Join two DOT CSV exports on SampleTimeFine and compute joint angles
    Process {
        /// Export of the proximal sensor
        first: PathBuf,
        /// Export of the distal sensor
        second: PathBuf,
        /// Output file, derived from the input names when omitted
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut settings = SettingsService::new()?;
    let _guard = logging::init_logger(&settings.get().log_settings)?;
    info!("Starting Xsens DOT streamer");
    info!("Settings: {}", settings.path().display());

    let result = match args.command.unwrap_or(Command::Stream) {
        Command::Stream => app::run(&mut settings).await,
        Command::Process {
            first,
            second,
            output,
        } => app::process_recordings(&first, &second, output.as_deref()),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}
