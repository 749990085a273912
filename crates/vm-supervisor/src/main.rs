use std::fmt;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use tracing::{Level, error};
use tracing_subscriber::fmt::time::FormatTime;
use vm_engine_qemu::QemuEngine;
use vm_supervisor::Supervisor;
use vm_supervisor::cli::Cli;
use vm_supervisor::config::{self, BootConfig};

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(std::io::stderr)
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    let file = match &cli.config {
        Some(path) => match config::load(path).await {
            Ok(file) => file,
            Err(e) => {
                error!("{e}");
                return ExitCode::FAILURE;
            }
        },
        None => BootConfig::default(),
    };

    let launch = match cli.into_launch(file) {
        Ok(launch) => launch,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let mut engine = QemuEngine::new(launch.qemu);
    let outcome = Supervisor::new().run(launch.options, &mut engine).await;
    outcome.exit_code()
}
