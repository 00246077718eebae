use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ml_core::SharedSettings;
use tracing::info;

use crate::vision::{
    PipelineJob, ProcessArgs, ProcessConfig, ServeArgs, ServerConfig, backend, sampler::FixedStride, server,
    telemetry,
};

/// YOLO object detection service.
#[derive(Debug, Parser)]
#[command(name = "vision-server", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the HTTP and WebSocket detection API.
    Serve(ServeArgs),
    /// Annotate one video or camera capture and exit.
    Process(ProcessArgs),
}

pub fn handle_command(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Serve(args) => serve(args.try_into()?),
        Command::Process(args) => process(args.try_into()?),
    }
}

fn serve(config: ServerConfig) -> Result<()> {
    let _telemetry = telemetry::init(&config.telemetry);
    let detector = backend::load_detector(&config.detector)?;
    actix_web::rt::System::new().block_on(server::run(config, detector))
}

fn process(config: ProcessConfig) -> Result<()> {
    let _telemetry = telemetry::init(&config.telemetry);
    let detector = backend::load_detector(&config.detector)?;
    let settings = SharedSettings::new(config.detector.settings.clone())?;

    let mut job = PipelineJob::new(
        config.source.clone(),
        &config.output,
        settings.view(config.settings_refresh_frames),
    )
    .with_sampler(FixedStride::new(config.stride))
    .with_frame_limit(config.frame_limit);
    info!(job = %job.id(), source = %config.source, "processing");

    let summary = job
        .run(detector.as_ref())
        .with_context(|| format!("failed to process {}", config.source))?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
