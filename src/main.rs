//! sketch-export command line
//!
//! `sketch-export gif|mp4 <input> [output]` converts frames already on disk;
//! `sketch-export serve` hosts the HTTP frame intake for streaming exports.

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use sketch_export::config::{ServeConfig, StreamSettings, ENCODER_PATH_ENV};
use sketch_export::export::{
    convert_until, ConvertRequest, EncoderBinary, EncoderLocator, EncoderTracker, ExportError,
    ExportFormat, ExportOptions, FrameEncoding, RawExportOptions,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

/// Exit code used when interrupted with Ctrl-C
const INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "sketch-export", version, about = "Export sketch frames to GIF and MP4 with ffmpeg")]
struct Cli {
    /// Only log warnings and errors, and hide encoder output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// ffmpeg binary to use instead of searching for one
    #[arg(long = "cmd", global = true, env = ENCODER_PATH_ENV, value_name = "PATH")]
    encoder: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a video or image sequence into an animated GIF
    Gif(ConvertArgs),
    /// Convert a video or image sequence into an MP4
    Mp4(ConvertArgs),
    /// Serve the HTTP frame intake for streaming exports
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Input video, sequence pattern (frames/%03d.png) or directory of numbered frames
    input: PathBuf,

    /// Output file; defaults to a timestamped name in the current directory
    output: Option<PathBuf>,

    /// Frame rate of the export
    #[arg(short = 'r', long, visible_alias = "rate", default_value_t = 24.0)]
    fps: f64,

    /// Frame rate the input sequence is decoded at (defaults to --fps)
    #[arg(long)]
    input_fps: Option<f64>,

    /// Frame rate written to the output container
    #[arg(long)]
    output_fps: Option<f64>,

    /// Scale, e.g. 512 or 640:-1
    #[arg(short, long)]
    scale: Option<String>,

    /// Start offset, in seconds or [HH:]MM:SS[.ms]
    #[arg(short = 'S', long)]
    start: Option<String>,

    /// Duration, in seconds or [HH:]MM:SS[.ms]
    #[arg(short, long)]
    time: Option<String>,

    /// Overwrite the output if it exists
    #[arg(short, long, visible_short_alias = 'y', visible_alias = "yes")]
    force: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StreamFormat {
    Mp4,
    Gif,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 9966)]
    port: u16,

    /// Directory exports and saved frames are written to
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Save uploaded frames as files instead of streaming them to an encoder
    #[arg(long)]
    no_stream: bool,

    /// Format of streams that do not request one
    #[arg(long, value_enum, default_value_t = StreamFormat::Mp4)]
    stream: StreamFormat,

    /// Frame rate of streams that do not request one
    #[arg(long, default_value_t = 24.0)]
    fps: f64,

    /// Encoding of uploaded frames when a stream does not name one
    #[arg(long, default_value = "image/png")]
    encoding: String,

    /// Forward uploads to the encoder chunk by chunk
    #[arg(long)]
    chunked: bool,

    /// Kill an encoder that has not exited this many seconds after its stream ended
    #[arg(long, value_name = "SECONDS")]
    drain_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    sketch_export::init_tracing(cli.quiet);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if matches!(e.downcast_ref::<ExportError>(), Some(ExportError::Cancelled)) => {
            tracing::warn!("Interrupted: {}", e);
            ExitCode::from(INTERRUPTED)
        }
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cwd = std::env::current_dir().context("could not read the current directory")?;
    let binary = match cli.encoder {
        Some(path) => EncoderBinary::new(path),
        None => EncoderLocator::from_env(&cwd).resolve().await?,
    };

    match cli.command {
        Command::Gif(args) => export(&binary, ExportFormat::Gif, args, cwd, cli.quiet).await,
        Command::Mp4(args) => export(&binary, ExportFormat::Mp4, args, cwd, cli.quiet).await,
        Command::Serve(args) => serve(binary, args, &cwd, cli.quiet).await,
    }
}

async fn export(
    binary: &EncoderBinary,
    format: ExportFormat,
    args: ConvertArgs,
    cwd: PathBuf,
    quiet: bool,
) -> anyhow::Result<()> {
    let options = ExportOptions::from_input(RawExportOptions {
        format: Some(format.to_string()),
        fps: Some(args.fps),
        input_fps: args.input_fps,
        output_fps: args.output_fps,
        scale: args.scale,
        start: args.start,
        time: args.time,
        encoding: None,
        quiet,
    })?;

    let tracker = EncoderTracker::new();
    let interrupted = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let outcome = convert_until(
        binary,
        ConvertRequest {
            options,
            input: args.input,
            output: args.output,
            cwd,
            force: args.force,
        },
        &tracker,
        interrupted,
    )
    .await?;

    println!("{}", outcome.output.display());
    Ok(())
}

async fn serve(binary: EncoderBinary, args: ServeArgs, cwd: &Path, quiet: bool) -> anyhow::Result<()> {
    let encoding = FrameEncoding::parse(&args.encoding)
        .with_context(|| format!("unsupported frame encoding {}", args.encoding))?;
    let format = match args.stream {
        StreamFormat::Mp4 => ExportFormat::Mp4,
        StreamFormat::Gif => ExportFormat::Gif,
    };

    let stream = (!args.no_stream).then(|| StreamSettings {
        format,
        encoding,
        fps: args.fps,
        chunked: args.chunked,
        drain_timeout: args.drain_timeout.map(Duration::from_secs),
    });

    let config = ServeConfig {
        host: args.host,
        port: args.port,
        output_dir: cwd.join(args.output),
        stream,
        quiet,
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutting down frame intake");
    };
    sketch_export::server::serve(config, binary, shutdown).await?;
    Ok(())
}
