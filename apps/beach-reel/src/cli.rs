use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use beach_reel::config::Prewarm;
use beach_reel::session::Resolution;
use beach_reel::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "beach-reel",
    about = "Receive multiplexed H.264 picture streams over TCP",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = DecoderKind::Echo,
        help = "Decoder backend used for every stream"
    )]
    pub decoder: DecoderKind,

    #[arg(
        long = "print-metrics",
        global = true,
        help = "Print Prometheus metrics to stdout on exit"
    )]
    pub print_metrics: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        global = true,
        value_enum,
        env = "BEACH_REEL_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "BEACH_REEL_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum DecoderKind {
    /// Built-in decoder that echoes input bytes as picture data
    Echo,
    /// Platform decoder library (requires the `native` feature)
    Native,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect to a sender and decode its streams (default)
    Receive(ReceiveArgs),
    /// Serve a file of raw wire bytes to one receiver
    Replay(ReplayArgs),
    /// Write a wire file of generated image frames, for use with `replay`
    Synth(SynthArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct ReceiveArgs {
    #[arg(long, env = "BEACH_REEL_SERVER", value_name = "HOST:PORT", help = "Sender address")]
    pub server: Option<String>,

    #[arg(long = "tick-hz", value_name = "HZ", help = "Owning-thread tick rate [default: 60]")]
    pub tick_hz: Option<u32>,

    #[arg(long, value_name = "N", help = "Exit after N decoded pictures")]
    pub frames: Option<u64>,

    #[arg(
        long = "dump-dir",
        value_name = "DIR",
        help = "Write every decoded picture as raw NV12 into DIR"
    )]
    pub dump_dir: Option<PathBuf>,

    #[arg(
        long = "prewarm",
        value_name = "ID:WxH",
        help = "Create this stream's session before its first frame (repeatable)"
    )]
    pub prewarm: Vec<Prewarm>,

    #[arg(long = "no-prewarm", conflicts_with = "prewarm", help = "Do not create any session up front")]
    pub no_prewarm: bool,

    #[arg(
        long = "max-payload",
        value_name = "BYTES",
        help = "Largest payload length accepted in a frame header"
    )]
    pub max_payload: Option<u32>,

    #[arg(
        long = "max-resolution",
        env = "BEACH_REEL_MAX_RESOLUTION",
        value_name = "WxH",
        help = "Largest picture size a frame may declare [default: 4096x4096]"
    )]
    pub max_resolution: Option<Resolution>,

    #[arg(
        long = "echo-warmup",
        value_name = "FRAMES",
        help = "Frames the echo decoder swallows before emitting pictures [default: 0]"
    )]
    pub echo_warmup: Option<u64>,
}

#[derive(Args, Debug, Clone)]
pub struct ReplayArgs {
    #[arg(value_name = "FILE", help = "Raw wire bytes to send")]
    pub file: PathBuf,

    #[arg(long, default_value = "127.0.0.1:12345", value_name = "HOST:PORT")]
    pub listen: String,

    #[arg(long, default_value_t = 4096, value_name = "BYTES", help = "Bytes per socket write")]
    pub chunk: usize,

    #[arg(long = "pace-ms", default_value_t = 0, value_name = "MS", help = "Delay between writes")]
    pub pace_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct SynthArgs {
    #[arg(value_name = "FILE")]
    pub out: PathBuf,

    #[arg(long, default_value_t = 1)]
    pub streams: u8,

    #[arg(long, default_value_t = 30)]
    pub frames: u32,

    #[arg(long, default_value = "640x480", value_name = "WxH")]
    pub resolution: Resolution,

    #[arg(
        long = "noise",
        default_value_t = 0,
        value_name = "BYTES",
        help = "Garbage bytes inserted before every frame"
    )]
    pub noise: usize,
}
