mod cli;
mod consumers;

use std::fs;
use std::io::Write;
use std::net::{Shutdown, TcpListener};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use beach_reel::decoder::DecoderFactory;
use beach_reel::decoder::echo::EchoFactory;
use beach_reel::protocol::{ImagePayload, ProtocolError, encode_image};
use beach_reel::telemetry::logging;
use beach_reel::{Config, ConnectionEvent, ResourceConsumer, StreamHost, metrics};
use bytes::{Bytes, BytesMut};
use clap::Parser;
use crossbeam_channel::TryRecvError;

use cli::{Cli, Command, DecoderKind, ReceiveArgs, ReplayArgs, SynthArgs};
use consumers::{DumpConsumer, LogConsumer};

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialize logging")?;

    let result = match cli.command {
        Some(Command::Receive(args)) => receive(args, cli.decoder),
        None => receive(ReceiveArgs::default(), cli.decoder),
        Some(Command::Replay(args)) => replay(args),
        Some(Command::Synth(args)) => synth(args),
    };

    if cli.print_metrics {
        print!("{}", metrics::render());
    }
    result
}

fn receive(args: ReceiveArgs, decoder: DecoderKind) -> Result<()> {
    let mut config = Config::from_env();
    if let Some(server) = args.server {
        config.server = server;
    }
    if let Some(tick_hz) = args.tick_hz {
        config.tick_hz = tick_hz;
    }
    if let Some(max_payload) = args.max_payload {
        config.max_payload_len = max_payload;
    }
    if let Some(max_resolution) = args.max_resolution {
        config.max_resolution = max_resolution;
    }
    if args.no_prewarm {
        config.prewarm.clear();
    } else if !args.prewarm.is_empty() {
        config.prewarm = args.prewarm;
    }

    let factory = decoder_factory(decoder, args.echo_warmup.unwrap_or(0))?;
    let mut consumer: Box<dyn ResourceConsumer> = match &args.dump_dir {
        Some(dir) => {
            let consumer = DumpConsumer::create(dir)
                .with_context(|| format!("failed to create dump directory {}", dir.display()))?;
            tracing::info!(dir = %consumer.dir().display(), "dumping decoded pictures");
            Box::new(consumer)
        }
        None => Box::new(LogConsumer::default()),
    };

    let interval = config.tick_interval();
    tracing::info!(
        server = %config.server,
        decoder = factory.name(),
        tick_hz = config.tick_hz,
        prewarm = config.prewarm.len(),
        max_resolution = %config.max_resolution,
        "starting receiver"
    );
    let mut host = StreamHost::new(config, factory);
    host.connect().context("failed to connect to sender")?;
    let events = host.events();

    let mut pictures: u64 = 0;
    let closed = loop {
        let started = Instant::now();
        pictures += host.tick(&mut *consumer).uploads as u64;
        if args.frames.is_some_and(|limit| pictures >= limit) {
            tracing::info!(pictures, "picture limit reached");
            break None;
        }
        match events.try_recv() {
            Ok(ConnectionEvent::Closed { error, stats, .. }) => {
                // Work queued before the connection ended still runs.
                pictures += host.tick(&mut *consumer).uploads as u64;
                tracing::info!(
                    messages = stats.messages,
                    resyncs = stats.resyncs,
                    skipped = stats.skipped_bytes,
                    "connection closed"
                );
                break error;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => break None,
        }
        thread::sleep(interval.saturating_sub(started.elapsed()));
    };

    let released = host.shutdown();
    tracing::info!(pictures, released, "receiver stopped");
    match closed {
        None | Some(ProtocolError::ConnectionClosed) => Ok(()),
        Some(err) => Err(err).context("connection failed"),
    }
}

fn decoder_factory(kind: DecoderKind, echo_warmup: u64) -> Result<Arc<dyn DecoderFactory>> {
    match kind {
        DecoderKind::Echo => Ok(Arc::new(EchoFactory::new(echo_warmup))),
        DecoderKind::Native => native_factory(),
    }
}

#[cfg(feature = "native")]
fn native_factory() -> Result<Arc<dyn DecoderFactory>> {
    Ok(Arc::new(beach_reel::decoder::native::NativeFactory))
}

#[cfg(not(feature = "native"))]
fn native_factory() -> Result<Arc<dyn DecoderFactory>> {
    bail!("this build has no native decoder; rebuild with `--features native`")
}

fn replay(args: ReplayArgs) -> Result<()> {
    let bytes = fs::read(&args.file).with_context(|| format!("failed to read {}", args.file.display()))?;
    let listener = TcpListener::bind(&args.listen).with_context(|| format!("failed to bind {}", args.listen))?;
    tracing::info!(listen = %args.listen, bytes = bytes.len(), "waiting for a receiver");

    let (mut socket, peer) = listener.accept().context("accept failed")?;
    tracing::info!(%peer, "receiver connected");
    let pace = Duration::from_millis(args.pace_ms);
    for chunk in bytes.chunks(args.chunk.max(1)) {
        socket.write_all(chunk).context("receiver went away")?;
        if !pace.is_zero() {
            thread::sleep(pace);
        }
    }
    socket.flush().ok();
    socket.shutdown(Shutdown::Write).ok();
    tracing::info!(%peer, bytes = bytes.len(), "replay finished");
    Ok(())
}

fn synth(args: SynthArgs) -> Result<()> {
    if !args.resolution.is_valid() {
        bail!("resolution {} must be non-zero and even", args.resolution);
    }
    let width = u16::try_from(args.resolution.width).context("width does not fit the wire format")?;
    let height = u16::try_from(args.resolution.height).context("height does not fit the wire format")?;

    let mut out = BytesMut::new();
    for frame in 0..args.frames {
        for stream in 0..args.streams {
            out.extend(std::iter::repeat_n(0u8, args.noise));
            let image = ImagePayload {
                stream_id: stream,
                width,
                height,
                compressed: Bytes::from(frame.to_le_bytes().to_vec()),
            };
            out.extend_from_slice(&encode_image(&image)?);
        }
    }
    fs::write(&args.out, &out).with_context(|| format!("failed to write {}", args.out.display()))?;
    tracing::info!(
        path = %args.out.display(),
        frames = args.frames,
        streams = args.streams,
        bytes = out.len(),
        "synthetic stream written"
    );
    Ok(())
}
