use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use rtsp_media::pipeline::State;
use rtsp_media::pipeline::sim::{Preroll, SimBin, SimFactory, SimPipeline};
use rtsp_media::{
    ClientState, Graph, Media, MediaConfig, MediaStatus, PortRangePool, StreamTransport,
    ThreadLimit, ThreadPool, ThreadType, TimeRange, Transport,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "rtsp-media",
    about = "Drive a simulated media through prepare, play, seek and unprepare"
)]
struct Args {
    /// Client thread ceiling (0 = inline, negative = unlimited)
    #[arg(long, default_value_t = 1, allow_negative_numbers = true)]
    max_threads: i32,

    /// Number of static payloaders (pay0, pay1, ...)
    #[arg(long, default_value_t = 2)]
    streams: usize,

    /// Number of dynamic producers (dynpay0, ...), each exposing one pad
    #[arg(long, default_value_t = 0)]
    dynamic: usize,

    /// Number of clients that play and then pause
    #[arg(long, default_value_t = 2)]
    clients: usize,

    /// Simulate a live source that can not preroll
    #[arg(long)]
    live: bool,

    /// Prepare the media a second time after unpreparing it
    #[arg(long)]
    reusable: bool,

    /// Shut down by sending end-of-stream first
    #[arg(long)]
    eos_shutdown: bool,

    /// Give up preparing after this many seconds
    #[arg(long, default_value_t = 20)]
    prepare_timeout_secs: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> rtsp_media::Result<()> {
    let pool = ThreadPool::with_limit(ThreadLimit::from(args.max_threads));

    let preroll = if args.live {
        Preroll::Live
    } else {
        Preroll::Async(Duration::from_millis(50))
    };
    let bin = SimBin::with_payloaders("media", args.streams, args.dynamic);
    let pipeline = SimPipeline::new(preroll);
    let graph = Graph::new(bin.clone(), pipeline.clone(), SimFactory::new());

    let config = MediaConfig {
        reusable: args.reusable,
        eos_shutdown: args.eos_shutdown,
        prepare_timeout: Duration::from_secs(args.prepare_timeout_secs),
        ..MediaConfig::default()
    };
    let media = Media::with_config(graph, pool.clone(), config);
    media.set_address_pool(Some(Arc::new(PortRangePool::new())));
    media.subscribe(|event| tracing::info!(event = event.name(), "media event"));

    let rounds = if args.reusable { 2 } else { 1 };
    for round in 0..rounds {
        tracing::info!(round, "preparing");
        let producers: Vec<String> = (0..args.dynamic).map(|i| format!("dynpay{i}")).collect();
        let emitter = std::thread::spawn({
            let bin = bin.clone();
            move || {
                for name in &producers {
                    let Some(element) = bin.child(name) else {
                        continue;
                    };
                    // Wait for prepare to connect pad-added and no-more-pads.
                    let deadline = Instant::now() + Duration::from_secs(2);
                    while element.handler_count() < 2 && Instant::now() < deadline {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    element.emit_pad_added("src_0");
                    element.emit_no_more_pads();
                }
            }
        });

        media.prepare()?;
        let _ = emitter.join();

        println!(
            "prepared: {} streams, live={}, seekable={}, range={}",
            media.n_streams(),
            media.is_live(),
            media.is_seekable(),
            media.range_string(true)?
        );

        let transports = connect_clients(&pool, &media, args.clients)?;
        media.set_state(State::Playing, &transports)?;
        println!(
            "playing: {} active, range={}",
            media.n_active(),
            media.range_string(false)?
        );

        if media.is_seekable() {
            media.seek(&"npt=5-".parse::<TimeRange>()?)?;
            println!("seeked: range={}", media.range_string(true)?);
        }

        media.set_state(State::Paused, &transports)?;
        println!("paused: {} active", media.n_active());

        media.unprepare()?;
        // EOS shutdown finishes on the media thread.
        let deadline = Instant::now() + Duration::from_secs(2);
        while media.status_now() != MediaStatus::Unprepared && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        println!("unprepared: status={}", media.status_now());
    }

    println!("state changes requested: {:?}", pipeline.state_requests());
    Ok(())
}

/// One client thread and one transport per stream for each client.
fn connect_clients(
    pool: &ThreadPool,
    media: &Media,
    clients: usize,
) -> rtsp_media::Result<Vec<Arc<StreamTransport>>> {
    let mut transports = Vec::new();
    for client in 0..clients {
        let port = u16::try_from(8000 + 2 * client).unwrap_or(u16::MAX - 1);
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let state = ClientState {
            peer_addr: Some(peer),
            uri: Some("rtsp://127.0.0.1:8554/media".to_string()),
        };

        match pool.get_thread(ThreadType::Client, &state)? {
            Some(thread) => {
                tracing::info!(client, thread = thread.id(), "client thread");
                thread.stop();
            }
            None => tracing::info!(client, "client handled inline"),
        }

        for stream in media.streams() {
            let ports = stream.allocate_ports().unwrap_or((0, 0));
            transports.push(StreamTransport::new(stream, Transport::udp(peer, ports)));
        }
    }
    Ok(transports)
}
