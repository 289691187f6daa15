//! Headless observer for the playback daemon's sync socket.
//!
//! Prints one now-playing line per tick, optionally sending a seek or a
//! volume change first.  Exits when the daemon closes the connection.
use anyhow::Context;
use clap::Parser;
use playback_proto::observer::{Applied, ObserverView};
use playback_proto::protocol::{Frame, Message, ObserverMessage, SyncBroadcast};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "playback-watch")]
#[command(about = "Follow the playback daemon's now-playing state")]
#[command(version)]
struct Args {
    /// Sync socket address of the daemon
    #[arg(short, long, default_value_t = playback_proto::platform::sync_address())]
    address: String,

    /// Seek to this position (seconds) once connected
    #[arg(long)]
    seek: Option<f64>,

    /// Set the volume (0-100) once connected
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=100))]
    volume: Option<u8>,

    /// Seconds between printed lines
    #[arg(short, long, default_value = "1")]
    interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn,playback_watch=info")),
        )
        .init();

    let args = Args::parse();
    let mut view = ObserverView::new();
    let mut requests = initial_requests(&args);

    let stream = TcpStream::connect(&args.address)
        .await
        .with_context(|| format!("connecting to {}", args.address))?;
    info!("Connected to {}", args.address);

    let result = watch(stream, &mut view, &mut requests, &args).await;
    if let Err(e) = &result {
        warn!("Connection lost: {}", e);
    }
    result
}

#[derive(Debug, Clone, Copy)]
enum Request {
    Seek(f64),
    Volume(u8),
}

fn initial_requests(args: &Args) -> Vec<Request> {
    let mut requests = Vec::new();
    if let Some(position) = args.seek {
        requests.push(Request::Seek(position));
    }
    if let Some(percent) = args.volume {
        requests.push(Request::Volume(percent));
    }
    requests
}

/// Runs until the connection drops (`Err`) or the user interrupts (`Ok`).
async fn watch(
    stream: TcpStream,
    view: &mut ObserverView,
    requests: &mut Vec<Request>,
    args: &Args,
) -> anyhow::Result<()> {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    let ready = view.on_connected();
    write_half.write_all(&Message::Observer(ready).encode()?).await?;

    let mut tick = tokio::time::interval(Duration::from_secs(args.interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = tick.tick() => {
                println!("{}", now_playing_line(view, Instant::now()));
            }
            result = read_half.read(&mut tmp) => {
                let n = result?;
                if n == 0 {
                    anyhow::bail!("daemon closed the connection");
                }
                read_buf.extend_from_slice(&tmp[..n]);

                for out in process_frames(&mut read_buf, view, requests)? {
                    write_half.write_all(&Message::Observer(out).encode()?).await?;
                }
            }
        }
    }
}

/// Applies every complete frame in `read_buf` and returns what to send back.
fn process_frames(
    read_buf: &mut Vec<u8>,
    view: &mut ObserverView,
    requests: &mut Vec<Request>,
) -> anyhow::Result<Vec<ObserverMessage>> {
    let mut outgoing = Vec::new();
    while let Some(frame) = Frame::next(read_buf)? {
        let msg = match frame {
            Frame::Message(Message::Broadcast(msg)) => msg,
            Frame::Message(Message::Observer(_)) => continue,
            Frame::Unreadable(e) => {
                debug!("Skipping unreadable frame: {}", e);
                continue;
            }
        };

        match view.apply(&msg, Instant::now()) {
            Applied::ResyncNeeded => {
                debug!("Missed an update, asking for a snapshot");
                outgoing.push(view.on_connected());
            }
            Applied::Notice(message) => {
                if matches!(msg, SyncBroadcast::Error { .. }) {
                    warn!("{}", message);
                } else {
                    debug!("{}", message);
                }
            }
            Applied::State | Applied::Idle => {
                // Requests wait for the first snapshot so the seek target can
                // be clamped to the track
                for request in requests.drain(..) {
                    outgoing.push(send_request(view, request));
                }
            }
            Applied::Stale | Applied::Heartbeat => {}
        }
    }
    Ok(outgoing)
}

fn send_request(view: &mut ObserverView, request: Request) -> ObserverMessage {
    let now = Instant::now();
    match request {
        Request::Seek(position) => view.request_seek(position, now),
        Request::Volume(percent) => view.request_volume(percent, now),
    }
}

fn now_playing_line(view: &ObserverView, now: Instant) -> String {
    let Some(state) = view.state() else {
        return match view.last_version() {
            Some(v) => format!("[v{}] idle", v),
            None => "waiting for daemon".to_string(),
        };
    };

    let position = view.display_position(now).unwrap_or_default();
    let duration = state
        .duration_seconds
        .map(format_time)
        .unwrap_or_else(|| "--:--".to_string());
    let volume = view
        .display_volume()
        .map(|v| format!("{}%", v))
        .unwrap_or_else(|| "-".to_string());

    format!(
        "[v{}] {} | {} - {} ({}) {}/{} vol {} [{:?}]",
        view.last_version().unwrap_or_default(),
        state.zone_name,
        state.artist,
        state.track_title,
        state.album,
        format_time(position),
        duration,
        volume,
        state.transport_state,
    )
}

fn format_time(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{}:{:02}", total / 60, total % 60)
}
