//! Play a stream and print what happens
//!
//! ```text
//! cargo run -p rtplayer --example basic_play -- webrtc://127.0.0.1:1985/live/stream 10
//! ```
//!
//! The second argument is how many seconds to play (default 10).

use rtplayer::{
    AudioFrame, ChannelEventSink, EventSink, PlayerConfig, PlayerEvent, RenderSurface, RtPlayer,
    VideoFrame,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Counts frames instead of drawing them
#[derive(Default)]
struct FrameCounter {
    audio: AtomicU64,
    video: AtomicU64,
}

impl RenderSurface for FrameCounter {
    fn render_video(&self, _frame: &VideoFrame) {
        self.video.fetch_add(1, Ordering::Relaxed);
    }

    fn render_audio(&self, _frame: &AudioFrame) {
        self.audio.fetch_add(1, Ordering::Relaxed);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let url = args
        .next()
        .unwrap_or_else(|| "webrtc://127.0.0.1:1985/live/stream".to_string());
    let seconds: u64 = args.next().and_then(|s| s.parse().ok()).unwrap_or(10);

    let player = RtPlayer::new(PlayerConfig::low_latency())?;
    info!("{}", player.version_info());

    let (sink, mut events) = ChannelEventSink::new();
    let sink: Arc<dyn EventSink> = sink;
    player.set_event_sink(&sink);
    player.set_statistics_interval(1);

    let surface = Arc::new(FrameCounter::default());
    player.set_render_surface(surface.clone());

    println!("▶️  Playing {} for {}s", url, seconds);
    player.play(&url, false).await?;

    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.next() => match event {
                Some(PlayerEvent::Statistics(stats)) => println!(
                    "   📊 {:.0} kbps, {} lost, {:.1} fps, {}x{}, delay {:?}",
                    stats.bitrate_kbps,
                    stats.packets_lost,
                    stats.frame_rate,
                    stats.video_width,
                    stats.video_height,
                    stats.playout_delay,
                ),
                Some(PlayerEvent::Error { kind, message }) => {
                    warn!("Playback failed ({}): {}", kind, message);
                    break;
                }
                Some(event) => println!("   🔔 {:?}", event),
                None => break,
            },
        }
    }

    player.stop().await;
    println!(
        "⏹️  Stopped: {} audio frames, {} video frames rendered",
        surface.audio.load(Ordering::Relaxed),
        surface.video.load(Ordering::Relaxed)
    );
    Ok(())
}
