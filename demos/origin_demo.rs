//! Run a loopback origin and play it
//!
//! Publishes a synthetic audio/video stream on a local origin, plays it for a
//! few seconds, toggles mute and volume, and prints every player event.
//!
//! ```text
//! RUST_LOG=rtplayer=debug cargo run -p rtplayer --example origin_demo
//! ```

use rtplayer::{ChannelEventSink, EventSink, PlayerConfig, PlayerEvent, RtPlayer};
use rtplayer_signaling::{OriginConfig, StreamOrigin, SyntheticStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let origin = StreamOrigin::bind(OriginConfig::default()).await?;
    origin.publish(
        "live/demo",
        SyntheticStream::audio_video().with_duration(Duration::from_secs(6)),
    );
    let origin = origin.spawn();
    let url = origin.play_url("live/demo");
    info!("Origin listening on {}", origin.local_addr());

    let player = RtPlayer::new(PlayerConfig {
        signal_mute_to_server: true,
        ..PlayerConfig::default()
    })?;
    let (sink, mut events) = ChannelEventSink::new();
    let sink: Arc<dyn EventSink> = sink;
    player.set_event_sink(&sink);
    player.set_statistics_interval(1);

    println!("▶️  {}", url);
    player.play(&url, false).await?;

    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let finished = matches!(event, PlayerEvent::Error { .. });
            match event {
                PlayerEvent::Statistics(stats) => println!("   📊 {}", stats.to_json().unwrap_or_default()),
                other => println!("   🔔 {:?}", other),
            }
            if finished {
                break;
            }
        }
    });

    sleep(Duration::from_secs(2)).await;
    println!("🔇 Muting video, volume to 50%");
    player.mute_video(true);
    player.set_volume(0.5);
    for session in origin.sessions() {
        println!("   origin session {} disabled {:?}", session.session_id, session.disabled_tracks);
    }

    sleep(Duration::from_secs(1)).await;
    println!("🔊 Unmuting video");
    player.mute_video(false);

    // the stream ends after six seconds and the player reports it
    let _ = timeout(Duration::from_secs(10), printer).await;
    println!("📋 {:?}", player.snapshot());

    player.stop().await;
    origin.shutdown().await;
    Ok(())
}
