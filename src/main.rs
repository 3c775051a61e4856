use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;

use stream_player::playback::{SyntheticConfig, SyntheticSource};
use stream_player::sinks::{CountingSink, SnapshotSink, WavRecorder};
use stream_player::{PlaybackController, PlaybackStatus, PlayerConfig, PlayerOptions, StreamListener};

#[derive(Parser, Debug, PartialEq)]
#[command(name = "stream-player", about = "Plays a synthetic stream into counting, WAV and PNG sinks")]
struct DemoArgs {
    /// Media path handed to the source
    #[arg(default_value = "synthetic.mp4")]
    path: PathBuf,

    /// How long to play before closing
    #[arg(long, default_value_t = 2.0, value_parser = parse_seconds)]
    seconds: f64,

    /// Playback speed, negative plays backwards
    #[arg(long, allow_negative_numbers = true)]
    speed: Option<f32>,

    /// Record the audio medium to this WAV file
    #[arg(long)]
    wav: Option<PathBuf>,

    /// Save the last video image to this PNG file on close
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

fn parse_seconds(value: &str) -> Result<f64, String> {
    let seconds: f64 = value.parse().map_err(|e| format!("{}", e))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err("must be a non-negative number".to_string());
    }
    Ok(seconds)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = DemoArgs::parse();
    let config = PlayerConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config, using defaults: {}", e);
        PlayerConfig::default()
    });

    let source = Arc::new(SyntheticSource::new(SyntheticConfig::default()));
    let audio = Arc::new(CountingSink::new("audio"));
    let video = Arc::new(CountingSink::new("video"));

    let mut options = PlayerOptions::from_config(&args.path, &config)
        .with_audio_listener(audio.clone())
        .with_video_listener(video.clone());
    if let Some(path) = &args.snapshot {
        options = options.with_video_listener(Arc::new(SnapshotSink::new(path)));
    }

    let player = PlaybackController::new(source, options)?;
    let mut status_events = player.subscribe_status();

    let session = match player.wait_for_open(config.loop_join_timeout()) {
        Some(Ok(session)) => session,
        Some(Err(e)) => return Err(e.into()),
        None => anyhow::bail!("Timed out opening {}", args.path.display()),
    };
    log::info!("Session {} opened at {}", session.id, session.opened_at);

    if let (Some(path), Some(format)) = (&args.wav, &session.audio_format) {
        // Registered after open, so it gets its opened notification here
        let recorder = Arc::new(WavRecorder::new(path, format.clone())?);
        recorder.stream_opened()?;
        player.add_audio_listener(recorder);
    }

    if let Some(speed) = args.speed {
        player.set_speed(speed)?;
    }

    let started = Instant::now();
    player.play()?;
    std::thread::sleep(Duration::from_secs_f64(args.seconds));
    let clock = player.current_time();
    player.close();

    let mut transitions = 0;
    let mut stalls = 0;
    while let Ok(event) = status_events.try_recv() {
        transitions += 1;
        if event.current == PlaybackStatus::Stalled {
            stalls += 1;
        }
    }

    println!("{} ({})", session.display_name(), player.status().display_text());
    println!("  played      {:.2}s wall, {:.2}s stream clock", started.elapsed().as_secs_f64(), clock);
    for sink in [&audio, &video] {
        println!("  {:<11} {} units, {} bytes", sink.name(), sink.units(), sink.bytes());
    }
    println!("  status      {} transitions, {} stalls", transitions, stalls);
    Ok(())
}
