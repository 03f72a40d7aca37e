use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use parlance::pipeline::SourceFactory;
use parlance::voice::{
    AudioCapture, AudioOutput, AudioPlayback, AudioSource, SovitsClient, SpeechSynthesizer,
    WhisperClient, frame_bytes, vad,
};
use parlance::{
    Config, ConversationOrchestrator, GenerationEvent, KeywordMemory, MemoryStore, OllamaClient,
    PipelineEvent, VoicePipeline,
};

/// Parlance - talk to a local language model
#[derive(Parser)]
#[command(name = "parlance", version, about)]
struct Cli {
    /// Character card (JSON) to play
    #[arg(short, long, env = "PARLANCE_CHARACTER")]
    character: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Chat by typing; replies are spoken unless muted
    Chat {
        /// Print replies without speaking them
        #[arg(long)]
        mute: bool,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,parlance=info",
        1 => "info,parlance=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let load = || Config::load_with_options(cli.character.clone());

    match cli.command {
        Some(Command::TestMic { duration }) => test_mic(duration).await,
        Some(Command::TestSpeaker) => test_speaker().await,
        Some(Command::TestTts { text }) => test_tts(&load()?, &text).await,
        Some(Command::Chat { mute }) => chat(&load()?, mute).await,
        None => voice_loop(&load()?).await,
    }
}

fn build_orchestrator(config: &Config) -> anyhow::Result<Arc<ConversationOrchestrator>> {
    let generator = Arc::new(OllamaClient::new(
        &config.llm.base_url,
        config.llm.connect_timeout,
    )?);
    let memory = config
        .memory
        .enabled
        .then(|| Arc::new(KeywordMemory::new()) as Arc<dyn MemoryStore>);

    tracing::debug!(
        llm = %config.llm.base_url,
        model = %config.llm.model,
        memory = config.memory.enabled,
        "conversation backend configured"
    );
    Ok(Arc::new(ConversationOrchestrator::new(
        generator,
        memory,
        config.orchestrator(),
    )))
}

fn build_pipeline(config: &Config) -> anyhow::Result<VoicePipeline> {
    let recognizer = Arc::new(WhisperClient::new(
        &config.stt.base_url,
        config.stt.model.clone(),
        config.stt.api_key.clone(),
        config.stt.timeout,
    )?);
    let synthesizer = Arc::new(SovitsClient::new(
        &config.tts.base_url,
        config.tts.voice.clone(),
        config.tts.timeout,
    )?);

    Ok(VoicePipeline::new(
        build_orchestrator(config)?,
        recognizer,
        synthesizer,
        config.pipeline(),
    ))
}

/// Full microphone-to-speaker loop until Ctrl-C
async fn voice_loop(config: &Config) -> anyhow::Result<()> {
    let pipeline = build_pipeline(config)?;
    let output = AudioPlayback::new()?;
    let source: SourceFactory =
        Box::new(|| Ok(Box::new(AudioCapture::new()) as Box<dyn AudioSource>));

    let printer = tokio::spawn(print_events(pipeline.subscribe()));
    pipeline.start(Box::new(output), Some(source)).await?;

    let name = config
        .character
        .as_ref()
        .map_or("parlance", |c| c.name.as_str());
    tracing::info!("{name} is listening - press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    pipeline.stop().await;
    printer.abort();
    Ok(())
}

/// Typed conversation
async fn chat(config: &Config, mute: bool) -> anyhow::Result<()> {
    if mute {
        return chat_text_only(config).await;
    }

    let pipeline = build_pipeline(config)?;
    let printer = tokio::spawn(print_events(pipeline.subscribe()));
    pipeline.start(Box::new(AudioPlayback::new()?), None).await?;

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => pipeline.submit_text(&line).await?,
                None => break,
            },
        }
    }

    // Let the last reply finish before tearing down
    while pipeline.is_speaking() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    pipeline.stop().await;
    printer.abort();
    Ok(())
}

async fn chat_text_only(config: &Config) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(config)?;
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let mut events = orchestrator.submit(&line)?;
        while let Some(event) = events.recv().await {
            match event {
                GenerationEvent::Token(token) => {
                    print!("{token}");
                    std::io::stdout().flush()?;
                }
                GenerationEvent::Complete(_) => println!(),
                GenerationEvent::Error(e) => eprintln!("\n[error] {e}"),
            }
        }
    }
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<PipelineEvent>) {
    loop {
        match events.recv().await {
            Ok(PipelineEvent::Transcript(transcript)) => println!("you> {}", transcript.text),
            Ok(PipelineEvent::Token(token)) => {
                print!("{token}");
                let _ = std::io::stdout().flush();
            }
            Ok(PipelineEvent::ResponseComplete(_)) => println!(),
            Ok(PipelineEvent::Interrupted) => println!(" [interrupted]"),
            Ok(PipelineEvent::Error(e)) => eprintln!("[error] {e}"),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "event printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let frames = tokio::task::spawn_blocking(move || -> parlance::Result<Vec<f32>> {
        let mut capture = AudioCapture::new();
        capture.start()?;

        let frame_len = frame_bytes(1000);
        let mut levels = Vec::new();
        for _ in 0..duration {
            let mut second = Vec::with_capacity(frame_len);
            while second.len() < frame_len {
                let bytes = capture.read(frame_len - second.len());
                if bytes.is_empty() {
                    break;
                }
                second.extend_from_slice(&bytes);
            }
            let level = vad::normalized_energy(&second);
            print_meter(levels.len() + 1, level);
            levels.push(level);
        }

        capture.stop();
        Ok(levels)
    })
    .await??;

    let loudest = frames.iter().copied().fold(0.0_f32, f32::max);
    println!("\n---");
    println!("Loudest second: {loudest:.4} (speech threshold {:.2})", vad::DEFAULT_ACTIVATION_THRESHOLD);
    println!("If the level stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

fn print_meter(second: usize, level: f32) {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let meter_len = (level * 100.0).min(50.0) as usize;
    let meter = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);
    println!("[{second:2}s] level: {level:.4} | [{meter}]");
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect();

    println!("Playing {} samples at {} Hz...", samples.len(), sample_rate);
    tokio::task::spawn_blocking(move || {
        AudioPlayback::new().and_then(|mut playback| playback.play_samples(&samples, sample_rate))
    })
    .await??;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Try: pavucontrol (to check levels)");

    Ok(())
}

/// Synthesize and play one sentence
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Synthesizing via {}...", config.tts.base_url);

    let synthesizer = SovitsClient::new(
        &config.tts.base_url,
        config.tts.voice.clone(),
        config.tts.timeout,
    )?;
    let clip = synthesizer.synthesize(text).await?;
    println!("Received {} bytes, playing...", clip.len());

    tokio::task::spawn_blocking(move || AudioPlayback::new().and_then(|mut p| p.play(&clip)))
        .await??;

    println!("Done!");
    Ok(())
}
