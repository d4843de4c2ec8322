//! Terminal spectrum meter.
//!
//! Renders live bars from system audio (default) or from a wav file:
//!
//! ```text
//! sonoscope [--bars N] [--seconds S] [--wav FILE] [--list-devices]
//! ```

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sonoscope_core::capture::backend::{BackendFactory, CaptureBackend};
use sonoscope_core::capture::feed::WavFeedBackend;
use sonoscope_core::capture::CaptureConfig;
use sonoscope_core::{ServiceRef, Sonoscope};

const GLYPHS: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

#[derive(Debug)]
struct Args {
    bars: usize,
    seconds: u64,
    wav: Option<PathBuf>,
    list_devices: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        bars: 64,
        seconds: 0,
        wav: None,
        list_devices: false,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--bars" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --bars".into());
                };
                args.bars = v.parse().map_err(|_| format!("invalid --bars: {v}"))?;
            }
            "--seconds" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --seconds".into());
                };
                args.seconds = v.parse().map_err(|_| format!("invalid --seconds: {v}"))?;
            }
            "--wav" => {
                let Some(v) = it.next() else {
                    return Err("missing value for --wav".into());
                };
                args.wav = Some(PathBuf::from(v));
            }
            "--list-devices" => args.list_devices = true,
            "--help" | "-h" => {
                println!("usage: sonoscope [--bars N] [--seconds S] [--wav FILE] [--list-devices]");
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("sonoscope: {e}");
            std::process::exit(2);
        }
    };

    if let Err(e) = run(args) {
        eprintln!("sonoscope: {e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    if args.list_devices {
        return list_devices();
    }

    let factory: BackendFactory = if let Some(path) = args.wav.clone() {
        Arc::new(move || {
            Ok(Box::new(WavFeedBackend::new(path.clone()).looping(true))
                as Box<dyn CaptureBackend>)
        })
    } else {
        live_factory()?
    };

    let engine = Sonoscope::new(factory, CaptureConfig::default(), args.bars)?;
    let hold = ServiceRef::acquire(&engine.spectrum_service())?;
    let mut frames = engine.spectrum().subscribe();

    let deadline = (args.seconds > 0).then(|| Instant::now() + Duration::from_secs(args.seconds));
    let mut stdout = std::io::stdout().lock();

    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        match frames.blocking_recv() {
            Ok(frame) => {
                let meter: String = frame
                    .bars
                    .iter()
                    .map(|&v| GLYPHS[((v * 7.999) as usize).min(7)])
                    .collect();
                write!(stdout, "\r{meter}")?;
                stdout.flush()?;
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
    writeln!(stdout)?;

    drop(hold);
    engine.shutdown();
    Ok(())
}

#[cfg(feature = "audio-cpal")]
fn live_factory() -> anyhow::Result<BackendFactory> {
    use sonoscope_core::capture::backend::CpalBackend;
    Ok(Arc::new(|| {
        Ok(Box::new(CpalBackend::new()) as Box<dyn CaptureBackend>)
    }))
}

#[cfg(not(feature = "audio-cpal"))]
fn live_factory() -> anyhow::Result<BackendFactory> {
    anyhow::bail!("built without the audio-cpal feature; pass --wav FILE instead")
}

#[cfg(feature = "audio-cpal")]
fn list_devices() -> anyhow::Result<()> {
    for device in sonoscope_core::capture::device::list_capture_devices() {
        let mut notes = Vec::new();
        if device.is_preferred {
            notes.push("preferred");
        }
        if device.is_loopback_like {
            notes.push("loopback");
        }
        if device.is_default {
            notes.push("default");
        }
        if notes.is_empty() {
            println!("{}", device.name);
        } else {
            println!("{} [{}]", device.name, notes.join(", "));
        }
    }
    Ok(())
}

#[cfg(not(feature = "audio-cpal"))]
fn list_devices() -> anyhow::Result<()> {
    anyhow::bail!("built without the audio-cpal feature; no devices to list")
}
