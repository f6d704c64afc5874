//! Multi-camera batch recorder: captures hardware-triggered frames from all
//! configured cameras and saves one video file per camera per batch.
//!
//! A batch is a contiguous burst of trigger activity; a gap longer than the
//! configured interval closes the current batch and the next frame opens a
//! new one. Files land under `<output>/<date>/cameras/<batch>/<camera>.mp4`.
//!
//! Usage:
//!   recorder [options]
//!
//! Options:
//!   --config <file>         Load config JSON
//!   --output-dir <dir>      Output directory (overrides config)
//!   --duration <seconds>    Stop after N seconds (default: Ctrl+C)
//!   --synthetic <n>         Record from N synthetic test cameras
//!   --list                  List detected cameras and exit
//!   --help                  Show this help

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;

use camrig::config::RecorderConfig;
use camrig::orchestrator::{Orchestrator, SessionReport};
use camrig::sink::{FfmpegSinkFactory, PixelLayout, SinkFactory, SinkSpec};
use camrig::source::{FrameSource, SyntheticSource};

struct Args {
    config_path: Option<String>,
    output_dir: Option<String>,
    duration_secs: Option<u64>,
    synthetic: Option<usize>,
    list: bool,
}

fn print_usage() {
    println!("Camera Batch Recorder: saves one video per camera per trigger batch");
    println!();
    println!("Usage: recorder [options]");
    println!();
    println!("Options:");
    println!("  --config <file>         Load config JSON");
    println!("  --output-dir <dir>      Output directory (overrides config)");
    println!("  --duration <seconds>    Stop after N seconds (default: Ctrl+C)");
    println!("  --synthetic <n>         Record from N synthetic test cameras");
    println!("  --list                  List detected cameras and exit");
    println!();
    println!("Examples:");
    println!("  recorder --config rig.json");
    println!("  recorder --config rig.json --output-dir /mnt/data --duration 600");
    println!("  recorder --synthetic 3 --duration 10");
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config_path: None,
        output_dir: None,
        duration_secs: None,
        synthetic: None,
        list: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                parsed.config_path = Some(args[i + 1].clone());
                i += 2;
            }
            "--output-dir" if i + 1 < args.len() => {
                parsed.output_dir = Some(args[i + 1].clone());
                i += 2;
            }
            "--duration" if i + 1 < args.len() => {
                parsed.duration_secs = args[i + 1].parse().ok();
                i += 2;
            }
            "--synthetic" if i + 1 < args.len() => {
                parsed.synthetic = args[i + 1].parse().ok();
                i += 2;
            }
            "--list" => {
                parsed.list = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }
    parsed
}

fn synthetic_sources(n: usize, config: &RecorderConfig) -> Vec<(String, Box<dyn FrameSource>)> {
    (0..n)
        .map(|i| {
            let name = format!("cam{i}");
            let source = SyntheticSource::new(
                &name,
                config.frame_width,
                config.frame_height,
                config.video_fps,
            )
            .with_cycle(
                std::time::Duration::from_secs(2),
                2 * config.min_batch_interval(),
            );
            (name, Box::new(source) as Box<dyn FrameSource>)
        })
        .collect()
}

#[cfg(feature = "camera")]
fn hardware_sources(config: &RecorderConfig) -> Result<Vec<(String, Box<dyn FrameSource>)>> {
    use camrig::source::v4l2::{list_cameras, V4l2Source};

    let detected = list_cameras()?;
    let mut sources: Vec<(String, Box<dyn FrameSource>)> = Vec::new();
    for cam in &config.cameras {
        let info = detected.iter().find(|d| {
            d.path.to_string_lossy().ends_with(&cam.serial) || d.card.contains(&cam.serial)
        });
        let Some(info) = info else {
            bail!("camera {} ({}) not found", cam.name, cam.serial);
        };
        let mut source = V4l2Source::open(
            &cam.name,
            &info.path,
            config.frame_width,
            config.frame_height,
        )?;
        source.configure(&cam.params)?;
        tracing::info!("[{}] Opened {} ({})", cam.name, info.path.display(), info.card);
        sources.push((cam.name.clone(), Box::new(source)));
    }
    Ok(sources)
}

#[cfg(feature = "camera")]
fn list_and_exit() -> Result<()> {
    let detected = camrig::source::v4l2::list_cameras()?;
    if detected.is_empty() {
        println!("No capture devices found");
    }
    for cam in &detected {
        println!("{}  {}", cam.path.display(), cam.card);
    }
    std::process::exit(0)
}

fn print_report(report: &SessionReport) {
    println!();
    println!("========================================");
    println!("Recording complete");
    println!("========================================");
    for (batch, lines) in &report.batches {
        println!("Batch {}", batch);
        for line in lines {
            println!(
                "  {}: {} accepted, {} written ({} dropped)",
                line.camera, line.accepted, line.written, line.dropped
            );
        }
    }
    println!("Frames written: {}", report.frames_written);
    if report.frames_dropped > 0 {
        println!("Frames dropped: {}", report.frames_dropped);
    }
    for camera in &report.failed_cameras {
        println!("Camera failed:  {}", camera);
    }
    if let Some(gb) = report.free_space_gb {
        println!("Disk free:      {:.1} GB", gb);
    }
    println!("========================================");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("camrig=info".parse()?)
                .add_directive("recorder=info".parse()?)
                .add_directive("warn".parse()?),
        )
        .init();

    let args = parse_args();

    #[cfg(feature = "camera")]
    if args.list {
        return list_and_exit();
    }
    #[cfg(not(feature = "camera"))]
    if args.list {
        bail!("built without the camera feature; only --synthetic sources are available");
    }

    let mut config = match &args.config_path {
        Some(path) => RecorderConfig::load(std::path::Path::new(path))?,
        None => RecorderConfig::default(),
    };
    if let Some(dir) = &args.output_dir {
        config.output_dir = PathBuf::from(dir);
    }

    let sources = if let Some(n) = args.synthetic {
        synthetic_sources(n, &config)
    } else {
        #[cfg(feature = "camera")]
        {
            if config.cameras.is_empty() {
                bail!("no cameras configured; pass --config or --synthetic <n>");
            }
            hardware_sources(&config)?
        }
        #[cfg(not(feature = "camera"))]
        {
            bail!("built without the camera feature; pass --synthetic <n>")
        }
    };

    println!();
    println!("========================================");
    println!("Camera Batch Recorder");
    println!("========================================");
    for (name, _) in &sources {
        println!("Camera:     {}", name);
    }
    println!("Output dir: {}", config.output_dir.display());
    println!("Batch gap:  {:.1}s", config.min_batch_interval_secs);
    println!("Video:      {}x{} @ {} fps", config.frame_width, config.frame_height, config.video_fps);
    if let Some(d) = args.duration_secs {
        println!("Duration:   {}s", d);
    } else {
        println!("Duration:   until Ctrl+C");
    }
    println!("========================================");
    println!();

    let factory = Arc::new(FfmpegSinkFactory::new(
        config.output_dir.clone(),
        config.category.clone(),
        SinkSpec {
            width: config.frame_width,
            height: config.frame_height,
            fps: config.video_fps,
            pixel: PixelLayout::Gray8,
        },
    ));

    let orchestrator = Orchestrator::new(&config, sources, factory as Arc<dyn SinkFactory>);
    let cancel = orchestrator.cancel_token();

    // First Ctrl+C stops acquisition; further presses are ignored so an
    // impatient operator cannot cut the save drain short.
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Ctrl+C received, stopping...");
        cancel_clone.cancel();
        loop {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Still saving the remaining frames, please wait...");
        }
    });

    if let Some(secs) = args.duration_secs {
        let cancel_clone: CancellationToken = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
            tracing::info!("Duration reached ({}s), stopping...", secs);
            cancel_clone.cancel();
        });
    }

    let report = tokio::task::spawn_blocking(move || orchestrator.run()).await??;
    print_report(&report);

    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}
