use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use env_logger::Env;
use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut};
use kpt_core::{init_thread_pool, Region};
use kpt_track::synthetic::{DltPoseSolver, SceneBootstrap, SceneMatcher, SyntheticScene};
use kpt_track::{init_channel, Frame, FrameOutput, FrameSlot, TrackerConfig};
use log::{info, warn};

/// Track a spinning textured cube through a synthetic frame sequence
#[derive(Parser, Debug)]
#[command(name = "kpt", version, about)]
struct Cli {
    /// Session configuration (.json or .toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of frames to generate
    #[arg(long, default_value_t = 120)]
    frames: u64,

    /// Probability that a tracked point is lost in a frame
    #[arg(long, default_value_t = 0.05)]
    dropout: f64,

    /// Probability that a tracked point is reported far off
    #[arg(long, default_value_t = 0.02)]
    outliers: f64,

    /// Observation noise amplitude in pixels
    #[arg(long, default_value_t = 0.3)]
    noise: f32,

    /// Seed for the matcher and the pose solver
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Frame rate of the synthetic camera
    #[arg(long, default_value_t = 60)]
    fps: u32,

    /// Write annotated frames as PNG into this directory
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Annotate every Nth frame
    #[arg(long, default_value_t = 10)]
    render_every: u64,

    /// Initial object box as x,y,w,h in pixels (default: fitted around the cube)
    #[arg(long = "box", value_name = "X,Y,W,H", value_parser = parse_box)]
    init_box: Option<Region>,

    /// Write the effective configuration to FILE (.json or .toml) and exit
    #[arg(long, value_name = "FILE")]
    save_config: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let scene = Arc::new(SyntheticScene::cube(6));
    let config = match &cli.config {
        Some(path) => TrackerConfig::load(path)?,
        None => TrackerConfig::new(*scene.camera(), scene.width(), scene.height())
            .with_metadata("Synthetic cube", "Textured cube spinning about the optical axis"),
    };

    if let Some(path) = &cli.save_config {
        config.save(path)?;
        println!("Saved configuration to {}", path.display());
        return Ok(());
    }

    info!("{}", config.summary());
    init_thread_pool(config.params.n_threads)?;

    let matcher = SceneMatcher::new(Arc::clone(&scene), cli.seed)
        .with_noise(cli.noise)
        .with_dropout(cli.dropout)
        .with_outliers(cli.outliers);
    let solver = DltPoseSolver {
        seed: cli.seed,
        ..DltPoseSolver::default()
    };
    let bootstrap = SceneBootstrap::new(Arc::clone(&scene));
    let mut session = config.to_builder().build(matcher, solver, bootstrap)?;

    if let Some(dir) = &cli.output_dir {
        std::fs::create_dir_all(dir)?;
    }

    let init_region = cli.init_box.unwrap_or_else(|| scene.region_at(0, 8.0));
    info!(
        "initial box ({:.0}, {:.0}) {:.0}x{:.0}",
        init_region.x, init_region.y, init_region.width, init_region.height
    );

    let frames = Arc::new(FrameSlot::new());
    let (requester, init_signal) = init_channel();
    let producer = {
        let frames = Arc::clone(&frames);
        let scene = Arc::clone(&scene);
        let count = cli.frames;
        let period = Duration::from_secs_f64(1.0 / cli.fps.max(1) as f64);
        thread::spawn(move || {
            for index in 0..count {
                frames.publish(scene.render(index));
                if index == 0 {
                    requester.request(init_region);
                }
                thread::sleep(period);
            }
            frames.close();
        })
    };

    let t0 = Instant::now();
    let render_every = cli.render_every.max(1);
    let summary = session.run(&frames, &init_signal, |frame, output| {
        let Some(dir) = &cli.output_dir else {
            return;
        };
        if output.frame_index % render_every != 0 {
            return;
        }
        let path = dir.join(format!("frame_{:05}.png", output.frame_index));
        if let Err(e) = draw_output(frame, output).save(&path) {
            warn!("could not write {}: {}", path.display(), e);
        }
    })?;
    let elapsed = t0.elapsed();
    producer.join().map_err(|_| "frame producer panicked")?;

    println!("Time taken: {:.2?}", elapsed);
    if summary.frames > 0 {
        println!("Mean time per frame: {:.2?}", elapsed / summary.frames as u32);
    }
    println!(
        "Frames processed: {} ({} dropped, {} rejected)",
        summary.frames, summary.dropped_frames, summary.rejected_reports
    );
    println!("Tracking: {}, lost: {}", summary.tracking_frames, summary.lost_frames);
    println!("Initializations: {}, solver failures: {}", summary.initializations, summary.solver_failures);
    println!("Mean active set: {:.1}", summary.mean_active());
    println!("Final state: {:?}", session.state());
    Ok(())
}

fn parse_box(s: &str) -> Result<Region, String> {
    let values = s
        .split(',')
        .map(|v| v.trim().parse::<f32>().map_err(|e| format!("invalid number '{}': {}", v, e)))
        .collect::<Result<Vec<_>, _>>()?;
    let [x, y, w, h] = values[..] else {
        return Err(format!("expected x,y,w,h but got {} values", values.len()));
    };
    let region = Region::new(x, y, w, h);
    if region.is_empty() {
        return Err("box width and height must be positive".to_string());
    }
    Ok(region)
}

/// Frame with vote lines (blue), bounding box (green) and centroid (red)
fn draw_output(frame: &Frame, output: &FrameOutput) -> RgbImage {
    let gray = GrayImage::from_raw(frame.width, frame.height, frame.pixels.clone())
        .unwrap_or_else(|| GrayImage::new(frame.width, frame.height));
    let mut img = DynamicImage::ImageLuma8(gray).into_rgb8();

    for (start, end) in &output.vote_vectors {
        draw_line_segment_mut(&mut img, (start.x, start.y), (end.x, end.y), Rgb([0, 160, 255]));
    }
    if let Some(bbox) = &output.bounding_box {
        for i in 0..4 {
            let (a, b) = (bbox[i], bbox[(i + 1) % 4]);
            draw_line_segment_mut(&mut img, (a.x, a.y), (b.x, b.y), Rgb([0, 255, 0]));
        }
    }
    if let Some(c) = output.centroid {
        draw_filled_circle_mut(&mut img, (c.x.round() as i32, c.y.round() as i32), 4, Rgb([255, 0, 0]));
    }
    img
}
