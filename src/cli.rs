use std::{path::PathBuf, sync::Arc, thread, time::Duration};

use indicatif::ProgressBar;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use tilejobs::{
    BlockRenderer, Finalizer, FinalizerSettings, Job, JobEndReason, JobKind, JobSummary, Rgba,
    Scheduler, SchedulerSettings, WorkerCount, WorkerPool,
    geometry::{ScreenPoint, ScreenSize},
};

/// Soft colored discs on a dark background.
struct Blobs {
    blobs: Vec<Blob>,
}

struct Blob {
    center: (f32, f32),
    radius: f32,
    color: Rgba,
}

impl Blobs {
    fn random(count: usize, resolution: ScreenSize, rng: &mut impl Rng) -> Self {
        let blobs = (0..count)
            .map(|_| Blob {
                center: (
                    rng.random_range(0.0..resolution.width as f32),
                    rng.random_range(0.0..resolution.height as f32),
                ),
                radius: rng.random_range(20.0..200.0),
                color: Rgba::new(rng.random(), rng.random(), rng.random(), 1.0),
            })
            .collect();
        Blobs { blobs }
    }

    fn shade(&self, point: ScreenPoint) -> Rgba {
        let mut color = Rgba::new(0.02, 0.02, 0.05, 1.0);
        for blob in &self.blobs {
            let dx = point.x as f32 - blob.center.0;
            let dy = point.y as f32 - blob.center.1;
            let weight = (-(dx * dx + dy * dy) / (blob.radius * blob.radius)).exp();
            color.r += blob.color.r * weight;
            color.g += blob.color.g * weight;
            color.b += blob.color.b * weight;
        }
        color
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let output = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("tilejobs.png"));
    let resolution = ScreenSize::new(2048, 1536);
    let settings = SchedulerSettings {
        tile_size: 64.try_into()?,
    };

    let scene = Arc::new(Blobs::random(64, resolution, &mut SmallRng::from_os_rng()));

    let scheduler = Arc::new(Scheduler::new(settings));
    let finalizer = Arc::new(Finalizer::new(FinalizerSettings::default()));
    scheduler.attach_finalizer(&finalizer);
    finalizer.start();

    let mut pool = WorkerPool::start(Arc::clone(&scheduler), WorkerCount::Auto, |_| {
        BlockRenderer::new(settings.tile_size, |scene: &Blobs, point: ScreenPoint| {
            scene.shade(point)
        })
    })?;

    let job = Job::builder()
        .scene(scene)
        .kind(JobKind::Realtime)
        .resolution(resolution)
        .passes(vec![16, 8, 4, 1])
        .path(output.clone())
        .on_end(Box::new(|summary: &JobSummary| {
            log::info!("job {} ended: {:?}", summary.id, summary.end_reason)
        }))
        .build();
    let id = scheduler.submit(job)?;

    let bar = ProgressBar::no_length();
    let summary = loop {
        if let Some(summary) = finalizer.get_summary(id) {
            break summary;
        }
        if let Some(state) = scheduler.get_job_state(id) {
            bar.update(|ps| {
                ps.set_len(state.tile_count() as u64);
                ps.set_pos((state.tile_count() - state.tiles_remaining()) as u64)
            });
        }
        thread::sleep(Duration::from_millis(50));
    };
    bar.finish();

    let rendered = pool.stop()?;
    finalizer.stop();

    anyhow::ensure!(
        summary.end_reason == JobEndReason::Completed,
        "job {id} ended with {:?}",
        summary.end_reason
    );
    if let Some(total_time) = summary.total_time() {
        println!(
            "{} tiles ({} pixels) in {:.2?}, {rendered} tiles rendered by the pool",
            summary.tiles_completed, summary.pixels_completed, total_time
        );
    }
    println!("saved to {}", output.display());

    Ok(())
}
