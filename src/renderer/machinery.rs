use std::{
    num::NonZeroUsize,
    sync::Arc,
    thread::{self, JoinHandle},
};

use crate::{
    renderer::{TileRenderer, worker::Worker},
    scheduler::Scheduler,
};

#[derive(Copy, Clone, Debug)]
pub enum WorkerCount {
    /// One worker per CPU core, pinned to it.
    Auto,
    Manual(NonZeroUsize),
}

/// Pool of worker threads sharing one scheduler.
pub struct WorkerPool<S> {
    scheduler: Arc<Scheduler<S>>,
    threads: Vec<JoinHandle<usize>>,
}

impl<S: Send + Sync + 'static> WorkerPool<S> {
    /// Spawns the workers, each with a renderer created by `renderer_factory` from its worker
    /// id.
    pub fn start<R, F>(
        scheduler: Arc<Scheduler<S>>,
        worker_count: WorkerCount,
        renderer_factory: F,
    ) -> anyhow::Result<Self>
    where
        R: TileRenderer<S> + 'static,
        F: Fn(usize) -> R,
    {
        let cores = match worker_count {
            WorkerCount::Auto => core_affinity::get_core_ids()
                .unwrap_or_else(|| {
                    log::warn!("can't read the CPU list, workers won't be pinned");
                    Vec::new()
                })
                .into_iter()
                .map(Some)
                .collect(),
            WorkerCount::Manual(count) => vec![None; count.get()],
        };
        let cores = if cores.is_empty() {
            vec![None; num_cpus::get()]
        } else {
            cores
        };
        log::debug!("starting {} workers", cores.len());

        let threads = cores
            .into_iter()
            .enumerate()
            .map(|(worker_id, core)| {
                let worker = Worker::new(worker_id, Arc::clone(&scheduler));
                let mut renderer = renderer_factory(worker_id);

                thread::Builder::new()
                    .name(format!("worker{worker_id}"))
                    .spawn(move || {
                        if let Some(core) = core {
                            core_affinity::set_for_current(core);
                        }
                        worker.run(&mut renderer)
                    })
            })
            .collect::<Result<Vec<_>, _>>();

        let threads = match threads {
            Ok(threads) => threads,
            Err(e) => {
                // Let the workers that did start go before bailing out
                scheduler.shutdown();
                return Err(e.into());
            }
        };

        Ok(WorkerPool { scheduler, threads })
    }
}

impl<S> WorkerPool<S> {
    pub fn worker_count(&self) -> usize {
        self.threads.len()
    }

    pub fn scheduler(&self) -> &Arc<Scheduler<S>> {
        &self.scheduler
    }

    /// Shuts the scheduler down and waits for all workers to exit.
    /// Returns the total number of tiles rendered by the pool.
    pub fn stop(&mut self) -> anyhow::Result<usize> {
        self.scheduler.shutdown();

        let mut rendered = 0;
        let mut panicked = 0;
        for handle in self.threads.drain(..) {
            match handle.join() {
                Ok(count) => rendered += count,
                Err(_) => panicked += 1,
            }
        }

        if panicked > 0 {
            anyhow::bail!("{panicked} worker threads panicked");
        }
        Ok(rendered)
    }
}

impl<S> Drop for WorkerPool<S> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("{e}");
        }
    }
}
