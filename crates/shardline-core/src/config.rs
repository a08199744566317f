//! Pipeline runtime configuration

/// Runtime configuration shared by every stage of a pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Worker threads per stage unless the stage asks for its own count
    pub workers: usize,
    /// Escalate per-record task failures to fatal job errors
    pub debug: bool,
    /// Show progress bars when stderr is a terminal
    pub progress: bool,
}

impl PipelineConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Thread count for a stage: its own request, else the pipeline default.
    pub fn workers_for(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.workers).max(1)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            debug: false,
            progress: true,
        }
    }
}
