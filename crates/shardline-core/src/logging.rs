//! Logging setup with indicatif integration, plus the per-task log handle

use std::fmt;

use indicatif::MultiProgress;

/// ANSI color code and padded label for a log level.
fn level_style(level: log::Level, color: bool) -> (&'static str, &'static str, &'static str) {
    let label = match level {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARN ",
        log::Level::Info => "INFO ",
        log::Level::Debug => "DEBUG",
        log::Level::Trace => "TRACE",
    };
    if !color {
        return ("", label, "");
    }
    let ansi = match level {
        log::Level::Error => "\x1b[31m",
        log::Level::Warn => "\x1b[33m",
        log::Level::Info => "\x1b[32m",
        log::Level::Debug => "\x1b[36m",
        log::Level::Trace => "\x1b[35m",
    };
    (ansi, label, "\x1b[0m")
}

/// Logger that prints through `MultiProgress` so lines don't tear the bars.
pub struct IndicatifLogger {
    inner: env_logger::Logger,
    multi: MultiProgress,
}

impl IndicatifLogger {
    pub fn new(inner: env_logger::Logger, multi: MultiProgress) -> Self {
        Self { inner, multi }
    }
}

impl log::Log for IndicatifLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if self.inner.enabled(record.metadata()) {
            let (pre, label, post) = level_style(record.level(), true);
            let line = format!("[{pre}{label}{post}] {}", record.args());
            self.multi.suspend(|| eprintln!("{line}"));
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Initialize logging; `multi` selects the TTY path through indicatif.
///
/// A second call is a no-op (the first logger stays installed).
pub fn init_logging(quiet: bool, debug: bool, multi: Option<&MultiProgress>) {
    use std::io::Write;

    let default_level = if debug {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let env = env_logger::Env::default().default_filter_or(default_level);

    if let Some(multi) = multi {
        let logger = env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .build();
        let max_level = logger.filter();
        if log::set_boxed_logger(Box::new(IndicatifLogger::new(logger, multi.clone()))).is_ok() {
            log::set_max_level(max_level);
        }
    } else {
        // Non-TTY: no colors
        let _ = env_logger::Builder::from_env(env)
            .format(|buf, record| {
                let (_, label, _) = level_style(record.level(), false);
                writeln!(buf, "[{label}] {}", record.args())
            })
            .try_init();
    }
}

/// Log handle carrying the task name and, inside a worker, the job id.
///
/// Passed explicitly from the pipeline into each stage and job so every
/// line says where it came from.
#[derive(Debug, Clone)]
pub struct TaskLog {
    task: String,
    job: Option<usize>,
}

impl TaskLog {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            job: None,
        }
    }

    /// Handle for one job of this task.
    pub fn for_job(&self, job: usize) -> Self {
        Self {
            task: self.task.clone(),
            job: Some(job),
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn job(&self) -> Option<usize> {
        self.job
    }

    pub fn log(&self, level: log::Level, args: fmt::Arguments<'_>) {
        match self.job {
            Some(job) => log::log!(target: "shardline::task", level, "{} [job {job:03}] {args}", self.task),
            None => log::log!(target: "shardline::task", level, "{} {args}", self.task),
        }
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(log::Level::Error, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(log::Level::Warn, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(log::Level::Info, args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(log::Level::Debug, args);
    }
}

impl fmt::Display for TaskLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.job {
            Some(job) => write!(f, "{} [job {job:03}]", self.task),
            None => f.write_str(&self.task),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_labels_are_padded() {
        for level in [log::Level::Error, log::Level::Warn, log::Level::Info] {
            let (_, label, _) = level_style(level, false);
            assert_eq!(label.len(), 5);
        }
    }

    #[test]
    fn plain_style_has_no_ansi() {
        let (pre, _, post) = level_style(log::Level::Error, false);
        assert!(pre.is_empty() && post.is_empty());
    }

    #[test]
    fn task_log_prefix() {
        let log = TaskLog::new("joined");
        assert_eq!(log.to_string(), "joined");
        let job = log.for_job(7);
        assert_eq!(job.to_string(), "joined [job 007]");
        assert_eq!(job.job(), Some(7));
        assert_eq!(job.task(), "joined");
    }
}
