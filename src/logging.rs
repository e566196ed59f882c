//! Log output: daily directories under `<data_dir>/logs/<YYYY-MM-DD>/`,
//! size-based rotation inside a day, gzip of past days and removal of
//! directories older than the retention window.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::MakeWriter;

/// Maximum size of one log segment (30 MB).
const MAX_FILE_SIZE: u64 = 30 * 1024 * 1024;
const RETENTION_DAYS: i64 = 7;
const LOG_BASE_NAME: &str = "screenrecall.log";
const DATE_FORMAT: &str = "%Y-%m-%d";

struct Inner {
    logs_root: PathBuf,
    current_date: String,
    file: Option<File>,
    written_bytes: u64,
    max_file_size: u64,
}

impl Inner {
    fn today() -> String {
        chrono::Local::now().format(DATE_FORMAT).to_string()
    }

    fn dir_for_date(&self, date: &str) -> PathBuf {
        self.logs_root.join(date)
    }

    /// Open (or switch to) today's file.
    fn ensure_file(&mut self) -> io::Result<&mut File> {
        let today = Self::today();

        if self.file.is_none() || self.current_date != today {
            let dir = self.dir_for_date(&today);
            fs::create_dir_all(&dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(LOG_BASE_NAME))?;
            self.written_bytes = file.metadata().map(|m| m.len()).unwrap_or(0);
            self.file = Some(file);
            self.current_date = today;
        }

        match self.file.as_mut() {
            Some(file) => Ok(file),
            None => Err(io::Error::new(io::ErrorKind::Other, "log file not open")),
        }
    }

    /// Shift `screenrecall.log.N` to `.N+1` and start a fresh segment.
    fn rotate_if_needed(&mut self) -> io::Result<()> {
        if self.written_bytes < self.max_file_size || self.current_date.is_empty() {
            return Ok(());
        }

        self.file.take();

        let dir = self.dir_for_date(&self.current_date);
        let prefix = format!("{}.", LOG_BASE_NAME);
        let max_index = fs::read_dir(&dir)
            .map(|entries| {
                entries
                    .flatten()
                    .filter_map(|entry| {
                        entry
                            .file_name()
                            .to_string_lossy()
                            .strip_prefix(&prefix)
                            .and_then(|suffix| suffix.parse::<u32>().ok())
                    })
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);

        for i in (1..=max_index).rev() {
            let _ = fs::rename(
                dir.join(format!("{}.{}", LOG_BASE_NAME, i)),
                dir.join(format!("{}.{}", LOG_BASE_NAME, i + 1)),
            );
        }

        let current = dir.join(LOG_BASE_NAME);
        let _ = fs::rename(&current, dir.join(format!("{}.1", LOG_BASE_NAME)));

        let file = OpenOptions::new().create(true).append(true).open(&current)?;
        self.written_bytes = 0;
        self.file = Some(file);
        Ok(())
    }
}

/// Thread-safe writer rotating by date and size. Cloning shares the file.
#[derive(Clone)]
pub struct DailyRotatingWriter {
    inner: Arc<Mutex<Inner>>,
}

impl DailyRotatingWriter {
    pub fn new(logs_root: PathBuf) -> Self {
        Self::with_max_size(logs_root, MAX_FILE_SIZE)
    }

    fn with_max_size(logs_root: PathBuf, max_file_size: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                logs_root,
                current_date: String::new(),
                file: None,
                written_bytes: 0,
                max_file_size,
            })),
        }
    }
}

pub struct ArcWriter {
    inner: Arc<Mutex<Inner>>,
}

impl Write for ArcWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let _ = guard.rotate_if_needed();
        let file = guard.ensure_file()?;
        let n = file.write(buf)?;
        guard.written_bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ref mut f) = guard.file {
            f.flush()?;
        }
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for DailyRotatingWriter {
    type Writer = ArcWriter;

    fn make_writer(&'a self) -> Self::Writer {
        ArcWriter {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Install the global subscriber: a plain-text file layer plus a colored
/// stderr layer, both filtered by `RUST_LOG` (default debug in debug
/// builds, info in release). Safe to call more than once; later calls
/// only return a new writer.
pub fn init_logging(data_dir: &Path) -> DailyRotatingWriter {
    use tracing_subscriber::fmt;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::Layer;

    let logs_root = data_dir.join("logs");
    let _ = fs::create_dir_all(&logs_root);

    let writer = DailyRotatingWriter::new(logs_root);

    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };

    let env_filter_file =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let env_filter_stderr =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(writer.clone())
        .with_filter(env_filter_file);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(env_filter_stderr);

    if tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .is_err()
    {
        eprintln!("Global tracing subscriber already set; file logging disabled");
    }

    writer
}

/// Run maintenance now, then daily at 00:05 local time, until cancelled.
pub fn spawn_maintenance_task(
    data_dir: PathBuf,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let logs_root = data_dir.join("logs");
        run_maintenance(&logs_root);

        loop {
            let wait = next_maintenance_delay(chrono::Local::now());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => run_maintenance(&logs_root),
            }
        }
    })
}

fn next_maintenance_delay(now: chrono::DateTime<chrono::Local>) -> std::time::Duration {
    let target = (now.date_naive() + chrono::Duration::days(1))
        .and_hms_opt(0, 5, 0)
        .and_then(|t| t.and_local_timezone(chrono::Local).earliest());
    let secs = target
        .map(|t| (t - now).num_seconds())
        .unwrap_or(24 * 3600)
        .max(60);
    std::time::Duration::from_secs(secs as u64)
}

/// Gzip `.log`/`.log.N` files of past days; delete day directories older
/// than the retention window. Today's directory is left untouched.
pub fn run_maintenance(logs_root: &Path) {
    let today = chrono::Local::now().date_naive();
    let cutoff = today - chrono::Duration::days(RETENTION_DAYS);

    let entries = match fs::read_dir(logs_root) {
        Ok(e) => e,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let date = match chrono::NaiveDate::parse_from_str(&name, DATE_FORMAT) {
            Ok(d) => d,
            Err(_) => continue,
        };
        if date >= today {
            continue;
        }

        let dir_path = entry.path();
        if date < cutoff {
            tracing::info!("Removing old log directory: {}", name);
            let _ = fs::remove_dir_all(&dir_path);
            continue;
        }

        let files = match fs::read_dir(&dir_path) {
            Ok(f) => f,
            Err(_) => continue,
        };
        for file_entry in files.flatten() {
            let fname = file_entry.file_name().to_string_lossy().to_string();
            let is_log = fname == LOG_BASE_NAME
                || (fname.starts_with(&format!("{}.", LOG_BASE_NAME)) && !fname.ends_with(".gz"));
            if !is_log {
                continue;
            }

            let src = file_entry.path();
            let dst = dir_path.join(format!("{}.gz", fname));
            if let Err(e) = gzip_file(&src, &dst) {
                tracing::warn!("Failed to gzip {}: {}", src.display(), e);
            } else {
                let _ = fs::remove_file(&src);
            }
        }
    }
}

fn gzip_file(src: &Path, dst: &Path) -> io::Result<()> {
    let input = fs::read(src)?;
    let output_file = File::create(dst)?;
    let mut encoder = GzEncoder::new(output_file, Compression::default());
    encoder.write_all(&input)?;
    encoder.finish()?;
    Ok(())
}
