use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const LOG_PREFIX: &str = "server_collector";

fn level_filter(log_level: &str) -> log::LevelFilter {
    match log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    }
}

/// Installs the global logger: stdout plus a fresh timestamped file in `log_dir`.
pub fn setup_logging(log_dir: &Path, log_level: &str) -> Result<PathBuf> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    // Keep only the most recent previous run next to the new file
    cleanup_old_logs(log_dir)?;

    let log_file_name = format!(
        "{}_{}.log",
        LOG_PREFIX,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = log_dir.join(log_file_name);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level_filter(log_level))
        // Connection pools are chatty at debug
        .level_for("tokio_postgres", log::LevelFilter::Info)
        .level_for("reqwest", log::LevelFilter::Info)
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_path)?)
        .apply()?;

    Ok(log_path)
}

fn cleanup_old_logs(log_dir: &Path) -> Result<()> {
    let mut entries: Vec<(PathBuf, SystemTime)> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"))
        .map(|e| {
            let modified = e
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (e.path(), modified)
        })
        .collect();

    // Newest first
    entries.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in entries.iter().skip(1) {
        if let Err(e) = fs::remove_file(path) {
            eprintln!("Failed to delete old log file {:?}: {}", path, e);
        }
    }

    Ok(())
}
