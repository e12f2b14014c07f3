use std::fs;
use std::path::Path;

use colored::Colorize;
use log::{Level, LevelFilter};

/// Console + file logging for one simulator process.
///
/// The console stream is meant for an operator watching devices come up, so
/// it is terse, colored and widened by `verbosity`. The file stream lands in
/// `<dir>/nds-<date>.log` at a fixed Debug level so a quiet console never
/// costs the post-mortem record. Per-frame trace chatter stays off the file;
/// it is only reachable on the console at the highest verbosity.
pub fn init_logger(dir: impl AsRef<Path>, verbosity: u8) -> Result<(), fern::InitError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let file_path = dir.join(format!("nds-{}.log", chrono::Utc::now().format("%Y%m%d")));

    let console_level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let console = fern::Dispatch::new()
        .format(|out, message, record| {
            let level = match record.level() {
                Level::Error => "ERROR".red().bold(),
                Level::Warn => " WARN".yellow(),
                Level::Info => " INFO".green(),
                Level::Debug => "DEBUG".blue(),
                Level::Trace => "TRACE".dimmed(),
            };
            out.finish(format_args!(
                "{} {level} {} {message}",
                chrono::Utc::now().format("%H:%M:%S%.3f"),
                record.target().dimmed(),
            ))
        })
        .level(console_level)
        .chain(std::io::stdout());

    let file = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{:<5}] {}: {message}",
                chrono::Utc::now().to_rfc3339(),
                record.level(),
                record.target(),
            ))
        })
        .level(LevelFilter::Debug)
        .chain(fern::log_file(file_path)?);

    fern::Dispatch::new().chain(console).chain(file).apply()?;
    Ok(())
}
