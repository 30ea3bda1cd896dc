use std::{
    collections::VecDeque,
    fs,
    io::{BufRead, BufReader, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    thread,
};

const MAX_LOG_LINES: usize = 500;

pub enum LogLineEvent {
    Error,
    Warning,
    Normal,
}

pub fn classify_log_line(line: &str) -> LogLineEvent {
    let lower = line.to_lowercase();

    if lower.starts_with("error")
        || lower.contains("[error]")
        || lower.contains("panic")
        || lower.contains("failed to")
    {
        return LogLineEvent::Error;
    }

    if lower.starts_with("warn") || lower.contains("[warning]") || lower.contains("[warn]") {
        return LogLineEvent::Warning;
    }

    LogLineEvent::Normal
}

/// Ring buffer of the engine's stderr, kept so failures can quote the
/// engine's last words.
pub struct EngineLog {
    lines: VecDeque<String>,
    last_error: Option<String>,
}

impl EngineLog {
    pub fn new() -> Self {
        Self {
            lines: VecDeque::new(),
            last_error: None,
        }
    }

    pub fn push_line(&mut self, line: String) {
        match classify_log_line(&line) {
            LogLineEvent::Error => {
                log::warn!("[engine] {line}");
                self.last_error = Some(line.clone());
            }
            LogLineEvent::Warning => log::info!("[engine] {line}"),
            LogLineEvent::Normal => log::debug!("[engine] {line}"),
        }

        self.lines.push_back(line);
        if self.lines.len() > MAX_LOG_LINES {
            self.lines.pop_front();
        }
    }

    #[cfg(test)]
    fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn last_line(&self) -> Option<&str> {
        self.lines.back().map(String::as_str)
    }

    /// Most useful single line for an error report.
    pub fn summary(&self) -> Option<&str> {
        self.last_error.as_deref().or_else(|| self.last_line())
    }
}

impl Default for EngineLog {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedEngineLog = Arc<Mutex<EngineLog>>;
pub type SessionLogFile = Arc<Mutex<fs::File>>;

pub fn create_session_log_file(logs_directory: &Path) -> Option<(PathBuf, SessionLogFile)> {
    if let Err(error) = fs::create_dir_all(logs_directory) {
        log::warn!("[logs] failed to create log directory: {error}");
        return None;
    }

    let timestamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
    let log_path = logs_directory.join(format!("{timestamp}.log"));

    match fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(file) => {
            log::info!("[logs] session log: {}", log_path.display());
            Some((log_path, Arc::new(Mutex::new(file))))
        }
        Err(error) => {
            log::warn!("[logs] failed to create log file: {error}");
            None
        }
    }
}

pub fn start_log_reader<R>(stream: R, shared_log: SharedEngineLog, log_file: Option<SessionLogFile>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            match line {
                Ok(line) => {
                    if let Some(ref log_file) = log_file
                        && let Ok(mut file) = log_file.lock()
                        && let Err(error) = writeln!(file, "{line}")
                    {
                        log::warn!("[logs] failed to write engine line: {error}");
                    }
                    shared_log
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push_line(line);
                }
                Err(error) => {
                    log::trace!("[engine stderr] reader ended: {error}");
                    break;
                }
            }
        }
    });
}
