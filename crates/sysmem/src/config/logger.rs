use super::GlobalConfig;
use crate::config::{
    chunk::ChunkLogLevel, mapping::MappingLogLevel, reverse_map::ReverseMapLogLevel,
};
use alloc::{string::ToString, sync::Arc, vec::Vec};
use core::fmt::Display;
use hashbrown::HashMap;

#[cfg(std_io)]
use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::PathBuf,
};

/// Configuration for logging in sysmem, parameterized by a log level type.
///
/// Note that you can use multiple loggers at the same time.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(bound = "")]
pub struct LoggerConfig<L: LogLevel> {
    /// Path to the log file, if file logging is enabled.
    #[serde(default)]
    #[cfg(std_io)]
    pub file: Option<PathBuf>,

    /// Whether to append to the log file (true) or overwrite it (false). Defaults to true.
    ///
    /// ## Notes
    ///
    /// This parameter might get ignored based on other loggers config.
    #[serde(default = "append_default")]
    pub append: bool,

    /// Whether to log to standard output.
    #[serde(default)]
    pub stdout: bool,

    /// Whether to log to standard error.
    #[serde(default)]
    pub stderr: bool,

    /// Optional crate-level logging configuration (e.g., info, debug, trace).
    #[serde(default)]
    pub log: Option<LogCrateLevel>,

    /// The log level for this logger, determining verbosity.
    #[serde(default)]
    pub level: L,
}

impl<L: LogLevel> Default for LoggerConfig<L> {
    fn default() -> Self {
        Self {
            #[cfg(std_io)]
            file: None,
            append: true,
            stdout: false,
            stderr: false,
            log: None,
            level: L::default(),
        }
    }
}

/// Log levels using the `log` crate.
///
/// This enum defines verbosity levels for crate-level logging.
#[derive(
    Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize, Hash, PartialEq, Eq,
)]
pub enum LogCrateLevel {
    /// Logs informational messages.
    #[default]
    #[serde(rename = "info")]
    Info,

    /// Logs debugging messages.
    #[serde(rename = "debug")]
    Debug,

    /// Logs trace-level messages.
    #[serde(rename = "trace")]
    Trace,
}

fn append_default() -> bool {
    true
}

/// Trait for types that can be used as log levels in `LoggerConfig`.
pub trait LogLevel:
    serde::de::DeserializeOwned + serde::Serialize + Clone + Copy + core::fmt::Debug + Default
{
    /// Whether nothing should be logged at this level.
    fn is_disabled(&self) -> bool;
}

/// Central logging utility for sysmem, managing multiple log outputs.
#[derive(Debug)]
pub struct Logger {
    /// Collection of logger instances (file, stdout, stderr, or crate-level).
    loggers: Vec<LoggerKind>,

    /// Indices of loggers used for chunk lifecycle logging.
    chunk_index: Vec<usize>,

    /// Indices of loggers used for DMA mapping logging.
    mapping_index: Vec<usize>,

    /// Indices of loggers used for reverse mapping index logging.
    reverse_map_index: Vec<usize>,

    /// Configuration the loggers were built from.
    pub config: Arc<GlobalConfig>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(GlobalConfig::get())
    }
}

impl Logger {
    /// Creates a new `Logger` instance based on the provided configuration.
    ///
    /// Note that creating a logger is quite expensive, file loggers open their file eagerly.
    pub fn new(config: Arc<GlobalConfig>) -> Self {
        let mut loggers = Vec::new();
        let mut chunk_index = Vec::new();
        let mut mapping_index = Vec::new();
        let mut reverse_map_index = Vec::new();

        #[derive(Hash, PartialEq, Eq)]
        enum LoggerId {
            #[cfg(std_io)]
            File(PathBuf),
            Stdout,
            Stderr,
            LogCrate(LogCrateLevel),
        }

        let mut logger2index = HashMap::<LoggerId, usize>::new();

        fn new_logger<S: Clone, ID: Fn(S) -> LoggerId, LG: Fn(S) -> Option<LoggerKind>>(
            setting_index: &mut Vec<usize>,
            loggers: &mut Vec<LoggerKind>,
            logger2index: &mut HashMap<LoggerId, usize>,
            state: S,
            func_id: ID,
            func_logger: LG,
        ) {
            let id = func_id(state.clone());

            if let Some(index) = logger2index.get(&id) {
                setting_index.push(*index);
            } else if let Some(logger) = func_logger(state) {
                let index = loggers.len();
                logger2index.insert(id, index);
                loggers.push(logger);
                setting_index.push(index);
            }
        }

        fn register_logger<L: LogLevel>(
            kind: &LoggerConfig<L>,
            setting_index: &mut Vec<usize>,
            loggers: &mut Vec<LoggerKind>,
            logger2index: &mut HashMap<LoggerId, usize>,
        ) {
            if kind.level.is_disabled() {
                return;
            }

            #[cfg(std_io)]
            if let Some(file) = &kind.file {
                new_logger(
                    setting_index,
                    loggers,
                    logger2index,
                    (file, kind.append),
                    |(file, _append)| LoggerId::File(file.clone()),
                    |(file, append)| FileLogger::new(file, append).map(LoggerKind::File),
                );
            }

            if kind.stdout {
                new_logger(
                    setting_index,
                    loggers,
                    logger2index,
                    (),
                    |_| LoggerId::Stdout,
                    |_| Some(LoggerKind::Stdout),
                );
            }

            if kind.stderr {
                new_logger(
                    setting_index,
                    loggers,
                    logger2index,
                    (),
                    |_| LoggerId::Stderr,
                    |_| Some(LoggerKind::Stderr),
                );
            }

            if let Some(level) = kind.log {
                new_logger(
                    setting_index,
                    loggers,
                    logger2index,
                    level,
                    LoggerId::LogCrate,
                    |level| Some(LoggerKind::Log(level)),
                );
            }
        }

        register_logger(
            &config.chunk.logger,
            &mut chunk_index,
            &mut loggers,
            &mut logger2index,
        );
        register_logger(
            &config.mapping.logger,
            &mut mapping_index,
            &mut loggers,
            &mut logger2index,
        );
        register_logger(
            &config.reverse_map.logger,
            &mut reverse_map_index,
            &mut loggers,
            &mut logger2index,
        );

        Self {
            loggers,
            chunk_index,
            mapping_index,
            reverse_map_index,
            config,
        }
    }

    /// Logs a chunk lifecycle message, directing it to all configured chunk loggers.
    pub fn log_chunk<S: Display>(&mut self, msg: &S) {
        Self::dispatch(&mut self.loggers, &self.chunk_index, msg);
    }

    /// Logs a DMA mapping message, directing it to all configured mapping loggers.
    pub fn log_mapping<S: Display>(&mut self, msg: &S) {
        Self::dispatch(&mut self.loggers, &self.mapping_index, msg);
    }

    /// Logs a reverse map message, directing it to all configured reverse map loggers.
    pub fn log_reverse_map<S: Display>(&mut self, msg: &S) {
        Self::dispatch(&mut self.loggers, &self.reverse_map_index, msg);
    }

    /// Returns the current chunk log level.
    pub fn log_level_chunk(&self) -> ChunkLogLevel {
        self.config.chunk.logger.level
    }

    /// Returns the current mapping log level.
    pub fn log_level_mapping(&self) -> MappingLogLevel {
        self.config.mapping.logger.level
    }

    /// Returns the current reverse map log level.
    pub fn log_level_reverse_map(&self) -> ReverseMapLogLevel {
        self.config.reverse_map.logger.level
    }

    fn dispatch<S: Display>(loggers: &mut [LoggerKind], indices: &[usize], msg: &S) {
        match indices {
            [] => {}
            [index] => loggers[*index].log(msg),
            indices => {
                let msg = msg.to_string();
                for index in indices {
                    loggers[*index].log(&msg);
                }
            }
        }
    }
}

/// Represents different types of loggers.
#[derive(Debug)]
enum LoggerKind {
    /// Logs to a file.
    #[cfg(std_io)]
    File(FileLogger),

    /// Logs to standard output.
    Stdout,

    /// Logs to standard error.
    Stderr,

    /// Logs using the `log` crate with a specified level.
    Log(LogCrateLevel),
}

impl LoggerKind {
    fn log<S: Display>(&mut self, msg: &S) {
        match self {
            #[cfg(std_io)]
            LoggerKind::File(file_logger) => file_logger.log(msg),
            LoggerKind::Stdout => println!("{msg}"),
            LoggerKind::Stderr => eprintln!("{msg}"),
            LoggerKind::Log(level) => match level {
                LogCrateLevel::Info => log::info!("{msg}"),
                LogCrateLevel::Debug => log::debug!("{msg}"),
                LogCrateLevel::Trace => log::trace!("{msg}"),
            },
        }
    }
}

/// Logger that writes messages to a file.
#[derive(Debug)]
#[cfg(std_io)]
struct FileLogger {
    writer: BufWriter<File>,
}

#[cfg(std_io)]
impl FileLogger {
    // Creates a new file logger, or `None` when the file can't be opened.
    fn new(path: &PathBuf, append: bool) -> Option<Self> {
        let file = OpenOptions::new()
            .write(true)
            .append(append)
            .truncate(!append)
            .create(true)
            .open(path);

        match file {
            Ok(file) => Some(Self {
                writer: BufWriter::new(file),
            }),
            Err(err) => {
                log::warn!("Can't open log file {}: {err}", path.display());
                None
            }
        }
    }

    // Logs a message to the file, flushing the buffer to ensure immediate write.
    fn log<S: Display>(&mut self, msg: &S) {
        if let Err(err) = writeln!(self.writer, "{msg}").and_then(|_| self.writer.flush()) {
            log::warn!("Failed to write sysmem log: {err}");
        }
    }
}
