//! Topic-filtered logging.
//!
//! Compilation stages emit through the `log` facade with one target per
//! topic (`lir`, `rlog`, `machine`, ...). The backend installed here
//! routes enabled topics to a file or to stdout and swallows the rest;
//! without `--log` nothing is installed and logging stays disabled.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

/// Every log topic with its CLI flag name.
pub const TOPICS: [&str; 12] = [
    "lir", "llog", "lrange", "llines", "rlog", "rhints", "rsplit", "machine", "alloc", "address",
    "compile", "result",
];

/// Where enabled topics are written.
pub enum LogSink {
    /// `--log -`
    Stdout,
    /// `--log FILE`
    File(File),
}

impl LogSink {
    pub fn open(spec: &str) -> io::Result<LogSink> {
        if spec == "-" {
            Ok(LogSink::Stdout)
        } else {
            Ok(LogSink::File(File::create(Path::new(spec))?))
        }
    }
}

struct TopicLogger {
    topics: Vec<&'static str>,
    sink: Mutex<LogSink>,
}

impl log::Log for TopicLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.topics.contains(&metadata.target())
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut sink = self.sink.lock().unwrap();
        let _ = match &mut *sink {
            LogSink::Stdout => writeln!(io::stdout(), "{}", record.args()),
            LogSink::File(file) => writeln!(file, "{}", record.args()),
        };
    }

    fn flush(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = match &mut *sink {
                LogSink::Stdout => io::stdout().flush(),
                LogSink::File(file) => file.flush(),
            };
        }
    }
}

/// Install the topic logger. `topics` holds flag names; `all` enables
/// everything.
pub fn init(topics: &[String], sink: LogSink) -> Result<(), log::SetLoggerError> {
    let enabled: Vec<&'static str> = TOPICS
        .iter()
        .copied()
        .filter(|t| topics.iter().any(|enabled| enabled == t || enabled == "all"))
        .collect();

    log::set_boxed_logger(Box::new(TopicLogger {
        topics: enabled,
        sink: Mutex::new(sink),
    }))?;
    log::set_max_level(log::LevelFilter::Trace);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_list_is_complete() {
        assert_eq!(TOPICS.len(), 12);
        assert!(TOPICS.contains(&"lir"));
        assert!(TOPICS.contains(&"rsplit"));
        assert!(TOPICS.contains(&"result"));
    }
}
