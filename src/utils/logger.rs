/*
 * Debug Logger
 *
 * Target-filtered logger driven by the STRAND_DEBUG environment variable.
 * The variable holds a comma-separated subset of the runtime's debug
 * categories; records whose target matches a selected category are logged
 * at Debug level, everything else is limited to warnings.
 *
 * The categories mirror the runtime's subsystems:
 * basic, blocking, polling, scheduling, threads, warning.
 */

use std::collections::HashSet;
use std::env;
use std::io::Write;

use log::{Level, LevelFilter, Metadata, Record};

/// Recognized debug categories. Unknown entries in STRAND_DEBUG are
/// reported once and ignored.
const DEBUG_CATEGORIES: &[&str] = &[
    "basic",
    "blocking",
    "polling",
    "scheduling",
    "threads",
    "warning",
];

lazy_static::lazy_static! {
    static ref SELECTED: HashSet<&'static str> = {
        let mut set = HashSet::new();
        if let Ok(val) = env::var("STRAND_DEBUG") {
            for item in val.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match DEBUG_CATEGORIES.iter().find(|c| **c == item) {
                    Some(c) => {
                        set.insert(*c);
                    }
                    None => eprintln!("strand: unknown STRAND_DEBUG category '{}'", item),
                }
            }
        }
        set
    };
}

struct StrandLogger;

impl log::Log for StrandLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Warn || SELECTED.contains(metadata.target())
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let mut err = std::io::stderr().lock();
            _ = writeln!(
                err,
                "[{}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: StrandLogger = StrandLogger;

/// Install the runtime logger.
///
/// A host application may have installed its own logger before bootstrap;
/// in that case the existing logger wins and STRAND_DEBUG filtering is up
/// to the host.
pub fn init() {
    let max = if SELECTED.is_empty() {
        LevelFilter::Warn
    } else {
        LevelFilter::Debug
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_list_is_consistent() {
        // The filter compares record targets against this list verbatim.
        for cat in DEBUG_CATEGORIES {
            assert_eq!(cat.trim(), *cat);
            assert_eq!(cat.to_lowercase(), *cat);
        }
    }
}
