/*
 * Bootstrap Configuration
 *
 * Environment overrides read once when an event scope is bootstrapped:
 *
 * - STRAND_WORKER_COUNT    workers in the default cluster
 * - STRAND_POLLER_COUNT    input pollers for the default cluster
 * - STRAND_DEFAULT_POLLERS poller count for clusters created without an
 *                          explicit count
 * - STRAND_DEBUG           debug categories, see utils::logger
 */

use std::env;

/// Resolved bootstrap parameters.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub worker_count: usize,
    pub poller_count: usize,
    pub default_pollers: usize,
}

impl Config {
    /// Apply environment overrides on top of the caller-supplied counts.
    /// Zero or unparsable values are ignored.
    pub fn from_env(poller_count: usize, worker_count: usize) -> Config {
        Config {
            worker_count: env_count("STRAND_WORKER_COUNT").unwrap_or(worker_count).max(1),
            poller_count: env_count("STRAND_POLLER_COUNT").unwrap_or(poller_count).max(1),
            default_pollers: env_count("STRAND_DEFAULT_POLLERS").unwrap_or(1).max(1),
        }
    }
}

fn env_count(name: &str) -> Option<usize> {
    let val = env::var(name).ok()?;
    match val.trim().parse::<usize>() {
        Ok(n) if n > 0 => Some(n),
        _ => {
            log::warn!(target: "warning", "ignoring {}={:?}", name, val);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_through() {
        // Environment-free path: caller counts survive, floored at one.
        let cfg = Config::from_env(2, 0);
        assert_eq!(cfg.poller_count, 2);
        assert_eq!(cfg.worker_count, 1);
        assert_eq!(cfg.default_pollers, 1);
    }
}
