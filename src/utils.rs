use chrono::{DateTime, Utc};
use log::debug;
use std::thread;
use std::time::{Duration, Instant};

/// Bridge-side timestamp format: ISO-8601 UTC with microseconds, e.g. `2024-05-01T06:30:00.123456Z`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Time left in the current period after a tick took `elapsed`.
pub fn remaining_interval(interval: Duration, elapsed: Duration) -> Option<Duration> {
    interval.checked_sub(elapsed).filter(|d| !d.is_zero())
}

/// Run `tick` forever at a steady cadence, starting immediately.
///
/// A tick that overruns the interval is followed directly by the next one.
pub fn run_every(name: &str, interval: Duration, mut tick: impl FnMut()) -> ! {
    loop {
        let tick_start = Instant::now();
        tick();

        match remaining_interval(interval, tick_start.elapsed()) {
            Some(rest) => thread::sleep(rest),
            None => debug!("{}: tick overran its {}s interval", name, interval.as_secs()),
        }
    }
}
