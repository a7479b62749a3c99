//! Human-readable formatting helpers for log output.

use std::time::Duration;

/// Formats a duration with precision appropriate to its magnitude, for
/// timing lines in stage logs.
pub fn format_duration_precise(duration: Duration) -> String {
    let millis = duration.as_millis();

    if millis == 0 {
        let micros = duration.as_micros();
        return format!("{micros}us");
    }

    if millis < 1000 {
        return format!("{millis}ms");
    }

    let seconds = duration.as_secs_f64();
    if seconds < 60.0 {
        if seconds >= 10.0 {
            format!("{seconds:.1}s")
        } else {
            format!("{seconds:.2}s")
        }
    } else if seconds < 3600.0 {
        let minutes = (seconds / 60.0).floor() as u64;
        let rem = seconds - minutes as f64 * 60.0;
        format!("{minutes}m{rem:.0}s")
    } else {
        let hours = (seconds / 3600.0).floor() as u64;
        let minutes = ((seconds - hours as f64 * 3600.0) / 60.0).floor() as u64;
        format!("{hours}h{minutes}m")
    }
}
