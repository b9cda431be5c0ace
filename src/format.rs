use crate::engine::HeapStatistics;

const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];

pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

/// One-line heap usage report logged for every sample.
pub fn usage_summary(stats: &HeapStatistics, mean: u64) -> String {
    format!(
        "heap {} of {} ({}%), mean {}",
        format_bytes(stats.used_heap_size),
        format_bytes(stats.heap_size_limit),
        stats.percent_used(),
        format_bytes(mean)
    )
}
