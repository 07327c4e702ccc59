//! Process resource sampling via /proc.

use std::time::{Duration, Instant};

/// CPU usage of a process as a percentage of total machine capacity.
///
/// Takes two process-CPU-time readings 100 ms apart and computes
/// `Δcpu / (Δwall · cores) · 100`, rounded to two decimals. Returns 0.0
/// when the process is gone or a reading fails.
pub async fn sample_cpu_percent(pid: u32) -> f64 {
    let Some(first) = process_cpu_seconds(pid) else {
        return 0.0;
    };
    let started = Instant::now();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let Some(second) = process_cpu_seconds(pid) else {
        return 0.0;
    };

    let wall = started.elapsed().as_secs_f64();
    if wall <= 0.0 {
        return 0.0;
    }
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1) as f64;

    let percent = (second - first).max(0.0) / (wall * cores) * 100.0;
    (percent * 100.0).round() / 100.0
}

/// Total CPU time (user + system) consumed by a process, in seconds.
#[cfg(target_os = "linux")]
fn process_cpu_seconds(pid: u32) -> Option<f64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // utime and stime are fields 14 and 15; everything up to the
    // parenthesized command name is skipped to survive spaces in it.
    let rest = stat.rsplit_once(')')?.1;
    let mut fields = rest.split_whitespace();
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;

    let ticks_per_sec = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks_per_sec <= 0 {
        return None;
    }
    Some((utime + stime) as f64 / ticks_per_sec as f64)
}

#[cfg(not(target_os = "linux"))]
fn process_cpu_seconds(_pid: u32) -> Option<f64> {
    None
}

/// Resident set size of a process in bytes, 0 when unreadable.
#[cfg(target_os = "linux")]
pub fn resident_memory_bytes(pid: u32) -> u64 {
    let Ok(statm) = std::fs::read_to_string(format!("/proc/{pid}/statm")) else {
        return 0;
    };
    let Some(pages) = statm
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse::<u64>().ok())
    else {
        return 0;
    };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    if page_size <= 0 {
        return 0;
    }
    pages * page_size as u64
}

#[cfg(not(target_os = "linux"))]
pub fn resident_memory_bytes(_pid: u32) -> u64 {
    0
}
