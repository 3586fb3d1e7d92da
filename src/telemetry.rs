//! Coarse host telemetry for the admin panel (CPU, RAM, SoC temperature,
//! uptime), read straight from procfs/sysfs. Linux only; readings that are
//! unavailable come back as `None`.

use std::fs;

use anyhow::{Context, Result};
use serde::Serialize;

const THERMAL_PATHS: [&str; 2] = [
    "/sys/class/thermal/thermal_zone0/temp",
    "/sys/class/hwmon/hwmon0/temp1_input",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemStats {
    pub cpu_percent: Option<f32>,
    pub memory_percent: Option<f32>,
    pub temperature_c: Option<f32>,
    pub uptime_secs: Option<u64>,
}

/// Panel-ready strings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsView {
    pub cpu: String,
    pub ram: String,
    pub temperature: String,
    pub uptime: String,
}

impl SystemStats {
    pub fn view(&self) -> StatsView {
        StatsView {
            cpu: percent_or_na(self.cpu_percent),
            ram: percent_or_na(self.memory_percent),
            temperature: self
                .temperature_c
                .map(|t| format!("{:.1} °C", t))
                .unwrap_or_else(|| "N/A".to_string()),
            uptime: self
                .uptime_secs
                .map(format_uptime)
                .unwrap_or_else(|| "N/A".to_string()),
        }
    }
}

fn percent_or_na(value: Option<f32>) -> String {
    value
        .map(|v| format!("{:.1}%", v))
        .unwrap_or_else(|| "N/A".to_string())
}

/// `H:MM:SS`, with a `N days, ` prefix past 24 hours.
pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;
    match days {
        0 => format!("{}:{:02}:{:02}", hours, minutes, seconds),
        1 => format!("1 day, {}:{:02}:{:02}", hours, minutes, seconds),
        _ => format!("{} days, {}:{:02}:{:02}", days, hours, minutes, seconds),
    }
}

/// Raw CPU counters from /proc/stat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    idle: u64,
}

impl CpuTimes {
    fn total(&self) -> u64 {
        self.busy + self.idle
    }
}

/// Keeps the previous CPU sample so load is measured between calls.
#[derive(Debug, Default)]
pub struct TelemetrySampler {
    prev_cpu: Option<CpuTimes>,
}

impl TelemetrySampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self) -> SystemStats {
        let cpu = fs::read_to_string("/proc/stat")
            .context("Failed to read /proc/stat")
            .and_then(|content| parse_cpu_times(&content));
        let cpu_percent = match cpu {
            Ok(now) => {
                let percent = cpu_percent(self.prev_cpu, now);
                self.prev_cpu = Some(now);
                percent
            }
            Err(e) => {
                log::debug!("CPU stats unavailable: {}", e);
                None
            }
        };

        SystemStats {
            cpu_percent,
            memory_percent: fs::read_to_string("/proc/meminfo")
                .ok()
                .and_then(|content| memory_percent(&content).ok()),
            temperature_c: read_temperature(),
            uptime_secs: fs::read_to_string("/proc/uptime")
                .ok()
                .and_then(|content| parse_uptime(&content).ok()),
        }
    }
}

/// Busy share since `prev`, or since boot on the first sample.
fn cpu_percent(prev: Option<CpuTimes>, now: CpuTimes) -> Option<f32> {
    let (busy, total) = match prev {
        Some(prev) => (
            now.busy.saturating_sub(prev.busy),
            now.total().saturating_sub(prev.total()),
        ),
        None => (now.busy, now.total()),
    };
    (total > 0).then(|| busy as f32 / total as f32 * 100.0)
}

fn parse_cpu_times(content: &str) -> Result<CpuTimes> {
    let cpu_line = content
        .lines()
        .find(|line| line.starts_with("cpu "))
        .context("No cpu line in /proc/stat")?;

    let parts: Vec<u64> = cpu_line
        .split_whitespace()
        .skip(1)
        .take(7)
        .filter_map(|s| s.parse().ok())
        .collect();

    if parts.len() < 7 {
        anyhow::bail!("Invalid /proc/stat format");
    }

    // user nice system idle iowait irq softirq
    Ok(CpuTimes {
        busy: parts[0] + parts[1] + parts[2] + parts[5] + parts[6],
        idle: parts[3] + parts[4],
    })
}

fn memory_percent(content: &str) -> Result<f32> {
    let mut total: Option<u64> = None;
    let mut available: Option<u64> = None;

    for line in content.lines() {
        if line.starts_with("MemTotal:") {
            total = Some(parse_meminfo_value(line)?);
        } else if line.starts_with("MemAvailable:") {
            available = Some(parse_meminfo_value(line)?);
        }
    }

    let total = total.filter(|t| *t > 0).context("No MemTotal in /proc/meminfo")?;
    let available = available.context("No MemAvailable in /proc/meminfo")?;
    Ok(total.saturating_sub(available) as f32 / total as f32 * 100.0)
}

fn parse_meminfo_value(line: &str) -> Result<u64> {
    line.split_whitespace()
        .nth(1)
        .context("Invalid meminfo line")?
        .parse()
        .context("Invalid meminfo value")
}

fn parse_uptime(content: &str) -> Result<u64> {
    let uptime_str = content
        .split_whitespace()
        .next()
        .context("Empty /proc/uptime")?;
    let uptime_secs: f64 = uptime_str.parse().context("Invalid uptime value")?;
    Ok(uptime_secs as u64)
}

fn read_temperature() -> Option<f32> {
    THERMAL_PATHS.iter().find_map(|path| {
        let content = fs::read_to_string(path).ok()?;
        parse_millidegrees(&content)
    })
}

fn parse_millidegrees(content: &str) -> Option<f32> {
    content
        .trim()
        .parse::<i64>()
        .ok()
        .map(|millidegrees| millidegrees as f32 / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 50 0 50 350 50 0 0 0 0 0\nintr 1 2 3\n";

    #[test]
    fn test_parse_cpu_times() {
        let times = parse_cpu_times(STAT).unwrap();
        assert_eq!(times, CpuTimes { busy: 200, idle: 800 });
        assert!(parse_cpu_times("intr 1 2 3").is_err());
        assert!(parse_cpu_times("cpu  1 2").is_err());
    }

    #[test]
    fn test_cpu_percent_uses_delta() {
        let first = CpuTimes { busy: 200, idle: 800 };
        assert_eq!(cpu_percent(None, first), Some(20.0));

        let second = CpuTimes { busy: 300, idle: 900 };
        assert_eq!(cpu_percent(Some(first), second), Some(50.0));
        assert_eq!(cpu_percent(Some(second), second), None);
    }

    #[test]
    fn test_memory_percent() {
        let meminfo = "MemTotal:        1000000 kB\nMemFree:          100000 kB\nMemAvailable:     250000 kB\n";
        assert_eq!(memory_percent(meminfo).unwrap(), 75.0);
        assert!(memory_percent("MemFree: 5 kB\n").is_err());
    }

    #[test]
    fn test_parse_uptime_and_temperature() {
        assert_eq!(parse_uptime("93784.12 350000.50\n").unwrap(), 93784);
        assert!(parse_uptime("").is_err());
        assert_eq!(parse_millidegrees("48312\n"), Some(48.312));
        assert_eq!(parse_millidegrees("garbage"), None);
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(59), "0:00:59");
        assert_eq!(format_uptime(3_725), "1:02:05");
        assert_eq!(format_uptime(93_784), "1 day, 2:03:04");
        assert_eq!(format_uptime(3 * 86_400 + 60), "3 days, 0:01:00");
    }

    #[test]
    fn test_view_marks_missing_readings() {
        let stats = SystemStats {
            cpu_percent: Some(12.345),
            memory_percent: None,
            temperature_c: Some(51.04),
            uptime_secs: None,
        };
        let view = stats.view();
        assert_eq!(view.cpu, "12.3%");
        assert_eq!(view.ram, "N/A");
        assert_eq!(view.temperature, "51.0 °C");
        assert_eq!(view.uptime, "N/A");
    }
}
