use log::{info, warn};
#[cfg(target_os = "linux")]
use std::fs::read_to_string;

pub const DEFAULT_THRESHOLD_PERCENT: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySample {
    pub used_percent: f64,
    pub available_mb: f64,
}

impl MemorySample {
    /// Reported when sampling fails; never over any threshold.
    pub const UNKNOWN: MemorySample = MemorySample { used_percent: 0.0, available_mb: 0.0 };
}

#[derive(Debug)]
pub struct ProcessStats { pub rss_mb: f64, pub vm_size_mb: f64, pub percent: Option<f64> }

pub trait MemoryProbe {
    fn sample(&self) -> Option<MemorySample>;
}

/// Reads host memory from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

impl MemoryProbe for SystemMemory {
    #[cfg(target_os = "linux")]
    fn sample(&self) -> Option<MemorySample> {
        let meminfo = read_to_string("/proc/meminfo").ok()?;
        parse_meminfo(&meminfo)
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&self) -> Option<MemorySample> {
        let stats = get_process_memory()?;
        let percent = stats.percent?;
        Some(MemorySample { used_percent: percent, available_mb: 0.0 })
    }
}

/// Always reports the same sample.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub MemorySample);

impl MemoryProbe for FixedProbe {
    fn sample(&self) -> Option<MemorySample> {
        Some(self.0)
    }
}

/// `used = (MemTotal - MemAvailable) / MemTotal`.
pub fn parse_meminfo(content: &str) -> Option<MemorySample> {
    let field = |name: &str| kb_field(content, name);
    let total_kb = field("MemTotal:")?;
    let available_kb = field("MemAvailable:").or_else(|| field("MemFree:"))?;
    if total_kb <= 0.0 {
        return None;
    }
    Some(MemorySample {
        used_percent: ((total_kb - available_kb) / total_kb * 100.0).clamp(0.0, 100.0),
        available_mb: available_kb / 1024.0,
    })
}

pub struct MemoryMonitor {
    threshold_percent: f64,
    probe: Box<dyn MemoryProbe>,
}

impl MemoryMonitor {
    pub fn with_probe(threshold_percent: f64, probe: Box<dyn MemoryProbe>) -> Self {
        Self { threshold_percent, probe }
    }

    pub fn sample(&self) -> MemorySample {
        match self.probe.sample() {
            Some(sample) if sample.used_percent.is_finite() => sample,
            _ => {
                warn!("Could not get memory info, assuming no memory pressure");
                MemorySample::UNKNOWN
            }
        }
    }

    pub fn over_threshold(&self, used_percent: f64) -> bool {
        used_percent > self.threshold_percent
    }

    /// Samples once and logs when usage is above the threshold.
    pub fn under_pressure(&self) -> bool {
        let sample = self.sample();
        let over = self.over_threshold(sample.used_percent);
        if over {
            warn!("High memory usage: {:.1}% used, {:.1}MB available", sample.used_percent, sample.available_mb);
        }
        over
    }
}

/// Value of a `Name:   1234 kB` line from a `/proc` file.
fn kb_field(content: &str, name: &str) -> Option<f64> {
    content.lines()
        .find(|line| line.starts_with(name))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|s| s.parse::<f64>().ok())
}

/// Resident and virtual size from `/proc/<pid>/status`, as a share of `MemTotal` when known.
pub fn parse_process_status(status: &str, meminfo: Option<&str>) -> Option<ProcessStats> {
    let rss_kb = kb_field(status, "VmRSS:")?;
    let vm_size_kb = kb_field(status, "VmSize:")?;
    let percent = meminfo
        .and_then(|content| kb_field(content, "MemTotal:"))
        .filter(|total_kb| *total_kb > 0.0)
        .map(|total_kb| rss_kb / total_kb * 100.0);
    Some(ProcessStats { rss_mb: rss_kb / 1024.0, vm_size_mb: vm_size_kb / 1024.0, percent })
}

#[cfg(target_os = "linux")]
pub fn get_process_memory() -> Option<ProcessStats> {
    let status = read_to_string(format!("/proc/{}/status", std::process::id())).ok()?;
    let meminfo = read_to_string("/proc/meminfo").ok();
    parse_process_status(&status, meminfo.as_deref())
}

#[cfg(target_os = "macos")]
pub fn get_process_memory() -> Option<ProcessStats> {
    use std::process::Command;

    let ps_kb = |column: &str| {
        let output = Command::new("ps")
            .args(["-o", column, "-p", &std::process::id().to_string()])
            .output()
            .ok()?;
        String::from_utf8_lossy(&output.stdout).trim().parse::<f64>().ok()
    };
    let rss_kb = ps_kb("rss=")?;
    let vsz_kb = ps_kb("vsz=")?;
    let percent = Command::new("sysctl").args(["-n", "hw.memsize"]).output().ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .map(|total_bytes| total_bytes / 1024.0)
        .filter(|total_kb| *total_kb > 0.0)
        .map(|total_kb| rss_kb / total_kb * 100.0);
    Some(ProcessStats { rss_mb: rss_kb / 1024.0, vm_size_mb: vsz_kb / 1024.0, percent })
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn get_process_memory() -> Option<ProcessStats> { None }

pub fn log_memory_usage(note: &str) {
    if let Some(stats) = get_process_memory() {
        let percent_str = stats.percent.map_or_else(|| "N/A".to_string(), |p| format!("{:.1}%", p));
        info!(
            "Memory usage ({}): {:.1} MB physical (RSS), {:.1} MB virtual, {} of system memory",
            note, stats.rss_mb, stats.vm_size_mb, percent_str
        );
    } else {
        info!("Memory usage tracking not available on this platform ({})", std::env::consts::OS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;
    impl MemoryProbe for Broken {
        fn sample(&self) -> Option<MemorySample> { None }
    }

    #[test]
    fn meminfo_uses_available_memory() {
        let content = "MemTotal:       1000000 kB\nMemFree:         100000 kB\nMemAvailable:    250000 kB\n";
        let sample = parse_meminfo(content).unwrap();
        assert!((sample.used_percent - 75.0).abs() < 1e-9);
        assert!((sample.available_mb - 250000.0 / 1024.0).abs() < 1e-9);
    }

    #[test]
    fn process_status_reports_rss_share() {
        let status = "Name:\tbatch-reconciler\nVmSize:\t  204800 kB\nVmRSS:\t   51200 kB\nThreads:\t1\n";
        let stats = parse_process_status(status, Some("MemTotal:       1024000 kB\n")).unwrap();
        assert!((stats.rss_mb - 50.0).abs() < 1e-9);
        assert!((stats.vm_size_mb - 200.0).abs() < 1e-9);
        assert!((stats.percent.unwrap() - 5.0).abs() < 1e-9);
        assert!(parse_process_status(status, None).unwrap().percent.is_none());
        assert!(parse_process_status("VmSize:\t100 kB\n", None).is_none());
    }

    #[test]
    fn meminfo_without_total_is_unknown() {
        assert!(parse_meminfo("MemAvailable: 10 kB\n").is_none());
    }

    #[test]
    fn failed_sample_is_never_over_threshold() {
        let monitor = MemoryMonitor::with_probe(80.0, Box::new(Broken));
        assert_eq!(monitor.sample(), MemorySample::UNKNOWN);
        assert!(!monitor.under_pressure());
    }

    #[test]
    fn threshold_is_strict() {
        let monitor = MemoryMonitor::with_probe(80.0, Box::new(FixedProbe(MemorySample { used_percent: 91.0, available_mb: 12.0 })));
        assert!(monitor.under_pressure());
        assert!(!monitor.over_threshold(80.0));
        assert!(monitor.over_threshold(80.1));
    }
}
