//! Resource sampling for one simulation run.
//!
//! A detached thread polls the engine process on a fixed timer and appends
//! one CSV row per sample. Stopping only raises a flag; the thread notices it
//! within one poll slice and exits on its own.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sysinfo::{Pid, Process, System};
use tracing::{debug, warn};

use crate::errors::CalResult;
use crate::models::{timestamp_now, ResourceSample};

/// Granularity at which the sampling thread checks the stop flag.
const POLL_SLICE: Duration = Duration::from_millis(100);

const GPU_QUERY: [&str; 2] = [
    "--query-gpu=utilization.gpu,memory.used,memory.total,temperature.gpu",
    "--format=csv,noheader,nounits",
];

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Name of the engine executable; the launch script itself is only a
    /// wrapper around it.
    pub process_name: String,
    pub interval: Duration,
    pub log_path: PathBuf,
    pub batch: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PeakUsage {
    pub samples: u64,
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

impl PeakUsage {
    fn record(&mut self, sample: &ResourceSample) {
        self.samples += 1;
        self.memory_bytes = self.memory_bytes.max(sample.memory_bytes);
        self.cpu_percent = self.cpu_percent.max(sample.cpu_percent);
    }
}

pub struct ResourceMonitor {
    stop: Arc<AtomicBool>,
    peak: Arc<Mutex<PeakUsage>>,
}

impl ResourceMonitor {
    /// Start sampling. `fallback_pid` (the launcher) is sampled while no
    /// process named `config.process_name` exists.
    pub fn spawn(config: MonitorConfig, fallback_pid: Option<u32>) -> CalResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let peak = Arc::new(Mutex::new(PeakUsage::default()));
        let thread_stop = Arc::clone(&stop);
        let thread_peak = Arc::clone(&peak);

        thread::Builder::new()
            .name("resource-monitor".into())
            .spawn(move || sample_loop(config, fallback_pid, thread_stop, thread_peak))?;
        debug!("resource monitor started");
        Ok(Self { stop, peak })
    }

    pub fn peak(&self) -> PeakUsage {
        *self.peak.lock()
    }

    /// Signal the thread to exit and return the usage seen so far.
    pub fn stop(self) -> PeakUsage {
        self.stop.store(true, Ordering::Relaxed);
        let peak = self.peak();
        debug!(samples = peak.samples, "resource monitor stopped");
        peak
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn sample_loop(
    config: MonitorConfig,
    fallback_pid: Option<u32>,
    stop: Arc<AtomicBool>,
    peak: Arc<Mutex<PeakUsage>>,
) {
    let mut system = primed_system();
    let mut gpu_available = true;
    loop {
        let deadline = Instant::now() + config.interval;
        while Instant::now() < deadline {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(POLL_SLICE.min(config.interval));
        }
        if stop.load(Ordering::Relaxed) {
            return;
        }

        system.refresh_processes();
        system.refresh_cpu();
        let target = system
            .processes_by_name(&config.process_name)
            .next()
            .map(Process::pid)
            .or_else(|| fallback_pid.map(Pid::from_u32));
        let Some(pid) = target else {
            continue;
        };
        let Some(process) = system.process(pid) else {
            continue;
        };
        let frequency = system.global_cpu_info().frequency();
        let gpu = if gpu_available { query_gpu() } else { None };
        if gpu.is_none() && gpu_available {
            debug!("no GPU reported by nvidia-smi; GPU columns stay empty");
            gpu_available = false;
        }
        let gpu = gpu.unwrap_or_default();
        let sample = ResourceSample {
            batch: config.batch,
            timestamp: timestamp_now(),
            pid: pid.as_u32(),
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
            virtual_memory_bytes: process.virtual_memory(),
            run_time_secs: process.run_time(),
            cpu_frequency_mhz: frequency,
            gpu_percent: gpu.percent,
            gpu_memory_used_mb: gpu.memory_used_mb,
            gpu_memory_total_mb: gpu.memory_total_mb,
            gpu_temperature_c: gpu.temperature_c,
        };
        peak.lock().record(&sample);
        if let Err(e) = append_sample(&config.log_path, &sample) {
            warn!(path = %config.log_path.display(), error = %e, "failed to write resource sample");
        }
    }
}

/// CPU usage is a delta between refreshes, so the first real sample needs
/// one refresh behind it.
fn primed_system() -> System {
    let mut system = System::new();
    system.refresh_processes();
    system.refresh_cpu();
    system
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct GpuReading {
    percent: Option<f32>,
    memory_used_mb: Option<f64>,
    memory_total_mb: Option<f64>,
    temperature_c: Option<f32>,
}

fn query_gpu() -> Option<GpuReading> {
    let output = Command::new("nvidia-smi").args(GPU_QUERY).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout.lines().next().and_then(parse_gpu_line)
}

/// One `nvidia-smi` csv row: load %, used MB, total MB, temperature. Fields
/// the driver reports as `[N/A]` stay `None`.
fn parse_gpu_line(line: &str) -> Option<GpuReading> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    let [load, used, total, temperature] = fields.as_slice() else {
        return None;
    };
    let reading = GpuReading {
        percent: load.parse().ok(),
        memory_used_mb: used.parse().ok(),
        memory_total_mb: total.parse().ok(),
        temperature_c: temperature.parse().ok(),
    };
    (reading != GpuReading::default()).then_some(reading)
}

/// Append one row, writing the header only into an empty file.
pub fn append_sample(path: &std::path::Path, sample: &ResourceSample) -> CalResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let empty = file.metadata()?.len() == 0;
    let mut writer = csv::WriterBuilder::new().has_headers(empty).from_writer(file);
    writer.serialize(sample)?;
    writer.flush()?;
    Ok(())
}
