//! System telemetry for sensor-bound widgets
//!
//! Every readable metric is registered under a string key (`CpuUsage`,
//! `CpuFreq003`, `MiscTemp001`, ...) mapping to a [`MetricKind`]. The
//! registry is rebuilt only when the hardware topology changes (core count or
//! temperature sensors); readings are refreshed at most every
//! [`REFRESH_INTERVAL`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use sysinfo::{Components, Disks, Networks, System};

/// Returned for both the value and the description of an unknown key
pub const PLACEHOLDER: &str = "None";

/// Minimum time between two refreshes of the readings
pub const REFRESH_INTERVAL: Duration = Duration::from_millis(250);

const GIB: f64 = 1_073_741_824.0;
const MIB: f64 = 1_048_576.0;
const KIB: f64 = 1024.0;

/// Totals above this are shown in GB instead of MB
const TOTAL_GB_THRESHOLD: f64 = 1_048_502_599.68;

/// Rates above this are shown in MB instead of KB
const RATE_MB_THRESHOLD: f64 = 1_023_928.32;

/// Formats sensor readings for widgets.
pub trait SensorFormatter: Send + Sync {
    /// Returns `(display_string, description)`; unknown keys yield [`PLACEHOLDER`] twice.
    fn format(&self, key: &str, unit: bool, cels: bool) -> (String, String);
}

/// A metric and the index of the core/sensor it reads, where applicable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    CpuFreq,
    CpuUsage,
    CpuFreqMax,
    CpuUsageMax,
    CpuCoreFreq(usize),
    CpuCoreUsage(usize),
    MemoryUsage,
    MemoryFree,
    SwapUsage,
    SwapFree,
    DiskWrite,
    DiskRead,
    DiskWriteRate,
    DiskReadRate,
    NetSent,
    NetRecv,
    NetSentRate,
    NetRecvRate,
    CpuTemp(usize),
    DiskTemp(usize),
    MiscTemp(usize),
    SystemLoad,
    SystemUptime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub kind: MetricKind,
    pub description: String,
}

/// Which temperature family a sensor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempGroup {
    Cpu,
    Disk,
    Misc,
}

/// Classify a temperature sensor by its label.
pub fn classify_temperature(label: &str) -> TempGroup {
    let label = label.to_ascii_lowercase();
    if ["k10temp", "coretemp", "tctl", "tdie", "package id", "cpu"]
        .iter()
        .any(|name| label.contains(name))
    {
        TempGroup::Cpu
    } else if ["nvme", "drivetemp", "composite"]
        .iter()
        .any(|name| label.contains(name))
    {
        TempGroup::Disk
    } else {
        TempGroup::Misc
    }
}

/// Hardware shape the registry is built from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub cores: usize,
    pub cpu_temps: Vec<String>,
    pub disk_temps: Vec<String>,
    pub misc_temps: Vec<String>,
}

/// Latest sampled values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Readings {
    pub cpu_usage: f32,
    /// MHz
    pub cpu_freq: f64,
    pub core_usage: Vec<f32>,
    /// MHz
    pub core_freq: Vec<u64>,
    pub memory_usage: f64,
    pub memory_free: u64,
    pub swap_usage: f64,
    pub swap_free: u64,
    pub disk_written: u64,
    pub disk_read: u64,
    /// Bytes per second
    pub disk_write_rate: f64,
    pub disk_read_rate: f64,
    pub net_sent: u64,
    pub net_recv: u64,
    pub net_sent_rate: f64,
    pub net_recv_rate: f64,
    /// Celsius
    pub cpu_temps: Vec<f32>,
    pub disk_temps: Vec<f32>,
    pub misc_temps: Vec<f32>,
    pub load: [f64; 3],
    /// Seconds
    pub uptime: u64,
}

/// Build the key registry for a topology.
pub fn build_registry(topology: &Topology) -> HashMap<String, Metric> {
    let mut registry = HashMap::new();
    let mut add = |key: String, kind: MetricKind, description: String| {
        registry.insert(key, Metric { kind, description });
    };

    add("CpuFreq".into(), MetricKind::CpuFreq, "CPU Frequency in GHz".into());
    add("CpuUsage".into(), MetricKind::CpuUsage, "CPU Usage".into());
    add("CpuFreqMax".into(), MetricKind::CpuFreqMax, "CPU Core Frequency Max in GHz".into());
    add("CpuUsageMax".into(), MetricKind::CpuUsageMax, "CPU Core Usage Max".into());
    for i in 0..topology.cores {
        add(
            format!("CpuFreq{i:03}"),
            MetricKind::CpuCoreFreq(i),
            format!("CPU Frequency of Core {i} in MHz"),
        );
        add(
            format!("CpuUsage{i:03}"),
            MetricKind::CpuCoreUsage(i),
            format!("CPU Usage of Core {i}"),
        );
    }

    add("MemoryDdrUsage".into(), MetricKind::MemoryUsage, "Memory Usage".into());
    add("MemoryDdrFree".into(), MetricKind::MemoryFree, "Memory Free in GB".into());
    add("MemorySwapUsage".into(), MetricKind::SwapUsage, "Swap Usage".into());
    add("MemorySwapFree".into(), MetricKind::SwapFree, "Swap Free in GB".into());

    add("DiskWrite".into(), MetricKind::DiskWrite, "Disk Write Count in MB/GB".into());
    add("DiskRead".into(), MetricKind::DiskRead, "Disk Read Count in MB/GB".into());
    add("DiskWriteRate".into(), MetricKind::DiskWriteRate, "Disk Write Rate in MB".into());
    add("DiskReadRate".into(), MetricKind::DiskReadRate, "Disk Read Rate in MB".into());

    add("NetworkSent".into(), MetricKind::NetSent, "Network Sent Count in MB/GB".into());
    add("NetworkRecv".into(), MetricKind::NetRecv, "Network Received Count in MB/GB".into());
    add("NetworkSentRate".into(), MetricKind::NetSentRate, "Network Sent Rate in KB/MB".into());
    add(
        "NetworkRecvRate".into(),
        MetricKind::NetRecvRate,
        "Network Received Rate in KB/MB".into(),
    );

    for (i, label) in topology.cpu_temps.iter().enumerate() {
        add(
            format!("CpuTemp{i:03}"),
            MetricKind::CpuTemp(i),
            format!("CPU Temperature of {label} ({i})"),
        );
    }
    for (i, label) in topology.disk_temps.iter().enumerate() {
        add(
            format!("DiskTemp{i:03}"),
            MetricKind::DiskTemp(i),
            format!("Disk Temperature of {label} ({i})"),
        );
    }
    for (i, label) in topology.misc_temps.iter().enumerate() {
        add(
            format!("MiscTemp{i:03}"),
            MetricKind::MiscTemp(i),
            format!("Misc Temperature of {label} ({i})"),
        );
    }

    add("SystemLoad".into(), MetricKind::SystemLoad, "System Average Load".into());
    add("SystemUptime".into(), MetricKind::SystemUptime, "Uptime".into());

    registry
}

fn with_unit(value: String, unit: bool, suffix: &str) -> String {
    if unit { value + suffix } else { value }
}

fn total_size(bytes: u64, unit: bool) -> String {
    let bytes = bytes as f64;
    if bytes > TOTAL_GB_THRESHOLD {
        with_unit(format!("{:5.1}", bytes / GIB), unit, "GB")
    } else {
        with_unit(format!("{:5.1}", bytes / MIB), unit, "MB")
    }
}

fn net_rate(rate: f64, unit: bool) -> String {
    if rate > RATE_MB_THRESHOLD {
        with_unit(format!("{:6.2}", rate / MIB), unit, "MB")
    } else {
        with_unit(format!("{:6.2}", rate / KIB), unit, "KB")
    }
}

fn temperature(celsius: Option<f32>, unit: bool, cels: bool) -> String {
    let Some(celsius) = celsius else {
        return PLACEHOLDER.to_string();
    };
    if cels {
        with_unit(format!("{:4.1}", celsius), unit, "℃")
    } else {
        with_unit(format!("{:5.1}", celsius * 1.8 + 32.0), unit, "℉")
    }
}

fn uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let rest = seconds % 86_400;
    let clock = format!("{:>2}:{:02}:{:02}", rest / 3600, rest % 3600 / 60, rest % 60);
    if days > 0 {
        format!("{days} days, {clock}")
    } else {
        clock
    }
}

/// Format one metric from a set of readings.
pub fn format_metric(kind: MetricKind, readings: &Readings, unit: bool, cels: bool) -> String {
    match kind {
        MetricKind::CpuFreq => with_unit(format!("{:4.2}", readings.cpu_freq / 1000.0), unit, "GHz"),
        MetricKind::CpuUsage => with_unit(format!("{:4.1}", readings.cpu_usage), unit, "%"),
        MetricKind::CpuFreqMax => {
            let max = readings.core_freq.iter().copied().max().unwrap_or(0);
            with_unit(format!("{:4.2}", max as f64 / 1000.0), unit, "GHz")
        }
        MetricKind::CpuUsageMax => {
            let max = readings.core_usage.iter().copied().fold(0.0f32, f32::max);
            with_unit(format!("{:4.1}", max), unit, "%")
        }
        MetricKind::CpuCoreFreq(i) => match readings.core_freq.get(i) {
            Some(freq) => with_unit(format!("{:3.1}", *freq as f64), unit, "MHz"),
            None => PLACEHOLDER.to_string(),
        },
        MetricKind::CpuCoreUsage(i) => match readings.core_usage.get(i) {
            Some(usage) => with_unit(format!("{:4.1}", usage), unit, "%"),
            None => PLACEHOLDER.to_string(),
        },
        MetricKind::MemoryUsage => with_unit(format!("{:4.1}", readings.memory_usage), unit, "%"),
        MetricKind::MemoryFree => {
            with_unit(format!("{:5.2}", readings.memory_free as f64 / GIB), unit, "GB")
        }
        MetricKind::SwapUsage => with_unit(format!("{:4.1}", readings.swap_usage), unit, "%"),
        MetricKind::SwapFree => {
            with_unit(format!("{:5.2}", readings.swap_free as f64 / GIB), unit, "GB")
        }
        MetricKind::DiskWrite => total_size(readings.disk_written, unit),
        MetricKind::DiskRead => total_size(readings.disk_read, unit),
        MetricKind::DiskWriteRate => {
            with_unit(format!("{:5.1}", readings.disk_write_rate / MIB), unit, "MB")
        }
        MetricKind::DiskReadRate => {
            with_unit(format!("{:5.1}", readings.disk_read_rate / MIB), unit, "MB")
        }
        MetricKind::NetSent => total_size(readings.net_sent, unit),
        MetricKind::NetRecv => total_size(readings.net_recv, unit),
        MetricKind::NetSentRate => net_rate(readings.net_sent_rate, unit),
        MetricKind::NetRecvRate => net_rate(readings.net_recv_rate, unit),
        MetricKind::CpuTemp(i) => temperature(readings.cpu_temps.get(i).copied(), unit, cels),
        MetricKind::DiskTemp(i) => temperature(readings.disk_temps.get(i).copied(), unit, cels),
        MetricKind::MiscTemp(i) => temperature(readings.misc_temps.get(i).copied(), unit, cels),
        MetricKind::SystemLoad => format!(
            "{:5.2}, {:5.2}, {:5.2}",
            readings.load[0], readings.load[1], readings.load[2]
        ),
        MetricKind::SystemUptime => uptime(readings.uptime),
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 * 100.0 / total as f64
    }
}

fn rate(current: u64, previous: u64, elapsed: f64) -> f64 {
    if elapsed <= 0.0 {
        0.0
    } else {
        current.saturating_sub(previous) as f64 / elapsed
    }
}

struct SensorState {
    system: System,
    networks: Networks,
    disks: Disks,
    components: Components,
    topology: Topology,
    registry: HashMap<String, Metric>,
    readings: Readings,
    last_refresh: Option<Instant>,
}

impl SensorState {
    fn new() -> Self {
        Self {
            system: System::new(),
            networks: Networks::new_with_refreshed_list(),
            disks: Disks::new_with_refreshed_list(),
            components: Components::new_with_refreshed_list(),
            topology: Topology::default(),
            registry: build_registry(&Topology::default()),
            readings: Readings::default(),
            last_refresh: None,
        }
    }

    fn refresh_if_stale(&mut self) {
        let now = Instant::now();
        let elapsed = match self.last_refresh {
            Some(last) if now.duration_since(last) < REFRESH_INTERVAL => return,
            Some(last) => now.duration_since(last).as_secs_f64(),
            None => 0.0,
        };
        self.last_refresh = Some(now);
        self.refresh(elapsed);
    }

    fn refresh(&mut self, elapsed: f64) {
        self.system.refresh_cpu_usage();
        self.system.refresh_cpu_frequency();
        self.system.refresh_memory();
        self.networks.refresh(true);
        self.disks.refresh(true);
        self.components.refresh(true);

        let cpus = self.system.cpus();
        let core_freq: Vec<u64> = cpus.iter().map(|cpu| cpu.frequency()).collect();
        let core_usage: Vec<f32> = cpus.iter().map(|cpu| cpu.cpu_usage()).collect();
        let cpu_freq = if core_freq.is_empty() {
            0.0
        } else {
            core_freq.iter().sum::<u64>() as f64 / core_freq.len() as f64
        };

        let (net_sent, net_recv) = self
            .networks
            .iter()
            .fold((0u64, 0u64), |(sent, recv), (_, data)| {
                (sent + data.total_transmitted(), recv + data.total_received())
            });
        let (disk_written, disk_read) = self.disks.iter().fold((0u64, 0u64), |(w, r), disk| {
            let usage = disk.usage();
            (w + usage.total_written_bytes, r + usage.total_read_bytes)
        });

        let mut topology = Topology {
            cores: cpus.len(),
            ..Topology::default()
        };
        let mut cpu_temps = Vec::new();
        let mut disk_temps = Vec::new();
        let mut misc_temps = Vec::new();
        for component in self.components.iter() {
            let Some(celsius) = component.temperature() else {
                continue;
            };
            let label = component.label().to_string();
            match classify_temperature(&label) {
                TempGroup::Cpu => {
                    topology.cpu_temps.push(label);
                    cpu_temps.push(celsius);
                }
                TempGroup::Disk => {
                    topology.disk_temps.push(label);
                    disk_temps.push(celsius);
                }
                TempGroup::Misc => {
                    topology.misc_temps.push(label);
                    misc_temps.push(celsius);
                }
            }
        }

        if topology != self.topology {
            log::debug!(
                "Sensor topology changed: {} cores, {} cpu / {} disk / {} misc temperature sensors",
                topology.cores,
                topology.cpu_temps.len(),
                topology.disk_temps.len(),
                topology.misc_temps.len()
            );
            self.registry = build_registry(&topology);
            self.topology = topology;
        }

        let load = System::load_average();
        let previous = &self.readings;
        let readings = Readings {
            cpu_usage: self.system.global_cpu_usage(),
            cpu_freq,
            core_usage,
            core_freq,
            memory_usage: percent(self.system.used_memory(), self.system.total_memory()),
            memory_free: self.system.free_memory(),
            swap_usage: percent(self.system.used_swap(), self.system.total_swap()),
            swap_free: self.system.free_swap(),
            disk_written,
            disk_read,
            disk_write_rate: rate(disk_written, previous.disk_written, elapsed),
            disk_read_rate: rate(disk_read, previous.disk_read, elapsed),
            net_sent,
            net_recv,
            net_sent_rate: rate(net_sent, previous.net_sent, elapsed),
            net_recv_rate: rate(net_recv, previous.net_recv, elapsed),
            cpu_temps,
            disk_temps,
            misc_temps,
            load: [load.one, load.five, load.fifteen],
            uptime: System::uptime(),
        };
        self.readings = readings;
    }
}

/// Live system sensors backed by sysinfo.
pub struct Sensors {
    state: Mutex<SensorState>,
}

impl Default for Sensors {
    fn default() -> Self {
        Self::new()
    }
}

impl Sensors {
    pub fn new() -> Self {
        let mut state = SensorState::new();
        state.refresh_if_stale();
        log::debug!("Sensors initialized with {} keys", state.registry.len());
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SensorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// All registered keys with their descriptions, sorted by key.
    pub fn keys(&self) -> Vec<(String, String)> {
        let mut state = self.lock();
        state.refresh_if_stale();
        let mut keys: Vec<(String, String)> = state
            .registry
            .iter()
            .map(|(key, metric)| (key.clone(), metric.description.clone()))
            .collect();
        keys.sort();
        keys
    }
}

impl SensorFormatter for Sensors {
    fn format(&self, key: &str, unit: bool, cels: bool) -> (String, String) {
        let mut state = self.lock();
        state.refresh_if_stale();

        match state.registry.get(key) {
            Some(metric) => (
                format_metric(metric.kind, &state.readings, unit, cels),
                metric.description.clone(),
            ),
            None => (PLACEHOLDER.to_string(), PLACEHOLDER.to_string()),
        }
    }
}
