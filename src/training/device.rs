//! Device selection and GPU introspection
//!
//! Covers GPU availability, vendor-reported device properties and the
//! `auto` placement used by generation and fine-tuning.

use anyhow::Result;
use candle_core::Device;
use serde::{Deserialize, Serialize};

/// Environment variables that restrict which GPUs the runtime can see
pub const VISIBLE_DEVICE_VARS: [&str; 2] = ["CUDA_VISIBLE_DEVICES", "HIP_VISIBLE_DEVICES"];

/// Device preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    Cuda,
    Metal,
    Cpu,
    #[default]
    Auto,
}

impl std::str::FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cuda" | "gpu" | "cuda:0" => Ok(Self::Cuda),
            "metal" => Ok(Self::Metal),
            "cpu" => Ok(Self::Cpu),
            "auto" => Ok(Self::Auto),
            _ => Err(anyhow::anyhow!(
                "Invalid device preference: {}. Valid options: cuda, metal, cpu, auto",
                s
            )),
        }
    }
}

impl std::fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Metal => write!(f, "metal"),
            Self::Cpu => write!(f, "cpu"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

/// Select device based on preference
///
/// An explicit GPU request falls back to CPU (with a warning) when the
/// backend is missing or fails to initialise.
pub fn select_device(preference: DevicePreference) -> Result<Device> {
    match preference {
        DevicePreference::Cuda => {
            #[cfg(feature = "cuda")]
            {
                tracing::info!("Attempting to use CUDA device...");
                match Device::new_cuda(0) {
                    Ok(device) => {
                        tracing::info!("CUDA device selected");
                        Ok(device)
                    }
                    Err(e) => {
                        tracing::warn!("CUDA initialization failed: {}", e);
                        tracing::warn!("Falling back to CPU");
                        Ok(Device::Cpu)
                    }
                }
            }
            #[cfg(not(feature = "cuda"))]
            {
                tracing::warn!("CUDA requested but not compiled with 'cuda' feature");
                tracing::warn!("Falling back to CPU");
                Ok(Device::Cpu)
            }
        }

        DevicePreference::Metal => {
            #[cfg(feature = "metal")]
            {
                tracing::info!("Attempting to use Metal device...");
                match Device::new_metal(0) {
                    Ok(device) => {
                        tracing::info!("Metal device selected");
                        Ok(device)
                    }
                    Err(e) => {
                        tracing::warn!("Metal initialization failed: {}", e);
                        tracing::warn!("Falling back to CPU");
                        Ok(Device::Cpu)
                    }
                }
            }
            #[cfg(not(feature = "metal"))]
            {
                tracing::warn!("Metal requested but not compiled with 'metal' feature");
                tracing::warn!("Falling back to CPU");
                Ok(Device::Cpu)
            }
        }

        DevicePreference::Cpu => {
            tracing::info!("CPU device selected");
            Ok(Device::Cpu)
        }

        DevicePreference::Auto => {
            tracing::info!("Auto-selecting best available device...");

            #[cfg(feature = "cuda")]
            {
                if let Ok(device) = Device::new_cuda(0) {
                    tracing::info!("Auto-selected: CUDA GPU");
                    return Ok(device);
                }
            }

            #[cfg(feature = "metal")]
            {
                if let Ok(device) = Device::new_metal(0) {
                    tracing::info!("Auto-selected: Metal GPU");
                    return Ok(device);
                }
            }

            tracing::info!("Auto-selected: CPU");
            Ok(Device::Cpu)
        }
    }
}

/// Get information about the selected device
pub fn device_info(device: &Device) -> DeviceInfo {
    match device {
        Device::Cpu => DeviceInfo {
            device_type: "CPU".to_string(),
            name: format!("CPU ({} threads)", candle_core::utils::get_num_threads()),
            memory_gb: None,
            is_gpu: false,
        },
        Device::Cuda(_) => {
            let props = query_gpu_properties(0);
            DeviceInfo {
                device_type: "CUDA".to_string(),
                name: props
                    .as_ref()
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| "CUDA Device".to_string()),
                memory_gb: props.map(|p| p.memory_gb),
                is_gpu: true,
            }
        }
        Device::Metal(_) => DeviceInfo {
            device_type: "Metal".to_string(),
            name: "Metal Device".to_string(),
            memory_gb: None,
            is_gpu: true,
        },
    }
}

/// Information about a device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub device_type: String,
    pub name: String,
    pub memory_gb: Option<f32>,
    pub is_gpu: bool,
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.device_type)?;
        if let Some(mem) = self.memory_gb {
            write!(f, " - {:.1} GB", mem)?;
        }
        Ok(())
    }
}

/// Check if Metal is available
pub fn is_metal_available() -> bool {
    #[cfg(feature = "metal")]
    {
        Device::new_metal(0).is_ok()
    }
    #[cfg(not(feature = "metal"))]
    {
        false
    }
}

/// Number of CUDA devices that initialise successfully
pub fn cuda_device_count() -> usize {
    #[cfg(feature = "cuda")]
    {
        /// Upper bound when probing CUDA ordinals
        const MAX_PROBED_DEVICES: usize = 16;

        (0..MAX_PROBED_DEVICES)
            .take_while(|&ordinal| Device::new_cuda(ordinal).is_ok())
            .count()
    }
    #[cfg(not(feature = "cuda"))]
    {
        0
    }
}

/// Properties reported by the vendor tool for one GPU
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuProperties {
    pub ordinal: usize,
    pub name: String,
    pub memory_gb: f32,
    pub driver_version: Option<String>,
}

impl std::fmt::Display for GpuProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "_GpuProperties(name='{}', total_memory={:.1}GB",
            self.name, self.memory_gb
        )?;
        if let Some(driver) = &self.driver_version {
            write!(f, ", driver={}", driver)?;
        }
        write!(f, ")")
    }
}

/// Parse one line of
/// `nvidia-smi --query-gpu=name,memory.total,driver_version --format=csv,noheader,nounits`
pub fn parse_nvidia_smi_line(ordinal: usize, line: &str) -> Option<GpuProperties> {
    let parts: Vec<&str> = line.trim().split(',').map(str::trim).collect();
    if parts.len() < 2 || parts[0].is_empty() {
        return None;
    }

    let memory_mb: f32 = parts[1].parse().ok()?;
    let driver_version = parts
        .get(2)
        .filter(|d| !d.is_empty())
        .map(|d| d.to_string());

    Some(GpuProperties {
        ordinal,
        name: parts[0].to_string(),
        memory_gb: memory_mb / 1024.0,
        driver_version,
    })
}

/// Vendor id of the GPU a process ordinal maps to
///
/// `visible` is the value of a `*_VISIBLE_DEVICES` variable. Without one,
/// ordinals are physical indices.
pub fn physical_device_id(ordinal: usize, visible: Option<&str>) -> Option<String> {
    match visible {
        None => Some(ordinal.to_string()),
        Some(list) => list
            .split(',')
            .map(str::trim)
            .nth(ordinal)
            .filter(|id| !id.is_empty())
            .map(str::to_string),
    }
}

/// Parse `rocm-smi --showproductname --showmeminfo vram --showdriverversion --json`
///
/// Returns one entry per `cardN` key, ordered by card index, with `ordinal`
/// set to the physical card index.
pub fn parse_rocm_smi_json(json: &str) -> Option<Vec<GpuProperties>> {
    let root: serde_json::Value = serde_json::from_str(json).ok()?;
    let root = root.as_object()?;

    let driver_version = root
        .get("system")
        .and_then(|s| s.get("Driver version"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let mut devices: Vec<GpuProperties> = root
        .iter()
        .filter_map(|(key, card)| {
            let index: usize = key.strip_prefix("card")?.parse().ok()?;
            let name = ["Card series", "Device Name", "Card model"]
                .iter()
                .find_map(|field| {
                    card.get(*field)
                        .and_then(|v| v.as_str())
                        .filter(|name| !name.trim().is_empty())
                })?;
            let memory_bytes: f64 = card
                .get("VRAM Total Memory (B)")
                .and_then(|v| match v {
                    serde_json::Value::String(s) => s.trim().parse().ok(),
                    other => other.as_f64(),
                })
                .unwrap_or(0.0);

            Some(GpuProperties {
                ordinal: index,
                name: name.trim().to_string(),
                memory_gb: (memory_bytes / (1024.0 * 1024.0 * 1024.0)) as f32,
                driver_version: driver_version.clone(),
            })
        })
        .collect();
    devices.sort_by_key(|d| d.ordinal);
    Some(devices)
}

fn run_tool(program: &str, args: &[&str]) -> Option<String> {
    let output = std::process::Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        tracing::debug!("{} exited with {}", program, output.status);
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn visible_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Best-effort property query for one NVIDIA GPU ordinal
fn query_nvidia_properties(ordinal: usize) -> Option<GpuProperties> {
    let id = physical_device_id(ordinal, visible_var("CUDA_VISIBLE_DEVICES").as_deref())?;
    let id_arg = format!("--id={}", id);
    let stdout = run_tool(
        "nvidia-smi",
        &[
            "--query-gpu=name,memory.total,driver_version",
            "--format=csv,noheader,nounits",
            id_arg.as_str(),
        ],
    )?;
    stdout
        .lines()
        .next()
        .and_then(|line| parse_nvidia_smi_line(ordinal, line))
}

/// AMD GPUs visible to this process, renumbered from ordinal 0
pub fn query_rocm_devices() -> Vec<GpuProperties> {
    let Some(stdout) = run_tool(
        "rocm-smi",
        &["--showproductname", "--showmeminfo", "vram", "--showdriverversion", "--json"],
    ) else {
        return Vec::new();
    };
    let cards = parse_rocm_smi_json(&stdout).unwrap_or_default();
    let visible = visible_var("HIP_VISIBLE_DEVICES").or_else(|| visible_var("CUDA_VISIBLE_DEVICES"));
    select_visible(cards, visible.as_deref())
}

/// Keep the cards named by a visible-devices list, in list order
pub fn select_visible(cards: Vec<GpuProperties>, visible: Option<&str>) -> Vec<GpuProperties> {
    (0..cards.len())
        .map_while(|ordinal| physical_device_id(ordinal, visible))
        .filter_map(|id| {
            let index: usize = id.parse().ok()?;
            cards.iter().find(|card| card.ordinal == index).cloned()
        })
        .enumerate()
        .map(|(ordinal, card)| GpuProperties { ordinal, ..card })
        .collect()
}

/// Best-effort property query for one GPU ordinal
///
/// Tries `nvidia-smi`, then `rocm-smi`.
pub fn query_gpu_properties(ordinal: usize) -> Option<GpuProperties> {
    query_nvidia_properties(ordinal)
        .or_else(|| query_rocm_devices().into_iter().find(|d| d.ordinal == ordinal))
}

/// Snapshot of the GPU situation as seen by this process
#[derive(Debug, Clone, Serialize)]
pub struct GpuReport {
    pub version: String,
    pub compiled_backends: Vec<String>,
    pub visible_devices: Vec<(String, String)>,
    pub cuda_available: bool,
    pub metal_available: bool,
    pub cuda_device_count: usize,
    pub devices: Vec<GpuProperties>,
}

impl GpuReport {
    /// True when any GPU backend initialised
    pub fn gpu_available(&self) -> bool {
        self.cuda_available || self.metal_available
    }
}

/// Collect a GPU report
pub fn gpu_report() -> GpuReport {
    let mut compiled_backends = vec!["cpu".to_string()];
    if cfg!(feature = "cuda") {
        compiled_backends.push("cuda".to_string());
    }
    if cfg!(feature = "metal") {
        compiled_backends.push("metal".to_string());
    }

    let visible_devices = VISIBLE_DEVICE_VARS
        .iter()
        .filter_map(|var| std::env::var(var).ok().map(|v| (var.to_string(), v)))
        .collect();

    let cuda_device_count = cuda_device_count();
    let devices = if cuda_device_count > 0 {
        (0..cuda_device_count).filter_map(query_gpu_properties).collect()
    } else {
        query_rocm_devices()
    };

    GpuReport {
        version: env!("CARGO_PKG_VERSION").to_string(),
        compiled_backends,
        visible_devices,
        cuda_available: cuda_device_count > 0,
        metal_available: is_metal_available(),
        cuda_device_count,
        devices,
    }
}

impl std::fmt::Display for GpuReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "lmtune {}", self.version)?;
        writeln!(f, "Compiled backends: {}", self.compiled_backends.join(", "))?;
        for (var, value) in &self.visible_devices {
            writeln!(f, "{}={}", var, value)?;
        }

        if self.cuda_available {
            writeln!(f, "Number of CUDA devices: {}", self.cuda_device_count)?;
            match self.devices.first() {
                Some(props) => {
                    writeln!(f, "Using GPU: {}", props.name)?;
                    for props in &self.devices {
                        writeln!(f, "GPU {} details: {}", props.ordinal, props)?;
                    }
                }
                None => writeln!(f, "Using GPU: CUDA device 0 (properties unavailable)")?,
            }
        } else if self.metal_available {
            writeln!(f, "Using GPU: Metal device 0")?;
        } else {
            writeln!(f, "Using CPU")?;
            for props in &self.devices {
                writeln!(f, "GPU {} detected without a usable backend: {}", props.ordinal, props)?;
            }
        }
        Ok(())
    }
}
