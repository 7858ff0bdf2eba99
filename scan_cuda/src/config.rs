use std::env;
use std::str::FromStr;

/// Device construction settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanConfig {
    /// Execution streams created per device. Stream ids run from `0`.
    pub streams_per_device: usize,

    /// Scratch budget in bytes for host devices. `None` means unbounded.
    pub memory_limit: Option<usize>,

    /// Whether CUDA devices compare scratch requests against free VRAM before
    /// allocating.
    pub mem_check: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            streams_per_device: 2,
            memory_limit: None,
            mem_check: true,
        }
    }
}

impl ScanConfig {
    /// Reads `SCAN_STREAMS_PER_DEVICE`, `SCAN_MEMORY_LIMIT` and `SCAN_MEM_CHECK`
    /// on top of the defaults. Malformed values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(streams) = parse_var::<usize>(&lookup, "SCAN_STREAMS_PER_DEVICE") {
            if streams == 0 {
                log::warn!("ignoring SCAN_STREAMS_PER_DEVICE=0");
            } else {
                config.streams_per_device = streams;
            }
        }
        if let Some(limit) = parse_var::<usize>(&lookup, "SCAN_MEMORY_LIMIT") {
            config.memory_limit = Some(limit);
        }
        if let Some(v) = lookup("SCAN_MEM_CHECK") {
            config.mem_check = v != "0" && v.to_lowercase() != "false";
        }
        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring malformed {}={:?}", key, raw);
            None
        }
    }
}
