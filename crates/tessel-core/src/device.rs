use std::fmt;
use std::str::FromStr;

/// Where a tensor's storage is resident.
///
/// Operands of one dispatch call must all report the same device. The
/// reference backend keeps bytes in host memory for every device and runs
/// kernels on the host; the tag is what validation checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    /// Accelerator with device ordinal
    Cuda(usize),
}

impl Device {
    /// Accelerator ordinal, if any.
    pub fn ordinal(&self) -> Option<usize> {
        match self {
            Device::Cuda(idx) => Some(*idx),
            Device::Cpu => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Device::Cpu),
            "cuda" => Ok(Device::Cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|idx| idx.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| format!("unknown device '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_properties() {
        assert_eq!(Device::Cuda(1).ordinal(), Some(1));
        assert_eq!(Device::Cpu.ordinal(), None);
        assert_eq!(Device::default(), Device::Cpu);
    }

    #[test]
    fn test_parse_display() {
        assert_eq!("cuda:3".parse::<Device>().unwrap(), Device::Cuda(3));
        assert_eq!("cuda".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!(Device::Cuda(0).to_string(), "cuda:0");
        assert!("tpu:0".parse::<Device>().is_err());
    }
}
