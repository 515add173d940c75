use std::fmt;

/// Compute backend a stage runs on.
///
/// The envelope disambiguation rules branch on backend kind: accelerated
/// backends carry compact integer masks on the wire, and the restricted
/// backend requires boolean attention masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    /// Host CPU
    #[default]
    Cpu,
    /// General-purpose accelerator with device index
    Gpu(usize),
    /// Restricted accelerator (boolean masks only) with device index
    Npu(usize),
}

impl Device {
    /// Whether this is the host CPU.
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    /// Whether this backend accepts compact integer mask encodings.
    pub fn is_accelerated(&self) -> bool {
        matches!(self, Device::Gpu(_))
    }

    /// Whether this backend requires boolean attention masks.
    pub fn is_restricted(&self) -> bool {
        matches!(self, Device::Npu(_))
    }

    /// Get the accelerator index, if applicable.
    pub fn index(&self) -> Option<usize> {
        match self {
            Device::Gpu(idx) | Device::Npu(idx) => Some(*idx),
            Device::Cpu => None,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(idx) => write!(f, "gpu:{idx}"),
            Device::Npu(idx) => write!(f, "npu:{idx}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_properties() {
        assert!(Device::Cpu.is_cpu());
        assert!(!Device::Cpu.is_accelerated());
        assert!(Device::Gpu(0).is_accelerated());
        assert!(!Device::Gpu(0).is_restricted());
        assert!(Device::Npu(2).is_restricted());
        assert_eq!(Device::Npu(2).index(), Some(2));
        assert_eq!(Device::Cpu.index(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Device::Cpu), "cpu");
        assert_eq!(format!("{}", Device::Gpu(1)), "gpu:1");
        assert_eq!(format!("{}", Device::Npu(0)), "npu:0");
    }
}
