use std::fmt;
use std::str::FromStr;

use crate::error::VmError;

/// Size of a derived disk, e.g. `20G`. Binary units (1G = 1024³ bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSize {
    bytes: u64,
}

impl DiskSize {
    pub fn bytes(self) -> u64 {
        self.bytes
    }
}

impl FromStr for DiskSize {
    type Err = VmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(VmError::Validation {
                message: "disk size cannot be empty".into(),
            });
        }

        let (num_str, suffix) = match s.find(|c: char| c.is_ascii_alphabetic()) {
            Some(i) => (&s[..i], s[i..].to_ascii_uppercase()),
            None => (s, String::new()),
        };

        let num: u64 = num_str.trim().parse().map_err(|_| VmError::Validation {
            message: format!("invalid disk size: '{s}'"),
        })?;

        let shift = match suffix.as_str() {
            "" => 0,
            "K" | "KB" | "KIB" => 10,
            "M" | "MB" | "MIB" => 20,
            "G" | "GB" | "GIB" => 30,
            "T" | "TB" | "TIB" => 40,
            _ => {
                return Err(VmError::Validation {
                    message: format!("unknown size suffix '{suffix}' (use K, M, G or T)"),
                });
            }
        };

        let bytes = num
            .checked_mul(1u64 << shift)
            .filter(|b| *b > 0)
            .ok_or_else(|| VmError::Validation {
                message: format!("disk size out of range: '{s}'"),
            })?;
        Ok(Self { bytes })
    }
}

/// Renders in the largest whole unit, which `qemu-img` accepts verbatim.
impl fmt::Display for DiskSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (shift, unit) in [(40, "T"), (30, "G"), (20, "M"), (10, "K")] {
            let unit_bytes = 1u64 << shift;
            if self.bytes % unit_bytes == 0 {
                return write!(f, "{}{unit}", self.bytes / unit_bytes);
            }
        }
        write!(f, "{}", self.bytes)
    }
}

/// VM names double as directory and domain names.
pub fn validate_vm_name(name: &str) -> Result<(), VmError> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(VmError::Validation {
            message: format!("VM name must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"),
        });
    }
    Ok(())
}
