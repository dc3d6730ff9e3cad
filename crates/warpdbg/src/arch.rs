//! Device architecture information.

/// Compute capability parsed from an SM type name such as `sm_75`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ComputeCapability {
    pub major: u32,
    pub minor: u32,
}

impl ComputeCapability {
    /// Parse `sm_<major><minor>`; the last digit is the minor version.
    pub fn parse(sm_type: &str) -> Option<Self> {
        let digits = sm_type.strip_prefix("sm_")?;
        let digits: String = digits.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.len() < 2 {
            return None;
        }
        let (major, minor) = digits.split_at(digits.len() - 1);
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }

    /// Autostep needs per-warp multi-instruction stepping, available from 2.0.
    pub fn supports_autostep(&self) -> bool {
        self.major >= 2
    }
}

/// Whether a device with this SM type can autostep.
///
/// Unparseable names are assumed to be newer architectures; only the `sm_1*`
/// family is rejected.
pub fn sm_type_supports_autostep(sm_type: &str) -> bool {
    match ComputeCapability::parse(sm_type) {
        Some(cc) => cc.supports_autostep(),
        None => !sm_type.starts_with("sm_1"),
    }
}
