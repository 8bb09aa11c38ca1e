/// Error type for all control-plane operations.
///
/// Read/validation failures abort an operation before any kernel mutation;
/// execution failures during a mutating operation are reported after the
/// metadata has been updated to reflect whatever did complete.
#[derive(Debug, thiserror::Error)]
pub enum VpcError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} '{name}' already exists")]
    Exists { kind: &'static str, name: String },

    #[error("invalid CIDR '{cidr}': {reason}")]
    CidrInvalid { cidr: String, reason: String },

    #[error("CIDR {cidr} overlaps existing subnet range {other}")]
    CidrOverlap { cidr: String, other: String },

    #[error("CIDR {cidr} is not contained in VPC range {vpc_cidr}")]
    CidrOutOfRange { cidr: String, vpc_cidr: String },

    #[error("malformed policy: {0}")]
    PolicyMalformed(String),

    #[error("no subnet matches policy CIDR {0}")]
    NoMatchingSubnet(String),

    #[error("command `{}` failed: {}", .cmd.join(" "), .stderr.trim())]
    Exec { cmd: Vec<String>, stderr: String },

    #[error("command `{}` exceeded {}s", .cmd.join(" "), .timeout_secs)]
    Timeout { cmd: Vec<String>, timeout_secs: u64 },

    #[error("state file {path} is corrupt: {reason}")]
    StateCorrupt { path: String, reason: String },

    #[error("operation requires root privilege")]
    Privilege,

    #[error("cannot peer VPC '{0}' with itself")]
    SelfPeer(String),

    #[error("VPCs '{a}' and '{b}' are already peered")]
    AlreadyPeered { a: String, b: String },

    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl VpcError {
    /// Distinct process exit code per error kind, for the CLI driver.
    pub fn exit_code(&self) -> i32 {
        match self {
            VpcError::NotFound { .. } => 3,
            VpcError::Exists { .. } => 4,
            VpcError::CidrInvalid { .. } => 5,
            VpcError::CidrOverlap { .. } => 6,
            VpcError::CidrOutOfRange { .. } => 7,
            VpcError::PolicyMalformed(_) => 8,
            VpcError::NoMatchingSubnet(_) => 9,
            VpcError::SelfPeer(_) => 10,
            VpcError::AlreadyPeered { .. } => 11,
            VpcError::Exec { .. } => 12,
            VpcError::Timeout { .. } => 13,
            VpcError::StateCorrupt { .. } => 14,
            VpcError::Privilege => 15,
            VpcError::Serialization(_) => 14,
            VpcError::Io(_) => 16,
            VpcError::InvalidName { .. } => 17,
        }
    }
}

pub type Result<T> = std::result::Result<T, VpcError>;
