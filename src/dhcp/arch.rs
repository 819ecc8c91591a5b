//! Client system architecture (DHCP option 93, RFC 4578).

use std::fmt;

/// Firmware family reported by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientArch {
    IntelX86Bios,
    NecPc98,
    Efi386,
    EfiBC,
    EfiX64,
    EfiX64Alt,
    EfiArm32,
    EfiArm64,
    Unknown(u16),
}

impl ClientArch {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::IntelX86Bios,
            1 => Self::NecPc98,
            2 => Self::Efi386,
            6 => Self::EfiBC,
            7 => Self::EfiX64,
            9 => Self::EfiX64Alt,
            10 => Self::EfiArm32,
            11 => Self::EfiArm64,
            other => Self::Unknown(other),
        }
    }

    /// True for firmware that accepts an HTTP URL in option 67
    /// (UEFI HTTP Boot).
    pub fn supports_http_boot(&self) -> bool {
        matches!(self, Self::EfiX64 | Self::EfiX64Alt | Self::EfiArm64)
    }

    /// iPXE binary name for this architecture.
    pub fn ipxe_binary(&self) -> &'static str {
        match self {
            Self::EfiX64 | Self::EfiX64Alt => "ipxe.efi",
            Self::EfiArm64 => "snp.efi",
            Self::Efi386 => "ipxe32.efi",
            _ => "undionly.kpxe",
        }
    }
}

impl fmt::Display for ClientArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IntelX86Bios => write!(f, "x86 BIOS"),
            Self::NecPc98 => write!(f, "NEC/PC98"),
            Self::Efi386 => write!(f, "EFI x86"),
            Self::EfiBC => write!(f, "EFI BC"),
            Self::EfiX64 => write!(f, "EFI x64"),
            Self::EfiX64Alt => write!(f, "EFI x64"),
            Self::EfiArm32 => write!(f, "EFI ARM32"),
            Self::EfiArm64 => write!(f, "EFI ARM64"),
            Self::Unknown(code) => write!(f, "Unknown({code})"),
        }
    }
}
