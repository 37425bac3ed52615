//! TOML stack configuration
//!
//! Describes the flash device, the optional layer settings and the partition
//! table:
//!
//! ```toml
//! [device]
//! image = "flash.bin"
//! size = "1 MiB"
//! code_bank_end = 0x80000
//! swap_indicator = 0x7F000
//!
//! [encryption]
//! key_partition = "keys"
//! key_offset = 0
//! window = 64
//!
//! [[partition]]
//! name = "keys"
//! start = 0xF0000
//! size = "4 KiB"
//! drivers = ["intflash"]
//!
//! [[partition]]
//! name = "config"
//! start = 0xF1000
//! size = "4 KiB"
//! drivers = ["cache", "intflash"]
//! update_rate = 3600
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::types::{Medium, PartitionFlags, DEFAULT_ERASE_BLOCK_SIZE};

/// Default flash size when the device section omits it
pub const DEFAULT_DEVICE_SIZE: u32 = 1024 * 1024;
/// Default completion timeout for commands on the other bank
pub const DEFAULT_COMPLETION_TIMEOUT_MS: u64 = 2000;
/// Default cipher window
pub const DEFAULT_CIPHER_WINDOW: u32 = 64;

/// Configuration loading failures
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read stack file: {0}")]
    Io(#[from] std::io::Error),
    /// File is not valid TOML for this schema
    #[error("failed to parse stack file: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value is syntactically valid but unusable
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Driver kinds that can be named in a partition's driver list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// RAM mirror with CRC trailer
    Cache,
    /// AES window cipher
    Encrypt,
    /// Erase sectors ahead of sequential writes
    PreErase,
    /// Raw internal flash
    Intflash,
    /// Volatile byte store
    Ram,
}

/// Flash device settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Image file backing the simulated flash
    pub image: Option<PathBuf>,
    /// Flash size in bytes
    pub size: u32,
    /// Erase sector size in bytes
    pub sector_size: u32,
    /// Addresses below this belong to the bank executing code
    pub code_bank_end: u32,
    /// Swap indicator address used by the bank-swap commands
    pub swap_indicator: u32,
    /// Completion wait for commands on the other bank
    pub completion_timeout_ms: u64,
}

/// Encryption layer settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionConfig {
    /// Partition holding the key record
    pub key_partition: String,
    /// Offset of the key record inside that partition
    pub key_offset: u32,
    /// Cipher window in bytes
    pub window: u32,
}

/// Cache layer settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheSettings {
    /// Recompute the CRC trailer on every cached write
    pub refresh_trailer_on_write: bool,
}

/// One partition entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionConfig {
    /// Partition name
    pub name: String,
    /// Physical start on the medium
    pub start: u32,
    /// Reserved size
    pub size: u32,
    /// Drivers, top first
    pub drivers: Vec<DriverKind>,
    /// Capability flags (the cached flag follows from the driver list)
    pub flags: PartitionFlags,
    /// Update rate rating for searches
    pub max_update_rate_secs: Option<u32>,
    /// Bank count
    pub banks: u8,
    /// Backing medium
    pub medium: Medium,
    /// Free-form description
    pub description: String,
}

impl PartitionConfig {
    /// Whether the chain includes the cache layer
    pub fn is_cached(&self) -> bool {
        self.drivers.contains(&DriverKind::Cache)
    }
}

/// Whole stack configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    /// Flash device settings
    pub device: DeviceConfig,
    /// Encryption settings, required when any partition uses the cipher
    pub encryption: Option<EncryptionConfig>,
    /// Cache settings
    pub cache: CacheSettings,
    /// Partitions in table order
    pub partitions: Vec<PartitionConfig>,
}

#[derive(Debug, Deserialize)]
struct TomlStackFile {
    device: TomlDevice,
    encryption: Option<TomlEncryption>,
    cache: Option<TomlCache>,
    #[serde(default)]
    partition: Vec<TomlPartition>,
}

#[derive(Debug, Deserialize)]
struct TomlDevice {
    image: Option<PathBuf>,
    size: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_hex_u32")]
    sector_size: Option<u32>,
    #[serde(deserialize_with = "deserialize_hex_u32")]
    code_bank_end: u32,
    #[serde(default, deserialize_with = "deserialize_opt_hex_u32")]
    swap_indicator: Option<u32>,
    completion_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TomlEncryption {
    key_partition: String,
    #[serde(default, deserialize_with = "deserialize_opt_hex_u32")]
    key_offset: Option<u32>,
    window: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct TomlCache {
    #[serde(default)]
    refresh_trailer_on_write: bool,
}

#[derive(Debug, Deserialize)]
struct TomlPartition {
    name: String,
    #[serde(deserialize_with = "deserialize_hex_u32")]
    start: u32,
    size: String,
    drivers: Vec<DriverKind>,
    update_rate: Option<u32>,
    #[serde(default)]
    banks: u8,
    #[serde(default)]
    description: String,
    spi: Option<TomlSpi>,
    #[serde(default)]
    auto_erase: bool,
    #[serde(default)]
    dfw: bool,
    #[serde(default)]
    filesystem: bool,
    #[serde(default)]
    whole_device: bool,
}

#[derive(Debug, Deserialize)]
struct TomlSpi {
    bus: u8,
    chip_select: u8,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HexOrInt {
    Int(u32),
    Str(String),
}

/// Deserialize a u32 that can be hex (0x...) or decimal
fn deserialize_hex_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match HexOrInt::deserialize(deserializer)? {
        HexOrInt::Int(n) => Ok(n),
        HexOrInt::Str(s) => parse_number(&s).map_err(serde::de::Error::custom),
    }
}

fn deserialize_opt_hex_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    deserialize_hex_u32(deserializer).map(Some)
}

/// Parse a number that can be hex (0x...) or decimal
pub fn parse_number(s: &str) -> Result<u32, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("invalid hex: {}", e))
    } else {
        s.parse().map_err(|e| format!("invalid number: {}", e))
    }
}

/// Parse a size string like "4 KiB", "0x1000" or "4096"
pub fn parse_size(s: &str) -> Result<u32, String> {
    let s = s.trim();

    if let Ok(n) = parse_number(s) {
        return Ok(n);
    }

    let s_lower = s.to_lowercase();
    let (num_str, multiplier) = if let Some(n) = s_lower.strip_suffix("mib") {
        (n.trim(), 1024 * 1024)
    } else if let Some(n) = s_lower.strip_suffix("kib") {
        (n.trim(), 1024)
    } else if let Some(n) = s_lower.strip_suffix('b') {
        (n.trim(), 1)
    } else {
        return Err(format!("invalid size: {}", s));
    };

    let num: u32 = num_str.parse().map_err(|_| format!("invalid size: {}", s))?;
    num.checked_mul(multiplier)
        .ok_or_else(|| format!("size too large: {}", s))
}

impl StackConfig {
    /// Load a stack description from a TOML file
    ///
    /// A relative image path is resolved against the file's directory.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        if let (Some(image), Some(dir)) = (config.device.image.as_mut(), path.parent()) {
            if image.is_relative() {
                *image = dir.join(&*image);
            }
        }
        Ok(config)
    }

    /// Parse a stack description from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: TomlStackFile = toml::from_str(content)?;

        let size = match file.device.size {
            Some(s) => parse_size(&s).map_err(ConfigError::Invalid)?,
            None => DEFAULT_DEVICE_SIZE,
        };
        let sector_size = file.device.sector_size.unwrap_or(DEFAULT_ERASE_BLOCK_SIZE);
        if sector_size == 0 || size % sector_size != 0 {
            return Err(ConfigError::Invalid(format!(
                "device size {} is not a multiple of sector size {}",
                size, sector_size
            )));
        }
        let device = DeviceConfig {
            image: file.device.image,
            size,
            sector_size,
            code_bank_end: file.device.code_bank_end,
            swap_indicator: file
                .device
                .swap_indicator
                .unwrap_or(file.device.code_bank_end.saturating_sub(sector_size)),
            completion_timeout_ms: file
                .device
                .completion_timeout_ms
                .unwrap_or(DEFAULT_COMPLETION_TIMEOUT_MS),
        };

        let encryption = match file.encryption {
            Some(enc) => {
                let window = enc.window.unwrap_or(DEFAULT_CIPHER_WINDOW);
                if window == 0 || window % 16 != 0 {
                    return Err(ConfigError::Invalid(format!(
                        "cipher window {} is not a multiple of 16",
                        window
                    )));
                }
                Some(EncryptionConfig {
                    key_partition: enc.key_partition,
                    key_offset: enc.key_offset.unwrap_or(0),
                    window,
                })
            }
            None => None,
        };

        let cache = CacheSettings {
            refresh_trailer_on_write: file.cache.map(|c| c.refresh_trailer_on_write).unwrap_or(false),
        };

        let mut partitions = Vec::with_capacity(file.partition.len());
        for p in file.partition {
            partitions.push(convert_partition(p)?);
        }

        let config = Self {
            device,
            encryption,
            cache,
            partitions,
        };
        config.check_references()?;
        Ok(config)
    }

    /// Partition entry by name
    pub fn partition(&self, name: &str) -> Option<&PartitionConfig> {
        self.partitions.iter().find(|p| p.name == name)
    }

    fn check_references(&self) -> Result<(), ConfigError> {
        let uses_cipher = self
            .partitions
            .iter()
            .any(|p| p.drivers.contains(&DriverKind::Encrypt));
        match &self.encryption {
            Some(enc) => {
                let key_part = self.partition(&enc.key_partition).ok_or_else(|| {
                    ConfigError::Invalid(format!("key partition '{}' not found", enc.key_partition))
                })?;
                if key_part.drivers.contains(&DriverKind::Encrypt) {
                    return Err(ConfigError::Invalid(
                        "key partition cannot itself be encrypted".into(),
                    ));
                }
            }
            None if uses_cipher => {
                return Err(ConfigError::Invalid(
                    "encrypted partitions need an [encryption] section".into(),
                ));
            }
            None => {}
        }

        for p in &self.partitions {
            if p.medium == Medium::Internal && p.start as u64 + p.size as u64 > self.device.size as u64 {
                return Err(ConfigError::Invalid(format!(
                    "partition '{}' extends past the end of the device",
                    p.name
                )));
            }
        }
        Ok(())
    }
}

fn convert_partition(p: TomlPartition) -> Result<PartitionConfig, ConfigError> {
    let size = parse_size(&p.size).map_err(ConfigError::Invalid)?;
    let (last, upper) = match p.drivers.split_last() {
        Some(split) => split,
        None => {
            return Err(ConfigError::Invalid(format!(
                "partition '{}' has an empty driver list",
                p.name
            )))
        }
    };
    if upper
        .iter()
        .any(|d| matches!(d, DriverKind::Intflash | DriverKind::Ram))
    {
        return Err(ConfigError::Invalid(format!(
            "partition '{}': terminal drivers must come last",
            p.name
        )));
    }
    if !matches!(last, DriverKind::Intflash | DriverKind::Ram) {
        return Err(ConfigError::Invalid(format!(
            "partition '{}': driver list must end with a medium driver",
            p.name
        )));
    }

    let medium = match (last, &p.spi) {
        (DriverKind::Ram, _) => Medium::Ram,
        (_, Some(spi)) => Medium::Spi {
            bus: spi.bus,
            chip_select: spi.chip_select,
        },
        _ => Medium::Internal,
    };

    let mut flags = PartitionFlags::empty();
    flags.set(PartitionFlags::BANKED, p.banks > 0);
    flags.set(PartitionFlags::CACHED, p.drivers.contains(&DriverKind::Cache));
    flags.set(PartitionFlags::AUTO_ERASE_BANK, p.auto_erase);
    flags.set(PartitionFlags::DFW_UPDATABLE, p.dfw);
    flags.set(PartitionFlags::FILE_SYSTEM, p.filesystem);
    flags.set(PartitionFlags::WHOLE_DEVICE, p.whole_device);

    Ok(PartitionConfig {
        name: p.name,
        start: p.start,
        size,
        drivers: p.drivers,
        flags,
        max_update_rate_secs: p.update_rate,
        banks: p.banks,
        medium,
        description: p.description,
    })
}
