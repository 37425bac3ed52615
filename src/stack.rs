//! Assemble a driver stack from a stack file
//!
//! The internal flash is simulated and backed by an image file, so the CLI
//! can operate on flash dumps. Partitions on a RAM medium share one volatile
//! array that is not saved.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use nvstack_cache::{CacheConfig, CacheDriver, TRAILER_LEN};
use nvstack_core::partition::config::PartitionConfig;
use nvstack_core::partition::{ConfigError, DriverKind};
use nvstack_core::{CacheRam, MemDriver, Medium, Partition, PartitionTable, StackConfig, TableError};
use nvstack_encrypt::{EncryptionDriver, PartitionKeyStore};
use nvstack_intflash::regs::SECTOR_SIZE;
use nvstack_intflash::{IntFlashConfig, IntFlashDriver};
use nvstack_preerase::PreEraseDriver;
use nvstack_sim::{RamDriver, SimFlash, SimFlashConfig};
use rand::RngCore;

/// Errors while assembling or persisting a stack
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    /// Stack file problem
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Partition table problem
    #[error(transparent)]
    Table(#[from] TableError),
    /// Driver failure
    #[error("driver error: {0}")]
    Driver(#[from] nvstack_core::Error),
    /// Image file problem
    #[error("image file {path:?}: {source}")]
    Image {
        /// Image path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// Stack cannot be built as described
    #[error("{0}")]
    Unsupported(String),
}

/// A ready-to-use partition table over a simulated device
pub struct Stack {
    table: PartitionTable,
    flash: Arc<IntFlashDriver<SimFlash>>,
    sim: SimFlash,
    image: Option<PathBuf>,
}

impl Stack {
    /// Build the stack described by `config`, then validate and open it
    pub fn open(config: &StackConfig) -> Result<Self, StackError> {
        let stack = Self::build(config)?;
        stack.table.validate()?;
        stack.table.init()?;
        Ok(stack)
    }

    /// Build the stack without opening any partition
    pub fn build(config: &StackConfig) -> Result<Self, StackError> {
        let device = &config.device;
        if device.sector_size as usize != SECTOR_SIZE {
            return Err(StackError::Unsupported(format!(
                "internal flash uses {} byte sectors, stack file says {}",
                SECTOR_SIZE, device.sector_size
            )));
        }

        let sim_config = SimFlashConfig {
            size: device.size as usize,
            sector_size: device.sector_size as usize,
        };
        let sim = match &device.image {
            Some(path) if path.exists() => {
                let data = fs::read(path).map_err(|source| StackError::Image {
                    path: path.clone(),
                    source,
                })?;
                if data.len() != device.size as usize {
                    log::warn!(
                        "Image {:?} is {} bytes, device is {}; contents will be truncated or padded",
                        path,
                        data.len(),
                        device.size
                    );
                }
                SimFlash::with_data(sim_config, &data)
            }
            _ => SimFlash::new(sim_config),
        };

        let flash = Arc::new(IntFlashDriver::new(
            sim.clone(),
            IntFlashConfig {
                flash_size: device.size,
                code_bank_end: device.code_bank_end,
                swap_indicator: device.swap_indicator,
                completion_timeout: Duration::from_millis(device.completion_timeout_ms),
            },
        ));

        let ram_size = config
            .partitions
            .iter()
            .filter(|p| p.medium == Medium::Ram)
            .map(|p| p.start as usize + p.size as usize)
            .max()
            .unwrap_or(0);
        let ram = Arc::new(RamDriver::new(ram_size));

        let mut builder = Builder {
            config,
            flash: flash.clone(),
            ram,
            cache: Arc::new(CacheDriver::new(CacheConfig {
                refresh_trailer_on_write: config.cache.refresh_trailer_on_write,
            })),
            preerase: Arc::new(PreEraseDriver::new()),
            encrypt: None,
        };

        // The key partition has to exist before any encrypted chain
        let mut built: Vec<Option<Arc<Partition>>> = vec![None; config.partitions.len()];
        if let Some(enc) = &config.encryption {
            let idx = config
                .partitions
                .iter()
                .position(|p| p.name == enc.key_partition)
                .ok_or_else(|| {
                    StackError::Unsupported(format!("key partition '{}' missing", enc.key_partition))
                })?;
            let key_part = Arc::new(builder.partition(&config.partitions[idx])?);
            let store = PartitionKeyStore::new(key_part.clone(), enc.key_offset);
            let layer = EncryptionDriver::new(store, enc.window as usize, rand::rngs::OsRng)?;
            builder.encrypt = Some(Arc::new(layer));
            built[idx] = Some(key_part);
        }

        let mut partitions = Vec::with_capacity(built.len());
        for (slot, part) in built.into_iter().zip(&config.partitions) {
            let part = match slot {
                Some(done) => done,
                None => Arc::new(builder.partition(part)?),
            };
            partitions.push(part);
        }

        Ok(Self {
            table: PartitionTable::from_shared(partitions),
            flash,
            sim,
            image: device.image.clone(),
        })
    }

    /// The partition table
    pub fn table(&self) -> &PartitionTable {
        &self.table
    }

    /// The internal flash driver
    pub fn flash(&self) -> &IntFlashDriver<SimFlash> {
        &self.flash
    }

    /// Simulated flash controller under the stack
    #[cfg(test)]
    pub(crate) fn sim(&self) -> &SimFlash {
        &self.sim
    }

    /// Image file backing the device, if any
    pub fn image(&self) -> Option<&Path> {
        self.image.as_deref()
    }

    /// Flush every partition and write the flash contents back to the image
    pub fn close(&self) -> Result<(), StackError> {
        self.table.flush_all()?;
        self.save()
    }

    /// Write the flash contents back to the image
    pub fn save(&self) -> Result<(), StackError> {
        if let Some(path) = &self.image {
            fs::write(path, self.sim.data()).map_err(|source| StackError::Image {
                path: path.clone(),
                source,
            })?;
            log::debug!("Saved flash image to {:?}", path);
        }
        Ok(())
    }
}

struct Builder<'a> {
    config: &'a StackConfig,
    flash: Arc<IntFlashDriver<SimFlash>>,
    ram: Arc<RamDriver>,
    cache: Arc<CacheDriver>,
    preerase: Arc<PreEraseDriver>,
    encrypt: Option<Arc<EncryptionDriver>>,
}

impl Builder<'_> {
    fn driver(&self, kind: DriverKind, p: &PartitionConfig) -> Result<Arc<dyn MemDriver>, StackError> {
        let driver: Arc<dyn MemDriver> = match kind {
            DriverKind::Cache => self.cache.clone(),
            DriverKind::Encrypt => self.encrypt.clone().ok_or_else(|| {
                StackError::Unsupported(format!(
                    "partition '{}' is encrypted but no key store is configured",
                    p.name
                ))
            })?,
            DriverKind::PreErase => self.preerase.clone(),
            DriverKind::Intflash if p.medium == Medium::Internal => self.flash.clone(),
            DriverKind::Intflash => {
                return Err(StackError::Unsupported(format!(
                    "partition '{}': only internal flash is simulated",
                    p.name
                )))
            }
            DriverKind::Ram => self.ram.clone(),
        };
        Ok(driver)
    }

    fn partition(&self, p: &PartitionConfig) -> Result<Partition, StackError> {
        let drivers = p
            .drivers
            .iter()
            .map(|&kind| self.driver(kind, p))
            .collect::<Result<Vec<_>, _>>()?;

        if p.drivers.contains(&DriverKind::Encrypt) {
            let window = self.config.encryption.as_ref().map_or(0, |e| e.window);
            if window == 0 || p.size % window != 0 {
                return Err(StackError::Unsupported(format!(
                    "partition '{}': size is not a multiple of the cipher window",
                    p.name
                )));
            }
        }

        let mut builder = Partition::builder(p.name.clone(), p.start, p.size)
            .drivers(drivers)
            .medium(p.medium)
            .description(p.description.clone())
            .flags(p.flags);
        if let Some(rate) = p.max_update_rate_secs {
            builder = builder.max_update_rate_secs(rate);
        }
        if p.banks > 0 {
            builder = builder.banks(p.banks);
        }
        if p.is_cached() {
            let data_size = p.size.checked_sub(TRAILER_LEN as u32).ok_or_else(|| {
                StackError::Unsupported(format!("partition '{}' too small to cache", p.name))
            })?;
            // RAM holds whatever was there at power-up
            let mut ram = vec![0u8; data_size as usize + TRAILER_LEN];
            rand::thread_rng().fill_bytes(&mut ram);
            builder = builder.data_size(data_size).cache(CacheRam::with_contents(ram));
        }
        Ok(builder.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STACK: &str = r#"
[device]
size = "64 KiB"
code_bank_end = 0x8000

[encryption]
key_partition = "keys"
key_offset = 0x10

[[partition]]
name = "keys"
start = 0xF000
size = "4 KiB"
drivers = ["intflash"]

[[partition]]
name = "config"
start = 0xC000
size = "4 KiB"
drivers = ["cache", "intflash"]
update_rate = 60

[[partition]]
name = "secret"
start = 0xD000
size = "8 KiB"
drivers = ["encrypt", "intflash"]

[[partition]]
name = "scratch"
start = 0
size = "1 KiB"
drivers = ["ram"]
"#;

    #[test]
    fn test_build_from_config() {
        let config = StackConfig::from_toml_str(STACK).unwrap();
        let stack = Stack::open(&config).unwrap();
        let table = stack.table();

        let names: Vec<_> = table.partitions().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["keys", "config", "secret", "scratch"]);

        let cfg = table.open("config").unwrap();
        assert_eq!(cfg.data_size, 4096 - TRAILER_LEN as u32);
        assert!(cfg.attrs.meta.cache_restored());
        assert_eq!(table.open_by_update_rate(3600).unwrap().name, "config");

        let secret = table.open("secret").unwrap();
        table.write(&secret, b"hidden", 5).unwrap();
        let mut buf = [0u8; 6];
        table.read(&secret, &mut buf, 5).unwrap();
        assert_eq!(&buf, b"hidden");

        // The key landed in the key partition at its configured offset
        let mut key = [0u8; 16];
        stack.flash().read_at(0xF010, &mut key).unwrap();
        assert!(key.iter().any(|&b| b != 0xFF));
    }

    #[test]
    fn test_image_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("flash.bin");
        let text = STACK.replace(
            "[device]\n",
            &format!("[device]\nimage = {:?}\n", image.display().to_string()),
        );
        let config = StackConfig::from_toml_str(&text).unwrap();

        {
            let stack = Stack::open(&config).unwrap();
            let table = stack.table();
            let cfg = table.open("config").unwrap();
            table.write(&cfg, b"persisted", 0).unwrap();
            let secret = table.open("secret").unwrap();
            table.write(&secret, b"sealed", 100).unwrap();
            table.write(&table.open("scratch").unwrap(), b"gone", 0).unwrap();
            stack.close().unwrap();
        }
        assert_eq!(std::fs::metadata(&image).unwrap().len(), 64 * 1024);

        let stack = Stack::open(&config).unwrap();
        let table = stack.table();

        let cfg = table.open("config").unwrap();
        let mut buf = [0u8; 9];
        table.read(&cfg, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"persisted");

        let secret = table.open("secret").unwrap();
        let mut buf = [0u8; 6];
        table.read(&secret, &mut buf, 100).unwrap();
        assert_eq!(&buf, b"sealed");

        // Ciphertext only on the medium
        let mut raw = [0u8; 6];
        stack.flash().read_at(0xD000 + 100, &mut raw).unwrap();
        assert_ne!(&raw, b"sealed");

        // RAM partitions start blank on every open
        let mut buf = [0u8; 4];
        table.read(&table.open("scratch").unwrap(), &mut buf, 0).unwrap();
        assert_eq!(buf, [0xFF; 4]);
    }

    #[test]
    fn test_preerase_chain() {
        let text = format!(
            "{}\n[[partition]]\nname = \"log\"\nstart = 0x9000\nsize = \"8 KiB\"\ndrivers = [\"preerase\", \"intflash\"]\n",
            STACK
        );
        let config = StackConfig::from_toml_str(&text).unwrap();
        let stack = Stack::open(&config).unwrap();
        let table = stack.table();
        let log = table.open("log").unwrap();
        let names: Vec<_> = log.drivers.iter().map(|d| d.name()).collect();
        assert_eq!(names, ["preerase", "intflash"]);

        // Old contents in the second sector are cleared when a write reaches it
        stack.flash().write_at(0xA000, &[0u8; 16]).unwrap();
        table.write(&log, &[0x33; 8], 4092).unwrap();

        let mut raw = [0u8; 16];
        stack.flash().read_at(0xA000, &mut raw).unwrap();
        assert_eq!(&raw[..4], &[0x33; 4]);
        assert_eq!(&raw[4..], &[0xFF; 12]);
    }

    #[test]
    fn test_rejects_foreign_sector_size() {
        let text = STACK.replace("size = \"64 KiB\"", "size = \"64 KiB\"\nsector_size = 2048");
        let config = StackConfig::from_toml_str(&text).unwrap();
        assert!(matches!(Stack::build(&config), Err(StackError::Unsupported(_))));
    }

    #[test]
    fn test_rejects_misaligned_encrypted_size() {
        let text = STACK.replace("size = \"8 KiB\"", "size = \"8200\"");
        let config = StackConfig::from_toml_str(&text).unwrap();
        assert!(matches!(Stack::build(&config), Err(StackError::Unsupported(_))));
    }
}
