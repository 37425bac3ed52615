//! AES key record
//!
//! The key lives as a raw 16-byte record on the medium. An all-0xFF record
//! (erased flash) means no key has been provisioned yet.

use std::fmt;
use std::sync::Arc;

use nvstack_core::{Partition, Result};
use rand::RngCore;

/// Key length in bytes
pub const KEY_LEN: usize = 16;

/// A valid AES-128 key
#[derive(Clone, PartialEq, Eq)]
pub struct AesKey([u8; KEY_LEN]);

impl AesKey {
    /// Interpret a stored record; `None` if it is the erased pattern
    pub fn from_record(record: [u8; KEY_LEN]) -> Option<Self> {
        if record.iter().all(|&b| b == 0xFF) {
            None
        } else {
            Some(Self(record))
        }
    }

    /// Draw a fresh key, redrawing until it is not the erased pattern
    pub fn generate(rng: &mut dyn RngCore) -> Self {
        let mut record = [0u8; KEY_LEN];
        loop {
            rng.fill_bytes(&mut record);
            if let Some(key) = Self::from_record(record) {
                return key;
            }
            log::debug!("Generated key was blank, drawing again");
        }
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(..)")
    }
}

/// Storage for the key record
pub trait KeyStore: Send + Sync {
    /// Read the raw record
    fn read_record(&self) -> Result<[u8; KEY_LEN]>;

    /// Persist a raw record
    fn write_record(&self, record: &[u8; KEY_LEN]) -> Result<()>;

    /// Current key, if one is provisioned
    fn load(&self) -> Result<Option<AesKey>> {
        self.read_record().map(AesKey::from_record)
    }
}

/// Key record kept at a fixed offset of a partition
///
/// Access goes through the partition's own driver chain, so the key
/// partition must not itself be encrypted.
pub struct PartitionKeyStore {
    partition: Arc<Partition>,
    offset: u32,
}

impl PartitionKeyStore {
    /// Key record at `offset` in `partition`
    pub fn new(partition: Arc<Partition>, offset: u32) -> Self {
        Self { partition, offset }
    }

    /// Partition holding the key
    pub fn partition(&self) -> &Partition {
        &self.partition
    }
}

impl KeyStore for PartitionKeyStore {
    fn read_record(&self) -> Result<[u8; KEY_LEN]> {
        let mut record = [0u8; KEY_LEN];
        let part = &self.partition;
        part.chain().read(part, &mut record, self.offset)?;
        Ok(record)
    }

    fn write_record(&self, record: &[u8; KEY_LEN]) -> Result<()> {
        let part = &self.partition;
        part.chain().write(part, record, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvstack_sim::RamDriver;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Yields one blank draw before real bytes
    struct BlankFirst {
        calls: usize,
    }

    impl RngCore for BlankFirst {
        fn next_u32(&mut self) -> u32 {
            self.next_u64() as u32
        }

        fn next_u64(&mut self) -> u64 {
            let mut bytes = [0u8; 8];
            self.fill_bytes(&mut bytes);
            u64::from_le_bytes(bytes)
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            let fill = if self.calls == 0 { 0xFF } else { 0x5A };
            self.calls += 1;
            dest.fill(fill);
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> core::result::Result<(), rand::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    #[test]
    fn test_blank_record_is_no_key() {
        assert!(AesKey::from_record([0xFF; KEY_LEN]).is_none());
        let mut record = [0xFF; KEY_LEN];
        record[15] = 0xFE;
        assert!(AesKey::from_record(record).is_some());
    }

    #[test]
    fn test_generate_skips_blank() {
        let mut rng = BlankFirst { calls: 0 };
        let key = AesKey::generate(&mut rng);
        assert_eq!(key.as_bytes(), &[0x5A; KEY_LEN]);
        assert_eq!(rng.calls, 2);

        let mut rng = StdRng::seed_from_u64(1);
        assert_ne!(AesKey::generate(&mut rng), AesKey::generate(&mut rng));
    }

    #[test]
    fn test_partition_store() {
        let ram = Arc::new(RamDriver::new(64));
        let part = Arc::new(Partition::builder("keys", 0, 64).driver(ram.clone()).build());
        let store = PartitionKeyStore::new(part, 0x20);

        assert_eq!(store.load().unwrap(), None);
        store.write_record(&[7; KEY_LEN]).unwrap();
        assert_eq!(&ram.contents()[0x20..0x30], &[7; KEY_LEN]);
        assert_eq!(store.load().unwrap(), AesKey::from_record([7; KEY_LEN]));
    }

    #[test]
    fn test_debug_hides_key() {
        let key = AesKey::from_record([0x42; KEY_LEN]).unwrap();
        assert_eq!(format!("{:?}", key), "AesKey(..)");
    }
}
