//! Sector and phrase helpers for erase-before-program flash

use crate::regs::PHRASE_SIZE;

/// Value of an erased byte
pub const ERASED_VALUE: u8 = 0xFF;

/// Whether a buffer is fully erased, checked a 32-bit word at a time
pub fn is_erased(buf: &[u8]) -> bool {
    let mut words = buf.chunks_exact(4);
    words
        .by_ref()
        .all(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]) == u32::MAX)
        && words.remainder().iter().all(|&b| b == ERASED_VALUE)
}

/// Whether writing `want` over `have` needs an erase first
///
/// Programming can only clear bits, so an erase is needed iff some bit must
/// go from 0 to 1.
pub fn need_erase(have: &[u8], want: &[u8]) -> bool {
    have.iter().zip(want).any(|(h, w)| (h & w) != *w)
}

/// Whether a phrase has nothing to program
pub fn is_blank_phrase(phrase: &[u8]) -> bool {
    phrase.iter().all(|&b| b == ERASED_VALUE)
}

/// Portion of a request that falls in one sector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorSpan {
    /// Sector base address
    pub base: u32,
    /// Offset of the span within the sector
    pub offset: usize,
    /// Span length
    pub len: usize,
    /// Offset of the span within the request
    pub pos: usize,
}

impl SectorSpan {
    /// Whether the span covers its whole sector
    pub fn is_full(&self, sector_size: usize) -> bool {
        self.offset == 0 && self.len == sector_size
    }
}

/// Split `[addr, addr + len)` at sector boundaries
pub fn sector_spans(addr: u32, len: usize, sector_size: usize) -> impl Iterator<Item = SectorSpan> {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        if pos >= len {
            return None;
        }
        let cur = addr as usize + pos;
        let offset = cur % sector_size;
        let take = (sector_size - offset).min(len - pos);
        let span = SectorSpan {
            base: (cur - offset) as u32,
            offset,
            len: take,
            pos,
        };
        pos += take;
        Some(span)
    })
}

/// Phrases of a sector buffer with their addresses
pub fn phrases(base: u32, sector: &[u8]) -> impl Iterator<Item = (u32, &[u8; PHRASE_SIZE])> {
    sector
        .chunks_exact(PHRASE_SIZE)
        .enumerate()
        .filter_map(move |(i, chunk)| {
            let phrase: &[u8; PHRASE_SIZE] = chunk.try_into().ok()?;
            Some((base + (i * PHRASE_SIZE) as u32, phrase))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_erased() {
        assert!(is_erased(&[0xFF; 4096]));
        let mut buf = [0xFF; 4096];
        buf[4095] = 0xFE;
        assert!(!is_erased(&buf));
        assert!(is_erased(&[0xFF; 3]));
        assert!(!is_erased(&[0xFF, 0xFF, 0xFF, 0xFF, 0x7F]));
    }

    #[test]
    fn test_need_erase() {
        // 1 -> 0 only
        assert!(!need_erase(&[0xFF, 0xF0], &[0x0F, 0x00]));
        assert!(!need_erase(&[0xAA], &[0xAA]));
        // 0 -> 1 somewhere
        assert!(need_erase(&[0x00], &[0x01]));
        assert!(need_erase(&[0xFF, 0x10], &[0xFF, 0x18]));
    }

    #[test]
    fn test_sector_spans() {
        let spans: Vec<_> = sector_spans(4000, 5000, 4096).collect();
        assert_eq!(
            spans,
            vec![
                SectorSpan { base: 0, offset: 4000, len: 96, pos: 0 },
                SectorSpan { base: 4096, offset: 0, len: 4096, pos: 96 },
                SectorSpan { base: 8192, offset: 0, len: 808, pos: 4192 },
            ]
        );
        assert!(spans[1].is_full(4096));
        assert!(!spans[2].is_full(4096));
        assert_eq!(sector_spans(0, 0, 4096).count(), 0);
    }

    #[test]
    fn test_phrases() {
        let mut sector = vec![0xFF; 32];
        sector[8] = 0;
        let blanks: Vec<bool> = phrases(0x100, &sector)
            .map(|(_, p)| is_blank_phrase(p))
            .collect();
        assert_eq!(blanks, vec![true, false, true, true]);
        let addrs: Vec<u32> = phrases(0x100, &sector).map(|(a, _)| a).collect();
        assert_eq!(addrs, vec![0x100, 0x108, 0x110, 0x118]);
    }
}
