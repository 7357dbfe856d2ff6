//! CRC32 used by the ArduPilot bootloader protocol.
//!
//! Standard reflected table (polynomial `0xEDB88320`), but with a
//! non-standard contract: the bootloader seeds the running state with 0
//! rather than `0xFFFFFFFF`, and never applies a final XOR. Callers chain
//! state across calls to checksum a logical stream that is not contiguous
//! in memory (the firmware image followed by a virtual run of erased-flash
//! `0xFF` bytes).

/// Reflected CRC32 polynomial.
const POLY: u32 = 0xEDB88320;

/// 256-entry lookup table, built at compile time.
static TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Update a running CRC32 state with `data`.
///
/// Seed with 0 for the first call (bootloader convention) and feed the
/// returned state back in to continue the same logical stream.
pub fn crc32(data: &[u8], state: u32) -> u32 {
    let mut crc = state;
    for &byte in data {
        crc = TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize] ^ (crc >> 8);
    }
    crc
}

/// Fixed block used to model erased flash without materializing it.
const ERASED_BLOCK: [u8; 256] = [0xFF; 256];

/// Continue a running CRC32 over `len` virtual `0xFF` bytes.
///
/// Models the erased flash beyond the firmware image when computing the
/// checksum the bootloader's `GET_CRC` reports over the whole flash.
pub fn crc32_erased(state: u32, len: usize) -> u32 {
    let mut crc = state;
    let mut remaining = len;
    while remaining > 0 {
        let take = remaining.min(ERASED_BLOCK.len());
        crc = crc32(&ERASED_BLOCK[..take], crc);
        remaining -= take;
    }
    crc
}
