// SPDX-License-Identifier: BSD-3-Clause

//! Checksum and integer pack/unpack primitives shared by the Sahara,
//! Firehose and MediaTek drivers. Pure functions, no state, no I/O.

/// Folds `bytes` into a 16-bit XOR checksum, little-endian pair at a time.
/// An odd trailing byte is padded with a zero high byte. Used for the
/// MediaTek DA transfer checksum.
pub fn xor16(bytes: &[u8]) -> u16 {
    let mut acc: u16 = 0;
    let mut chunks = bytes.chunks_exact(2);
    for pair in &mut chunks {
        acc ^= u16::from_le_bytes([pair[0], pair[1]]);
    }
    if let [last] = chunks.remainder() {
        acc ^= u16::from_le_bytes([*last, 0]);
    }
    acc
}

const CRC32_POLY: u32 = 0xEDB88320;

fn crc32_table() -> &'static [u32; 256] {
    static TABLE: std::sync::OnceLock<[u32; 256]> = std::sync::OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u32; 256];
        let mut n = 0;
        while n < 256 {
            let mut c = n as u32;
            let mut k = 0;
            while k < 8 {
                c = if c & 1 != 0 { CRC32_POLY ^ (c >> 1) } else { c >> 1 };
                k += 1;
            }
            table[n] = c;
            n += 1;
        }
        table
    })
}

/// Incremental CRC-32 (IEEE 802.3, poly 0xEDB88320) state. `crc32_ieee` is a
/// one-shot convenience wrapper around this.
#[derive(Debug, Clone, Copy)]
pub struct Crc32 {
    state: u32,
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc32 {
    pub fn new() -> Self {
        Crc32 { state: 0xFFFFFFFF }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        let table = crc32_table();
        let mut c = self.state;
        for &b in bytes {
            c = table[((c ^ b as u32) & 0xFF) as usize] ^ (c >> 8);
        }
        self.state = c;
    }

    pub fn finalize(self) -> u32 {
        self.state ^ 0xFFFFFFFF
    }
}

/// One-shot CRC-32 (IEEE 802.3): poly 0xEDB88320, init 0xFFFFFFFF, final XOR
/// 0xFFFFFFFF. Used for GPT header/entry-array CRCs and Android sparse
/// per-chunk CRC32 chunks.
pub fn crc32_ieee(bytes: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(bytes);
    crc.finalize()
}

fn gf2_matrix_times(mat: &[u32; 32], mut vec: u32) -> u32 {
    let mut sum = 0u32;
    let mut i = 0;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[i];
        }
        vec >>= 1;
        i += 1;
    }
    sum
}

fn gf2_matrix_square(square: &mut [u32; 32], mat: &[u32; 32]) {
    for (n, slot) in square.iter_mut().enumerate() {
        *slot = gf2_matrix_times(mat, mat[n]);
    }
}

/// Combines the CRC-32 of two adjacent byte ranges without re-hashing the
/// first range: `crc32_combine(crc32(a), crc32(b), b.len()) == crc32(a||b)`.
/// Standard GF(2) matrix-exponentiation algorithm (as used by zlib).
pub fn crc32_combine(crc1: u32, crc2: u32, len2: u64) -> u32 {
    if len2 == 0 {
        return crc1;
    }

    let mut odd = [0u32; 32];
    let mut even = [0u32; 32];

    odd[0] = CRC32_POLY;
    let mut row = 1u32;
    for slot in odd.iter_mut().skip(1) {
        *slot = row;
        row <<= 1;
    }

    gf2_matrix_square(&mut even, &odd);
    gf2_matrix_square(&mut odd, &even);

    let mut crc1 = crc1;
    let mut len2 = len2;
    loop {
        gf2_matrix_square(&mut even, &odd);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&even, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
        gf2_matrix_square(&mut odd, &even);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&odd, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
    }

    crc1 ^ crc2
}

const CRC16_CCITT_POLY: u16 = 0x1021;

/// CRC-16/CCITT-FALSE: poly 0x1021, no reflection, caller-supplied init
/// (0xFFFF is conventional).
pub fn crc16_ccitt(bytes: &[u8], init: u16) -> u16 {
    let mut crc = init;
    for &b in bytes {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC16_CCITT_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Error returned when decoding an integer from a slice shorter than the
/// requested width.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("insufficient buffer: need {need} bytes, got {got}")]
pub struct InsufficientBuffer {
    pub need: usize,
    pub got: usize,
}

macro_rules! le_be_pair {
    ($ty:ty, $read_le:ident, $read_be:ident, $write_le:ident, $write_be:ident) => {
        pub fn $read_le(bytes: &[u8]) -> Result<$ty, InsufficientBuffer> {
            let width = std::mem::size_of::<$ty>();
            bytes
                .get(..width)
                .map(|s| <$ty>::from_le_bytes(s.try_into().unwrap()))
                .ok_or(InsufficientBuffer { need: width, got: bytes.len() })
        }

        pub fn $read_be(bytes: &[u8]) -> Result<$ty, InsufficientBuffer> {
            let width = std::mem::size_of::<$ty>();
            bytes
                .get(..width)
                .map(|s| <$ty>::from_be_bytes(s.try_into().unwrap()))
                .ok_or(InsufficientBuffer { need: width, got: bytes.len() })
        }

        pub fn $write_le(value: $ty) -> Vec<u8> {
            value.to_le_bytes().to_vec()
        }

        pub fn $write_be(value: $ty) -> Vec<u8> {
            value.to_be_bytes().to_vec()
        }
    };
}

le_be_pair!(u16, read_u16_le, read_u16_be, write_u16_le, write_u16_be);
le_be_pair!(u32, read_u32_le, read_u32_be, write_u32_le, write_u32_be);
le_be_pair!(u64, read_u64_le, read_u64_be, write_u64_le, write_u64_be);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor16_associative_over_even_split() {
        let a = [0x01u8, 0x02, 0x03, 0x04];
        let b = [0x05u8, 0x06, 0x07, 0x08];
        let whole: Vec<u8> = a.iter().chain(b.iter()).copied().collect();
        assert_eq!(xor16(&whole), xor16(&a) ^ xor16(&b));
    }

    #[test]
    fn xor16_pads_odd_trailing_byte() {
        assert_eq!(xor16(&[0x01]), 0x0001);
        assert_eq!(xor16(&[0x01, 0x02, 0x03]), xor16(&[0x01, 0x02]) ^ 0x0003);
    }

    #[test]
    fn crc32_known_vector() {
        // crc32("123456789") is a standard conformance vector.
        assert_eq!(crc32_ieee(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn crc32_combine_matches_direct() {
        let a = b"hello, ";
        let b = b"world!";
        let whole: Vec<u8> = a.iter().chain(b.iter()).copied().collect();
        let combined = crc32_combine(crc32_ieee(a), crc32_ieee(b), b.len() as u64);
        assert_eq!(combined, crc32_ieee(&whole));
    }

    #[test]
    fn crc16_ccitt_known_vector() {
        // CRC-16/CCITT-FALSE("123456789") = 0x29B1
        assert_eq!(crc16_ccitt(b"123456789", 0xFFFF), 0x29B1);
    }

    #[test]
    fn le_be_roundtrip() {
        assert_eq!(read_u32_le(&write_u32_le(0xDEADBEEF)).unwrap(), 0xDEADBEEF);
        assert_eq!(read_u32_be(&write_u32_be(0xDEADBEEF)).unwrap(), 0xDEADBEEF);
        assert_eq!(read_u16_le(&[0x01]), Err(InsufficientBuffer { need: 2, got: 1 }));
    }
}
