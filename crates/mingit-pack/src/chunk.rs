//! Chunked-file framing primitives.
//!
//! A chunked file is a fixed header, a lookup table of
//! `num_chunks + 1` records (4-byte chunk id, 8-byte file offset, the last
//! being a zero-id sentinel pointing at the trailing hash), the chunk
//! payloads, and a trailing content hash over everything before it.
//! All integers are big-endian.

use std::fs::File;
use std::io::{self, Write};
use std::ops::Range;

use mingit_hash::hasher::Hasher;
use mingit_hash::{ObjectId, OID_RAW_LEN};

use crate::{PackError, CHUNK_LOOKUP_ENTRY_SIZE};

struct ChunkSpec {
    id: u32,
    offset: u64,
    len: u64,
}

/// Streaming writer for chunked files.
///
/// Chunk offsets are assigned up front from the declared lengths, before any
/// payload is written; the lookup table therefore goes out immediately after
/// the header. Any mismatch between a declared and an actual chunk length is
/// a structural bug and aborts.
pub struct ChunkWriter<'a> {
    file: &'a mut File,
    hasher: Hasher,
    chunks: Vec<ChunkSpec>,
    next: usize,
    position: u64,
}

impl<'a> ChunkWriter<'a> {
    /// Write `header` and the chunk lookup table derived from the declared
    /// `(id, length)` pairs.
    pub fn begin(file: &'a mut File, header: &[u8], declared: &[(u32, u64)]) -> io::Result<Self> {
        let mut offset =
            header.len() as u64 + ((declared.len() + 1) * CHUNK_LOOKUP_ENTRY_SIZE) as u64;
        let mut chunks = Vec::with_capacity(declared.len());
        for &(id, len) in declared {
            chunks.push(ChunkSpec { id, offset, len });
            offset += len;
        }
        let trailer_offset = offset;

        let mut writer = Self {
            file,
            hasher: Hasher::new(),
            chunks,
            next: 0,
            position: 0,
        };
        writer.put(header)?;
        for i in 0..writer.chunks.len() {
            let (id, offset) = (writer.chunks[i].id, writer.chunks[i].offset);
            writer.put(&id.to_be_bytes())?;
            writer.put(&offset.to_be_bytes())?;
        }
        // Sentinel record: id 0, offset of the trailing hash.
        writer.put(&0u32.to_be_bytes())?;
        writer.put(&trailer_offset.to_be_bytes())?;
        Ok(writer)
    }

    /// Stream the payload of the next declared chunk.
    ///
    /// `id` must match the declaration order, and the payload writer must
    /// produce exactly the declared number of bytes.
    pub fn chunk<F>(&mut self, id: u32, payload: F) -> io::Result<()>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()>,
    {
        assert!(self.next < self.chunks.len(), "chunk {id:#010x} not declared");
        let spec = &self.chunks[self.next];
        assert_eq!(spec.id, id, "chunk written out of declared order");
        assert_eq!(spec.offset, self.position, "chunk offset drifted from declaration");

        let declared_len = spec.len;
        let start = self.position;
        let mut sink = TeeWriter { writer: self };
        payload(&mut sink)?;

        let written = self.position - start;
        assert_eq!(
            written, declared_len,
            "chunk {id:#010x} wrote {written} bytes, declared {declared_len}"
        );
        self.next += 1;
        Ok(())
    }

    /// Append the trailing hash, fsync, and return it.
    pub fn finalize(self) -> Result<ObjectId, PackError> {
        assert_eq!(self.next, self.chunks.len(), "not all declared chunks were written");
        let hash = self.hasher.finalize()?;
        self.file.write_all(hash.as_bytes())?;
        self.file.sync_all()?;
        Ok(hash)
    }

    fn put(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.hasher.update(data);
        self.position += data.len() as u64;
        Ok(())
    }
}

struct TeeWriter<'b, 'a> {
    writer: &'b mut ChunkWriter<'a>,
}

impl Write for TeeWriter<'_, '_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.put(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.file.flush()
    }
}

/// Parsed chunk lookup table of a mapped chunked file.
#[derive(Debug)]
pub struct ChunkTable {
    entries: Vec<(u32, usize)>,
    trailer_offset: usize,
}

impl ChunkTable {
    /// Parse `num_chunks + 1` lookup records starting at `table_start`.
    ///
    /// Validates that offsets are strictly increasing, lie within the file,
    /// and that the sentinel record points at the trailing hash. Unknown
    /// chunk ids are kept and simply never asked for.
    pub fn parse(data: &[u8], table_start: usize, num_chunks: usize) -> Result<Self, PackError> {
        if data.len() < OID_RAW_LEN {
            return Err(PackError::InvalidMidx("file too small for trailing hash".into()));
        }
        let table_end = table_start + (num_chunks + 1) * CHUNK_LOOKUP_ENTRY_SIZE;
        if table_end > data.len() {
            return Err(PackError::InvalidMidx("truncated chunk lookup table".into()));
        }

        let mut entries = Vec::with_capacity(num_chunks);
        let mut prev_offset: Option<usize> = None;
        let mut trailer_offset = 0usize;

        for i in 0..=num_chunks {
            let pos = table_start + i * CHUNK_LOOKUP_ENTRY_SIZE;
            let id = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
            let raw_offset = u64::from_be_bytes([
                data[pos + 4],
                data[pos + 5],
                data[pos + 6],
                data[pos + 7],
                data[pos + 8],
                data[pos + 9],
                data[pos + 10],
                data[pos + 11],
            ]);
            // A chunk offset larger than the host address space cannot be
            // mapped; reject rather than truncate (32-bit hosts).
            let offset = usize::try_from(raw_offset)
                .map_err(|_| PackError::InvalidMidx("chunk offset exceeds host address space".into()))?;

            if offset > data.len() - OID_RAW_LEN {
                return Err(PackError::InvalidMidx(format!(
                    "chunk offset {offset} past end of file"
                )));
            }
            if let Some(prev) = prev_offset {
                if offset <= prev {
                    return Err(PackError::InvalidMidx(
                        "chunk offsets not strictly increasing".into(),
                    ));
                }
            }
            prev_offset = Some(offset);

            if i == num_chunks {
                if id != 0 {
                    return Err(PackError::InvalidMidx(
                        "chunk lookup table missing zero sentinel".into(),
                    ));
                }
                trailer_offset = offset;
            } else {
                if id == 0 {
                    return Err(PackError::InvalidMidx("zero chunk id before sentinel".into()));
                }
                entries.push((id, offset));
            }
        }

        if trailer_offset != data.len() - OID_RAW_LEN {
            return Err(PackError::InvalidMidx(
                "sentinel offset does not match trailing hash position".into(),
            ));
        }

        Ok(Self { entries, trailer_offset })
    }

    /// Byte range of the chunk with the given id, if present.
    pub fn range(&self, id: u32) -> Option<Range<usize>> {
        let idx = self.entries.iter().position(|&(cid, _)| cid == id)?;
        let start = self.entries[idx].1;
        let end = self
            .entries
            .get(idx + 1)
            .map(|&(_, off)| off)
            .unwrap_or(self.trailer_offset);
        Some(start..end)
    }

    /// Byte range of a required chunk, or a missing-chunk error.
    pub fn required(&self, id: u32, name: &'static str) -> Result<Range<usize>, PackError> {
        self.range(id).ok_or(PackError::MissingChunk(name))
    }

    /// Offset of the trailing hash.
    pub fn trailer_offset(&self) -> usize {
        self.trailer_offset
    }
}
