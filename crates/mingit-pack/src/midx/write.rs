//! Multi-pack index builder.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use mingit_hash::fanout::{FanoutTable, FANOUT_SIZE};
use mingit_hash::{ObjectId, OID_RAW_LEN};
use tracing::debug;

use crate::chunk::ChunkWriter;
use crate::{
    PackError, CHUNK_LARGE_OFFSETS, CHUNK_OBJECT_OFFSETS, CHUNK_OID_FANOUT, CHUNK_OID_LOOKUP,
    CHUNK_PACK_LOOKUP, CHUNK_PACK_NAMES, MIDX_HASH_VERSION, MIDX_HEADER_SIZE,
    MIDX_LARGE_OFFSET_NEEDED, MIDX_SIGNATURE, MIDX_VERSION,
};

/// One object fed to the builder.
///
/// `pack_id` refers to the pack in `add_pack` registration order; the builder
/// remaps it to the post-sort id on disk. `mtime` only participates in
/// deduplication: among duplicates of one OID the smallest mtime survives, so
/// entries re-fed from an existing multi-pack index are given mtime 0 to win
/// over fresh pack scans.
#[derive(Debug, Clone, Copy)]
pub struct MidxEntry {
    pub oid: ObjectId,
    pub pack_id: u32,
    pub offset: u64,
    pub mtime: u64,
}

/// Builder for a multi-pack index file.
pub struct MidxWriter {
    pack_dir: PathBuf,
    pack_names: Vec<String>,
    objects: Vec<MidxEntry>,
}

impl MidxWriter {
    pub fn new(pack_dir: impl AsRef<Path>) -> Self {
        Self {
            pack_dir: pack_dir.as_ref().to_path_buf(),
            pack_names: Vec::new(),
            objects: Vec::new(),
        }
    }

    /// Register a pack file name, returning the id to tag its objects with.
    pub fn add_pack(&mut self, name: impl Into<String>) -> u32 {
        self.pack_names.push(name.into());
        self.pack_names.len() as u32 - 1
    }

    /// Record one object.
    pub fn add_object(&mut self, oid: ObjectId, pack_id: u32, offset: u64, mtime: u64) {
        self.objects.push(MidxEntry { oid, pack_id, offset, mtime });
    }

    /// Write to a `tmp_midx_*` temporary in the pack directory and rename it
    /// to `midx-<hex-of-trailing-hash>.midx`. Returns the final path.
    pub fn write(self) -> Result<PathBuf, PackError> {
        let pack_dir = self.pack_dir.clone();
        let mut tmp = tempfile::Builder::new()
            .prefix("tmp_midx_")
            .tempfile_in(&pack_dir)?;

        let hash = self.write_inner(tmp.as_file_mut())?;

        let final_path = pack_dir.join(format!("midx-{}.midx", hash.to_hex()));
        tmp.persist(&final_path).map_err(|e| PackError::Io(e.error))?;
        debug!(path = %final_path.display(), "wrote multi-pack index");
        Ok(final_path)
    }

    /// Write to an explicitly named file (no hash-derived rename).
    pub fn write_to(self, path: impl AsRef<Path>) -> Result<ObjectId, PackError> {
        let mut file = File::create(path.as_ref())?;
        self.write_inner(&mut file)
    }

    fn write_inner(self, file: &mut File) -> Result<ObjectId, PackError> {
        let MidxWriter { pack_names, objects, .. } = self;

        // Sort pack names; perm maps registration ids to on-disk ids.
        let mut order: Vec<usize> = (0..pack_names.len()).collect();
        order.sort_by(|&a, &b| pack_names[a].cmp(&pack_names[b]));
        let mut perm = vec![0u32; pack_names.len()];
        let mut sorted_names: Vec<&str> = Vec::with_capacity(pack_names.len());
        for (post, &pre) in order.iter().enumerate() {
            perm[pre] = post as u32;
            sorted_names.push(&pack_names[pre]);
        }
        for pair in sorted_names.windows(2) {
            assert!(pair[0] != pair[1], "duplicate pack name: {}", pair[0]);
        }

        // Sort objects by (oid, mtime) and collapse duplicates; the oldest
        // copy of each OID survives.
        let mut objects = objects;
        objects.sort_by(|a, b| a.oid.cmp(&b.oid).then(a.mtime.cmp(&b.mtime)));
        objects.dedup_by_key(|e| e.oid);
        for pair in objects.windows(2) {
            assert!(pair[0].oid < pair[1].oid, "object ids not strictly ascending after dedup");
        }
        for entry in &objects {
            assert!(
                (entry.pack_id as usize) < pack_names.len(),
                "object {} references unregistered pack id {}",
                entry.oid,
                entry.pack_id
            );
        }

        let nr_packs = sorted_names.len() as u32;
        let nr_objects = objects.len();
        let nr_large_offset = objects.iter().filter(|e| e.offset >= 1 << 31).count();
        let large_offset_needed = nr_large_offset > 0;

        let total_name_len: u64 = sorted_names.iter().map(|n| n.len() as u64 + 1).sum();

        let mut declared: Vec<(u32, u64)> = vec![
            (CHUNK_PACK_LOOKUP, 4 * nr_packs as u64),
            (CHUNK_PACK_NAMES, total_name_len),
            (CHUNK_OID_FANOUT, FANOUT_SIZE as u64),
            (CHUNK_OID_LOOKUP, (nr_objects * OID_RAW_LEN) as u64),
            (CHUNK_OBJECT_OFFSETS, (nr_objects * 8) as u64),
        ];
        if large_offset_needed {
            declared.push((CHUNK_LARGE_OFFSETS, 8 * nr_large_offset as u64));
        }

        let mut header = Vec::with_capacity(MIDX_HEADER_SIZE);
        header.extend_from_slice(MIDX_SIGNATURE);
        header.extend_from_slice(&MIDX_VERSION.to_be_bytes());
        header.push(MIDX_HASH_VERSION);
        header.push(OID_RAW_LEN as u8);
        header.push(0); // base multi-pack index count
        header.push(declared.len() as u8);
        header.extend_from_slice(&nr_packs.to_be_bytes());
        assert_eq!(header.len(), MIDX_HEADER_SIZE);

        let mut writer = ChunkWriter::begin(file, &header, &declared)?;

        // Pack-name lookup: offsets into the names chunk.
        writer.chunk(CHUNK_PACK_LOOKUP, |out| {
            let mut cur = 0u32;
            for name in &sorted_names {
                out.write_all(&cur.to_be_bytes())?;
                cur += name.len() as u32 + 1;
            }
            Ok(())
        })?;

        writer.chunk(CHUNK_PACK_NAMES, |out| {
            for name in &sorted_names {
                out.write_all(name.as_bytes())?;
                out.write_all(&[0])?;
            }
            Ok(())
        })?;

        let oids: Vec<ObjectId> = objects.iter().map(|e| e.oid).collect();
        writer.chunk(CHUNK_OID_FANOUT, |out| {
            out.write_all(&FanoutTable::build(&oids).to_bytes())
        })?;

        writer.chunk(CHUNK_OID_LOOKUP, |out| {
            for oid in &oids {
                out.write_all(oid.as_bytes())?;
            }
            Ok(())
        })?;

        writer.chunk(CHUNK_OBJECT_OFFSETS, |out| {
            let mut nr_large = 0u32;
            for entry in &objects {
                out.write_all(&perm[entry.pack_id as usize].to_be_bytes())?;
                let word = if entry.offset >= 1 << 31 {
                    let escaped = MIDX_LARGE_OFFSET_NEEDED | nr_large;
                    nr_large += 1;
                    escaped
                } else {
                    entry.offset as u32
                };
                out.write_all(&word.to_be_bytes())?;
            }
            Ok(())
        })?;

        if large_offset_needed {
            writer.chunk(CHUNK_LARGE_OFFSETS, |out| {
                for entry in objects.iter().filter(|e| e.offset >= 1 << 31) {
                    out.write_all(&entry.offset.to_be_bytes())?;
                }
                Ok(())
            })?;
        }

        writer.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(first: u8, last: u8) -> ObjectId {
        let mut raw = [0u8; 20];
        raw[0] = first;
        raw[19] = last;
        ObjectId::from_raw(raw)
    }

    #[test]
    fn final_name_is_hash_derived() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = MidxWriter::new(dir.path());
        let p = writer.add_pack("test-1.pack");
        writer.add_object(oid(0xaa, 0), p, 100, 0);

        let path = writer.write().unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("midx-") && name.ends_with(".midx"));
        assert_eq!(name.len(), "midx-".len() + 40 + ".midx".len());
        assert!(path.exists());

        // No leftover temp file.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with("tmp_midx_")
            })
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    #[should_panic(expected = "duplicate pack name")]
    fn duplicate_pack_names_abort() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = MidxWriter::new(dir.path());
        writer.add_pack("same.pack");
        writer.add_pack("same.pack");
        let _ = writer.write();
    }

    #[test]
    #[should_panic(expected = "unregistered pack id")]
    fn unregistered_pack_id_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = MidxWriter::new(dir.path());
        writer.add_pack("a.pack");
        writer.add_object(oid(1, 1), 7, 10, 0);
        let _ = writer.write();
    }

    #[test]
    fn empty_inputs_still_produce_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MidxWriter::new(dir.path());
        let path = writer.write().unwrap();
        assert!(path.exists());
    }
}
