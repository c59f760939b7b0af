//! Filter archive serialisation and the overlapped loader.
//!
//! Archive layout (little-endian):
//! - magic `SKUA`, version u32
//! - layout flag u8 (0 = uncompressed, 1 = compressed)
//! - `bin_count` u32, `hash_count` u32, `bin_size` u64
//! - payload, zstd-compressed stream:
//!   - uncompressed layout: word count u64, then the matrix words
//!   - compressed layout: occupancy length u64, packed length u64,
//!     occupancy bitmap words, packed non-zero words
//!
//! Partitioned indexes repeat the archive once per `{path}_{i}` file.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::error::{Result, SkuaError};
use crate::ibf::{CompressedFilter, Filter, InterleavedBloomFilter};

pub const MAGIC: &[u8; 4] = b"SKUA";
pub const VERSION: u32 = 1;

const LAYOUT_UNCOMPRESSED: u8 = 0;
const LAYOUT_COMPRESSED: u8 = 1;

// Upper bound on matrix words a header may announce (256 GiB of filter);
// rejects corrupt headers before anything is allocated.
const MAX_PAYLOAD_WORDS: usize = 1 << 35;

/// Path of part `part` of a partitioned index: `{path}_{part}`.
pub fn part_path(path: &Path, part: usize) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!("_{}", part));
    PathBuf::from(name)
}

// --- WRITING ---

fn write_words<W: Write>(sink: &mut W, words: &[u64], path: &Path) -> Result<()> {
    for &w in words {
        sink.write_all(&w.to_le_bytes())
            .map_err(|e| SkuaError::io(path, "write", e))?;
    }
    Ok(())
}

/// Serialise a filter to `path`.
pub fn save_filter(filter: &Filter, path: &Path) -> Result<()> {
    let file = File::create(path).map_err(|e| SkuaError::io(path, "create", e))?;
    let mut writer = BufWriter::new(file);

    let layout = match filter {
        Filter::Uncompressed(_) => LAYOUT_UNCOMPRESSED,
        Filter::Compressed(_) => LAYOUT_COMPRESSED,
    };

    let header_err = |e| SkuaError::io(path, "write", e);
    writer.write_all(MAGIC).map_err(header_err)?;
    writer.write_all(&VERSION.to_le_bytes()).map_err(header_err)?;
    writer.write_all(&[layout]).map_err(header_err)?;
    writer
        .write_all(&filter.bin_count().to_le_bytes())
        .map_err(header_err)?;
    writer
        .write_all(&filter.hash_count().to_le_bytes())
        .map_err(header_err)?;
    writer
        .write_all(&filter.bin_size().to_le_bytes())
        .map_err(header_err)?;

    let mut encoder = zstd::stream::write::Encoder::new(writer, 3)
        .map_err(|e| SkuaError::io(path, "write", e))?;

    match filter {
        Filter::Uncompressed(f) => {
            let words = f.words();
            encoder
                .write_all(&(words.len() as u64).to_le_bytes())
                .map_err(|e| SkuaError::io(path, "write", e))?;
            write_words(&mut encoder, words, path)?;
        }
        Filter::Compressed(f) => {
            let occupancy = f.occupancy();
            let packed = f.packed_words();
            encoder
                .write_all(&(occupancy.len() as u64).to_le_bytes())
                .map_err(|e| SkuaError::io(path, "write", e))?;
            encoder
                .write_all(&(packed.len() as u64).to_le_bytes())
                .map_err(|e| SkuaError::io(path, "write", e))?;
            write_words(&mut encoder, occupancy, path)?;
            write_words(&mut encoder, packed, path)?;
        }
    }

    let mut writer = encoder
        .finish()
        .map_err(|e| SkuaError::io(path, "write", e))?;
    writer.flush().map_err(|e| SkuaError::io(path, "write", e))?;
    Ok(())
}

// --- READING ---

fn read_u32<R: Read>(reader: &mut R, path: &Path) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|e| SkuaError::format(path, format!("truncated archive: {}", e)))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R, path: &Path) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .map_err(|e| SkuaError::format(path, format!("truncated archive: {}", e)))?;
    Ok(u64::from_le_bytes(buf))
}

fn read_word_vec<R: Read>(reader: &mut R, len: usize, path: &Path) -> Result<Vec<u64>> {
    let mut words = Vec::with_capacity(len);
    let mut buf = [0u8; 8];
    for _ in 0..len {
        reader
            .read_exact(&mut buf)
            .map_err(|e| SkuaError::format(path, format!("truncated payload: {}", e)))?;
        words.push(u64::from_le_bytes(buf));
    }
    Ok(words)
}

/// Deserialise the filter at `path`, returning it together with the elapsed
/// wall seconds. `compressed` must match the archive's layout flag.
pub fn load_filter(path: &Path, compressed: bool) -> Result<(Filter, f64)> {
    let start = Instant::now();

    let file = File::open(path).map_err(|e| SkuaError::io(path, "open", e))?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|e| SkuaError::format(path, format!("truncated archive: {}", e)))?;
    if &magic != MAGIC {
        return Err(SkuaError::format(path, "invalid magic bytes"));
    }

    let version = read_u32(&mut reader, path)?;
    if version != VERSION {
        return Err(SkuaError::version(path, version, VERSION));
    }

    let mut layout = [0u8; 1];
    reader
        .read_exact(&mut layout)
        .map_err(|e| SkuaError::format(path, format!("truncated archive: {}", e)))?;
    let stored_compressed = match layout[0] {
        LAYOUT_UNCOMPRESSED => false,
        LAYOUT_COMPRESSED => true,
        other => {
            return Err(SkuaError::format(
                path,
                format!("unknown layout flag {}", other),
            ))
        }
    };
    if stored_compressed != compressed {
        return Err(SkuaError::format(
            path,
            format!(
                "archive layout is {} but {} was requested",
                if stored_compressed { "compressed" } else { "uncompressed" },
                if compressed { "compressed" } else { "uncompressed" },
            ),
        ));
    }

    let bin_count = read_u32(&mut reader, path)?;
    let hash_count = read_u32(&mut reader, path)?;
    let bin_size = read_u64(&mut reader, path)?;

    // Dimensions bound every allocation below; reject them before reading
    // the payload.
    let expected_words = (bin_size as usize)
        .checked_mul((bin_count as usize + 63) / 64)
        .ok_or_else(|| SkuaError::format(path, "filter dimensions overflow"))?;
    if expected_words > MAX_PAYLOAD_WORDS {
        return Err(SkuaError::format(
            path,
            format!("header announces {} matrix words", expected_words),
        ));
    }

    let mut decoder = zstd::stream::read::Decoder::new(reader)
        .map_err(|e| SkuaError::format(path, format!("invalid zstd payload: {}", e)))?;

    let filter = if stored_compressed {
        let occupancy_len = read_u64(&mut decoder, path)? as usize;
        let packed_len = read_u64(&mut decoder, path)? as usize;
        if occupancy_len != (expected_words + 63) / 64 || packed_len > expected_words {
            return Err(SkuaError::format(path, "payload lengths contradict header"));
        }
        let occupancy = read_word_vec(&mut decoder, occupancy_len, path)?;
        let packed = read_word_vec(&mut decoder, packed_len, path)?;
        let f = CompressedFilter::from_parts(bin_count, bin_size, hash_count, occupancy, packed)
            .map_err(|e| SkuaError::format(path, e.to_string()))?;
        Filter::Compressed(f)
    } else {
        let word_count = read_u64(&mut decoder, path)? as usize;
        if word_count != expected_words {
            return Err(SkuaError::format(path, "payload length contradicts header"));
        }
        let words = read_word_vec(&mut decoder, word_count, path)?;
        let f = InterleavedBloomFilter::from_words(bin_count, bin_size, hash_count, words)
            .map_err(|e| SkuaError::format(path, e.to_string()))?;
        Filter::Uncompressed(f)
    };

    Ok((filter, start.elapsed().as_secs_f64()))
}

// --- OVERLAPPED LOADING ---

/// Handle to a filter deserialisation running on its own thread.
pub type LoaderHandle = JoinHandle<Result<(Filter, f64)>>;

/// Start deserialising `path` in the background. The caller joins the handle
/// before touching any work that needs the filter.
pub fn spawn_loader(path: PathBuf, compressed: bool) -> Result<LoaderHandle> {
    let err_path = path.clone();
    thread::Builder::new()
        .name("ibf-loader".into())
        .spawn(move || load_filter(&path, compressed))
        .map_err(|e| SkuaError::io(err_path, "spawn loader", e))
}

/// Join an overlapped load, surfacing loader errors and panics.
pub fn join_loader(handle: LoaderHandle) -> Result<(Filter, f64)> {
    handle
        .join()
        .map_err(|_| SkuaError::validation("IBF loader thread panicked"))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};
    use tempfile::tempdir;

    fn sample_ibf() -> InterleavedBloomFilter {
        let mut ibf = InterleavedBloomFilter::new(70, 512, 2).unwrap();
        for h in 0..50u64 {
            ibf.insert(h * 31 + 7, (h % 70) as u32);
        }
        ibf
    }

    #[test]
    fn test_round_trip_uncompressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ref.skua");
        let ibf = sample_ibf();
        save_filter(&Filter::Uncompressed(ibf), &path).unwrap();

        let (loaded, elapsed) = load_filter(&path, false).unwrap();
        assert!(elapsed >= 0.0);
        assert_eq!(loaded.bin_count(), 70);
        assert_eq!(loaded.hash_count(), 2);
        assert_eq!(loaded.bin_size(), 512);
        match loaded {
            Filter::Uncompressed(f) => {
                assert_eq!(f.words(), sample_ibf().words());
            }
            Filter::Compressed(_) => panic!("expected uncompressed layout"),
        }
    }

    #[test]
    fn test_round_trip_compressed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ref.skua");
        let compressed = sample_ibf().compress();
        save_filter(&Filter::Compressed(compressed), &path).unwrap();

        let (loaded, _) = load_filter(&path, true).unwrap();
        let plain = Filter::Uncompressed(sample_ibf());
        let probes: Vec<u64> = (0..300).map(|i| i * 13 + 1).collect();
        let mut a = crate::ibf::CountingAgent::new(&plain);
        let mut b = crate::ibf::CountingAgent::new(&loaded);
        assert_eq!(
            a.bulk_count(&probes).as_slice(),
            b.bulk_count(&probes).as_slice()
        );
    }

    #[test]
    fn test_layout_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ref.skua");
        save_filter(&Filter::Uncompressed(sample_ibf()), &path).unwrap();
        let err = load_filter(&path, true).unwrap_err();
        assert!(matches!(err, SkuaError::Format { .. }), "{}", err);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ref.skua");
        std::fs::write(&path, b"NOPEnope").unwrap();
        let err = load_filter(&path, false).unwrap_err();
        assert!(matches!(err, SkuaError::Format { .. }), "{}", err);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ref.skua");
        save_filter(&Filter::Uncompressed(sample_ibf()), &path).unwrap();

        // Stamp a future version over the header.
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap();
        file.seek(SeekFrom::Start(4)).unwrap();
        file.write_all(&99u32.to_le_bytes()).unwrap();

        let err = load_filter(&path, false).unwrap_err();
        match err {
            SkuaError::Version {
                found, expected, ..
            } => {
                assert_eq!(found, 99);
                assert_eq!(expected, VERSION);
            }
            other => panic!("expected version error, got {}", other),
        }
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_filter(Path::new("/nonexistent/ref.skua"), false).unwrap_err();
        assert!(matches!(err, SkuaError::Io { .. }), "{}", err);
    }

    #[test]
    fn test_part_path_suffix() {
        assert_eq!(
            part_path(Path::new("/data/ref.skua"), 2),
            PathBuf::from("/data/ref.skua_2")
        );
    }

    #[test]
    fn test_overlapped_loader() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ref.skua");
        save_filter(&Filter::Uncompressed(sample_ibf()), &path).unwrap();
        let handle = spawn_loader(path, false).unwrap();
        let (filter, elapsed) = join_loader(handle).unwrap();
        assert_eq!(filter.bin_count(), 70);
        assert!(elapsed >= 0.0);
    }
}
