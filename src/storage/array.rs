//! Memory-mapped, fixed-shape `f64` arrays.
//!
//! Each array lives in its own file: a 128-byte header followed by the row-major,
//! little-endian samples. The file is sized once at allocation time, so the data region
//! is zero-filled and every cell can be written in place, any number of times, without
//! touching its neighbours.
//!
//! Header layout (128 bytes):
//! - magic: u64
//! - dtype: u32
//! - rank: u32
//! - shape: [u64; 14], unused dimensions set to 0

use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::error::{DaqError, DaqResult};

/// Magic number for array header validation
const MAGIC: u64 = 0xDA_DA_5C_A4_00_00_00_01;

/// Size of the array header in bytes
const HEADER_SIZE: usize = 128;

/// Largest supported number of dimensions.
pub const MAX_RANK: usize = 14;

/// Sample type code written in the header.
const DTYPE_F64: u32 = 1;

const SAMPLE_SIZE: usize = std::mem::size_of::<f64>();

/// A fixed-shape array backed by a memory-mapped file.
pub struct PersistedArray {
    path: PathBuf,
    mmap: MmapMut,
    shape: Vec<usize>,
    len: usize,
}

impl std::fmt::Debug for PersistedArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedArray")
            .field("path", &self.path)
            .field("shape", &self.shape)
            .finish()
    }
}

fn element_count(shape: &[usize]) -> DaqResult<usize> {
    shape
        .iter()
        .try_fold(1usize, |total, dim| total.checked_mul(*dim))
        .ok_or_else(|| DaqError::Persistence(format!("array shape {:?} overflows", shape)))
}

/// File size of an array of `len` elements, header included.
fn file_size_of(shape: &[usize], len: usize) -> DaqResult<usize> {
    len.checked_mul(SAMPLE_SIZE)
        .and_then(|bytes| bytes.checked_add(HEADER_SIZE))
        .ok_or_else(|| DaqError::Persistence(format!("array shape {:?} overflows", shape)))
}

impl PersistedArray {
    /// Allocate a zero-filled array of `shape` at `path`, replacing any existing file.
    pub fn create(path: &Path, shape: &[usize]) -> DaqResult<Self> {
        if shape.len() > MAX_RANK {
            return Err(DaqError::Persistence(format!(
                "array rank {} exceeds the maximum of {}",
                shape.len(),
                MAX_RANK
            )));
        }
        let len = element_count(shape)?;
        let total_size = file_size_of(shape, len)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                DaqError::Persistence(format!("failed to create array file {:?}: {}", path, e))
            })?;
        file.set_len(total_size as u64).map_err(|e| {
            DaqError::Persistence(format!("failed to size array file {:?}: {}", path, e))
        })?;

        // SAFETY: the file was just created and sized by us; the container directory is
        // owned by the running scan and nothing else truncates it while mapped.
        let mut mmap = unsafe {
            MmapOptions::new().map_mut(&file).map_err(|e| {
                DaqError::Persistence(format!("failed to map array file {:?}: {}", path, e))
            })?
        };

        let header = &mut mmap[..HEADER_SIZE];
        header[0..8].copy_from_slice(&MAGIC.to_le_bytes());
        header[8..12].copy_from_slice(&DTYPE_F64.to_le_bytes());
        header[12..16].copy_from_slice(&(shape.len() as u32).to_le_bytes());
        for (k, dim) in shape.iter().enumerate() {
            let at = 16 + 8 * k;
            header[at..at + 8].copy_from_slice(&(*dim as u64).to_le_bytes());
        }

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            shape: shape.to_vec(),
            len,
        })
    }

    /// Map an existing array file, validating its header against the file size.
    pub fn open(path: &Path) -> DaqResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                DaqError::Persistence(format!("failed to open array file {:?}: {}", path, e))
            })?;
        let file_size = file.metadata()?.len();
        if file_size < HEADER_SIZE as u64 {
            return Err(DaqError::Persistence(format!(
                "array file {:?} is shorter than its header",
                path
            )));
        }

        // SAFETY: the file is at least HEADER_SIZE bytes long and is only read through
        // bounds-checked slices below.
        let mmap = unsafe {
            MmapOptions::new().map_mut(&file).map_err(|e| {
                DaqError::Persistence(format!("failed to map array file {:?}: {}", path, e))
            })?
        };

        let read_u64 = |at: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&mmap[at..at + 8]);
            u64::from_le_bytes(bytes)
        };
        let read_u32 = |at: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&mmap[at..at + 4]);
            u32::from_le_bytes(bytes)
        };

        if read_u64(0) != MAGIC {
            return Err(DaqError::Persistence(format!(
                "{:?} is not an array file (bad magic)",
                path
            )));
        }
        if read_u32(8) != DTYPE_F64 {
            return Err(DaqError::Persistence(format!(
                "{:?} has an unsupported sample type",
                path
            )));
        }
        let rank = read_u32(12) as usize;
        if rank > MAX_RANK {
            return Err(DaqError::Persistence(format!(
                "{:?} declares rank {}",
                path, rank
            )));
        }
        let shape: Vec<usize> = (0..rank).map(|k| read_u64(16 + 8 * k) as usize).collect();
        let len = element_count(&shape)?;
        let expected = file_size_of(&shape, len)? as u64;
        if expected != file_size {
            return Err(DaqError::Persistence(format!(
                "array size mismatch: {:?} has {} bytes but shape {:?} needs {}",
                path, file_size, shape, expected
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            shape,
            len,
        })
    }

    /// Shape of the array.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the array holds no element.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Element range addressed by a (possibly partial) index.
    ///
    /// An index of `k` entries selects the contiguous block spanning the trailing
    /// `rank - k` dimensions.
    fn block(&self, index: &[usize]) -> DaqResult<std::ops::Range<usize>> {
        if index.len() > self.shape.len() {
            return Err(DaqError::Persistence(format!(
                "index {:?} has more entries than shape {:?}",
                index, self.shape
            )));
        }
        let mut offset = 0usize;
        for (i, dim) in index.iter().zip(&self.shape) {
            if i >= dim {
                return Err(DaqError::Persistence(format!(
                    "index {:?} is out of bounds for shape {:?}",
                    index, self.shape
                )));
            }
            offset = offset * dim + i;
        }
        let block: usize = self.shape[index.len()..].iter().product();
        let start = offset * block;
        Ok(start..start + block)
    }

    /// Overwrite the block at `index` with `values`.
    ///
    /// `values` must fill the block exactly. Writing the same index again replaces the
    /// previous values; no other cell is touched.
    pub fn write_at(&mut self, index: &[usize], values: &[f64]) -> DaqResult<()> {
        let range = self.block(index)?;
        if values.len() != range.len() {
            return Err(DaqError::Persistence(format!(
                "{} values do not fit the {} cells at index {:?} of {:?}",
                values.len(),
                range.len(),
                index,
                self.path
            )));
        }
        let bytes = &mut self.mmap[HEADER_SIZE + range.start * SAMPLE_SIZE
            ..HEADER_SIZE + range.end * SAMPLE_SIZE];
        for (chunk, value) in bytes.chunks_exact_mut(SAMPLE_SIZE).zip(values) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        Ok(())
    }

    /// Copy of the block at `index`.
    pub fn read_at(&self, index: &[usize]) -> DaqResult<Vec<f64>> {
        let range = self.block(index)?;
        let bytes =
            &self.mmap[HEADER_SIZE + range.start * SAMPLE_SIZE..HEADER_SIZE + range.end * SAMPLE_SIZE];
        Ok(bytes
            .chunks_exact(SAMPLE_SIZE)
            .map(|chunk| {
                let mut raw = [0u8; SAMPLE_SIZE];
                raw.copy_from_slice(chunk);
                f64::from_le_bytes(raw)
            })
            .collect())
    }

    /// Copy of the whole array, row-major.
    pub fn to_vec(&self) -> DaqResult<Vec<f64>> {
        self.read_at(&[])
    }

    /// Flush outstanding writes to disk.
    pub fn flush(&self) -> DaqResult<()> {
        self.mmap.flush().map_err(|e| {
            DaqError::Persistence(format!("failed to flush {:?}: {}", self.path, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_is_zero_filled() {
        let dir = tempdir().unwrap();
        let array = PersistedArray::create(&dir.path().join("a.arr"), &[3, 4]).unwrap();
        assert_eq!(array.len(), 12);
        assert_eq!(array.to_vec().unwrap(), vec![0.0; 12]);
    }

    #[test]
    fn test_rewrite_keeps_last_value_and_neighbours() {
        let dir = tempdir().unwrap();
        let mut array = PersistedArray::create(&dir.path().join("a.arr"), &[3, 2]).unwrap();
        array.write_at(&[0], &[1.0, 1.5]).unwrap();
        array.write_at(&[2], &[3.0, 3.5]).unwrap();
        array.write_at(&[1], &[2.0, 2.5]).unwrap();
        array.write_at(&[1], &[9.0, 9.5]).unwrap();
        assert_eq!(
            array.to_vec().unwrap(),
            vec![1.0, 1.5, 9.0, 9.5, 3.0, 3.5]
        );
    }

    #[test]
    fn test_write_rejects_bad_index_and_length() {
        let dir = tempdir().unwrap();
        let mut array = PersistedArray::create(&dir.path().join("a.arr"), &[2, 2]).unwrap();
        assert!(array.write_at(&[2, 0], &[1.0]).is_err());
        assert!(array.write_at(&[0], &[1.0]).is_err());
        assert!(array.write_at(&[0, 0, 0], &[1.0]).is_err());
        array.write_at(&[1, 1], &[4.0]).unwrap();
        assert_eq!(array.read_at(&[1]).unwrap(), vec![0.0, 4.0]);
    }

    #[test]
    fn test_reopen_preserves_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.arr");
        {
            let mut array = PersistedArray::create(&path, &[2, 2, 2]).unwrap();
            array.write_at(&[1, 0], &[5.0, 6.0]).unwrap();
            array.flush().unwrap();
        }
        let reopened = PersistedArray::open(&path).unwrap();
        assert_eq!(reopened.shape(), &[2, 2, 2]);
        assert_eq!(reopened.read_at(&[1, 0]).unwrap(), vec![5.0, 6.0]);
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.arr");
        std::fs::write(&path, vec![7u8; 256]).unwrap();
        assert!(PersistedArray::open(&path).is_err());
    }

    #[test]
    fn test_open_rejects_overflowing_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("huge.arr");
        {
            let array = PersistedArray::create(&path, &[2]).unwrap();
            array.flush().unwrap();
        }
        // element count fits usize, its byte size does not
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[16..24].copy_from_slice(&((usize::MAX / 4) as u64).to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        let err = PersistedArray::open(&path).unwrap_err();
        assert!(err.to_string().contains("overflows"));
    }

    #[test]
    fn test_scalar_array_has_one_cell() {
        let dir = tempdir().unwrap();
        let mut array = PersistedArray::create(&dir.path().join("s.arr"), &[]).unwrap();
        array.write_at(&[], &[2.5]).unwrap();
        assert_eq!(array.to_vec().unwrap(), vec![2.5]);
    }
}
