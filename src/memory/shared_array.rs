//! Named shared memory arrays.
//!
//! A [`SharedArray`] is a file in the shared memory directory (`/dev/shm` on
//! Linux, which is exactly where `shm_open` puts its objects) mapped with
//! `MAP_SHARED` and interpreted as a C-ordered n-dimensional array. Any
//! process that knows the name, shape and element type can map the same
//! pages, so only an [`ArrayRef`] ever crosses a process boundary.

use super::dtype::{DType, Element};
use crate::error::{Error, Result};
use rustix::fs::FallocateFlags;
use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Plain-data description of a shared array, sent to worker processes.
#[derive(Clone, Debug, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct ArrayRef {
    /// Segment name.
    pub name: String,
    /// Array shape, leading axis first.
    pub shape: Vec<u64>,
    /// Element type.
    pub dtype: DType,
}

impl ArrayRef {
    /// Shape as `usize` values.
    pub fn shape(&self) -> Vec<usize> {
        self.shape.iter().map(|&d| d as usize).collect()
    }
}

/// A mapped, named shared memory array.
///
/// Dropping the handle unmaps it but leaves the segment in the namespace;
/// removing the segment is the allocator's job.
pub struct SharedArray {
    name: String,
    path: PathBuf,
    shape: Vec<usize>,
    dtype: DType,
    /// `None` for zero-sized arrays, which map nothing.
    ptr: Option<NonNull<u8>>,
    len: usize,
}

impl SharedArray {
    /// Create a new zero-initialised segment in `dir`.
    ///
    /// The full size is reserved up front so that an exhausted shared memory
    /// filesystem fails here rather than with `SIGBUS` halfway through a
    /// computation.
    pub(crate) fn create(dir: &Path, name: &str, shape: &[usize], dtype: DType) -> Result<Self> {
        validate_name(name)?;
        let len = byte_len(name, shape, dtype)?;
        let path = dir.join(name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => Error::SegmentExists(name.to_string()),
                _ => Error::AllocationFailed {
                    name: name.to_string(),
                    bytes: len,
                    reason: e.to_string(),
                },
            })?;

        let mapped = reserve(&file, len).and_then(|()| map(&file, len));
        let ptr = match mapped {
            Ok(ptr) => ptr,
            Err(errno) => {
                let _ = std::fs::remove_file(&path);
                return Err(Error::AllocationFailed {
                    name: name.to_string(),
                    bytes: len,
                    reason: errno.to_string(),
                });
            }
        };

        tracing::debug!(segment = name, bytes = len, ?shape, %dtype, "created shared array");

        Ok(Self {
            name: name.to_string(),
            path,
            shape: shape.to_vec(),
            dtype,
            ptr,
            len,
        })
    }

    /// Map an existing segment from `dir`.
    ///
    /// The segment size must match `shape` and `dtype` exactly.
    pub fn attach(dir: &Path, name: &str, shape: &[usize], dtype: DType) -> Result<Self> {
        validate_name(name)?;
        let len = byte_len(name, shape, dtype)?;
        let path = dir.join(name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => {
                    Error::InvalidSegment(format!("segment {name} does not exist"))
                }
                _ => Error::Io(e),
            })?;

        let actual = file.metadata()?.len();
        if actual != len as u64 {
            return Err(Error::InvalidSegment(format!(
                "segment {name} holds {actual} bytes, expected {len} for {shape:?} {dtype}"
            )));
        }

        let ptr = map(&file, len)?;
        Ok(Self {
            name: name.to_string(),
            path,
            shape: shape.to_vec(),
            dtype,
            ptr,
            len,
        })
    }

    /// Map the segment described by `array` from `dir`.
    pub fn attach_ref(dir: &Path, array: &ArrayRef) -> Result<Self> {
        Self::attach(dir, &array.name, &array.shape(), array.dtype)
    }

    /// Segment name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Array shape, leading axis first.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Size in bytes.
    pub fn len_bytes(&self) -> usize {
        self.len
    }

    /// Length of the leading axis.
    pub fn num_slices(&self) -> usize {
        self.shape[0]
    }

    /// Shape of one slice along the leading axis.
    pub fn slice_shape(&self) -> &[usize] {
        &self.shape[1..]
    }

    /// Number of elements in one slice.
    pub fn slice_len(&self) -> usize {
        self.slice_shape().iter().product()
    }

    /// Plain-data reference for sending to workers.
    pub fn array_ref(&self) -> ArrayRef {
        ArrayRef {
            name: self.name.clone(),
            shape: self.shape.iter().map(|&d| d as u64).collect(),
            dtype: self.dtype,
        }
    }

    /// Raw bytes of the whole array.
    ///
    /// Like every shared view, the bytes can still be written by another
    /// mapping of the same segment, such as a worker process. Do not hold a
    /// view across work dispatched on this segment.
    pub fn as_bytes(&self) -> &[u8] {
        match self.ptr {
            // SAFETY: the mapping is `len` bytes long and lives as long as `self`.
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len) },
            None => &[],
        }
    }

    /// Mutable raw bytes of the whole array.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self.ptr {
            // SAFETY: as above; `&mut self` rules out aliasing through this handle.
            Some(ptr) => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.len) },
            None => &mut [],
        }
    }

    /// Whole array as elements of `T`.
    ///
    /// See [`as_bytes`](Self::as_bytes) for writes from other mappings.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        self.check_dtype::<T>()?;
        let count = self.len / self.dtype.size();
        Ok(match self.ptr {
            // SAFETY: mmap returns page-aligned memory, `T` matches the dtype
            // and `Element` guarantees every bit pattern is valid.
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr().cast::<T>(), count) },
            None => &[],
        })
    }

    /// Whole array as mutable elements of `T`.
    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        self.check_dtype::<T>()?;
        let count = self.len / self.dtype.size();
        Ok(match self.ptr {
            // SAFETY: see `as_slice`.
            Some(ptr) => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr().cast::<T>(), count)
            },
            None => &mut [],
        })
    }

    /// One slice along the leading axis.
    pub fn slice<T: Element>(&self, index: usize) -> Result<&[T]> {
        let range = self.slice_range(index)?;
        Ok(&self.as_slice::<T>()?[range])
    }

    /// One mutable slice along the leading axis.
    pub fn slice_mut<T: Element>(&mut self, index: usize) -> Result<&mut [T]> {
        let range = self.slice_range(index)?;
        Ok(&mut self.as_mut_slice::<T>()?[range])
    }

    /// Raw bytes of one slice along the leading axis.
    pub fn slice_bytes(&self, index: usize) -> Result<&[u8]> {
        let range = self.slice_range(index)?;
        let size = self.dtype.size();
        Ok(&self.as_bytes()[range.start * size..range.end * size])
    }

    /// Mutable raw bytes of one slice along the leading axis.
    pub fn slice_bytes_mut(&mut self, index: usize) -> Result<&mut [u8]> {
        let range = self.slice_range(index)?;
        let size = self.dtype.size();
        Ok(&mut self.as_bytes_mut()[range.start * size..range.end * size])
    }

    fn slice_range(&self, index: usize) -> Result<std::ops::Range<usize>> {
        if index >= self.num_slices() {
            return Err(Error::InvalidSegment(format!(
                "slice index {index} out of range for {} with {} slices",
                self.name,
                self.num_slices()
            )));
        }
        let slice_len = self.slice_len();
        Ok(index * slice_len..(index + 1) * slice_len)
    }

    fn check_dtype<T: Element>(&self) -> Result<()> {
        if T::DTYPE != self.dtype {
            return Err(Error::DTypeMismatch {
                actual: self.dtype.name(),
                requested: T::DTYPE.name(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for SharedArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedArray")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .finish()
    }
}

impl Drop for SharedArray {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr {
            unsafe {
                let _ = rustix::mm::munmap(ptr.as_ptr().cast(), self.len);
            }
        }
    }
}

// SAFETY: the mapping is process-wide memory with no thread-local state.
// Mutation in this process goes through `&mut self`, including operations
// that hand the segment to workers; cross-process writers touch disjoint
// slices.
unsafe impl Send for SharedArray {}
unsafe impl Sync for SharedArray {}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(Error::InvalidSegment(format!("invalid segment name {name:?}")));
    }
    Ok(())
}

fn byte_len(name: &str, shape: &[usize], dtype: DType) -> Result<usize> {
    if shape.is_empty() {
        return Err(Error::InvalidSegment(format!(
            "segment {name} needs at least one dimension"
        )));
    }
    shape
        .iter()
        .try_fold(dtype.size(), |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| Error::AllocationFailed {
            name: name.to_string(),
            bytes: usize::MAX,
            reason: format!("size of {shape:?} {dtype} overflows"),
        })
}

/// Reserve backing pages so exhaustion is reported now.
fn reserve(file: &File, len: usize) -> std::result::Result<(), Errno> {
    if len == 0 {
        return Ok(());
    }
    match rustix::fs::fallocate(file, FallocateFlags::empty(), 0, len as u64) {
        Ok(()) => Ok(()),
        Err(Errno::OPNOTSUPP) | Err(Errno::NOSYS) => rustix::fs::ftruncate(file, len as u64),
        Err(e) => Err(e),
    }
}

fn map(file: &File, len: usize) -> std::result::Result<Option<NonNull<u8>>, Errno> {
    if len == 0 {
        return Ok(None);
    }
    let ptr = unsafe {
        rustix::mm::mmap(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED,
            file,
            0,
        )?
    };
    Ok(NonNull::new(ptr.cast::<u8>()))
}
