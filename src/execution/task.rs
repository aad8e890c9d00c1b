//! Task descriptors.
//!
//! Work sent to a worker process is described as plain data: which array to
//! operate on (by name), what to do to each slice, and any fixed parameters.
//! The worker attaches the arrays itself and applies the task to the slice
//! indices of its chunk.

use crate::error::{Error, Result};
use crate::loader::read_image;
use crate::memory::{ArrayRef, Element, SharedArray, with_element};
use std::path::{Path, PathBuf};

/// Rectangular region of interest within a 2-D slice.
///
/// `right` and `bottom` are exclusive.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
)]
#[rkyv(derive(Debug))]
pub struct Roi {
    /// First column.
    pub left: u64,
    /// First row.
    pub top: u64,
    /// One past the last column.
    pub right: u64,
    /// One past the last row.
    pub bottom: u64,
}

impl Roi {
    /// Create a region from its edges.
    pub fn new(left: usize, top: usize, right: usize, bottom: usize) -> Self {
        Self {
            left: left as u64,
            top: top as u64,
            right: right as u64,
            bottom: bottom as u64,
        }
    }

    fn fits(&self, height: usize, width: usize) -> bool {
        self.left < self.right
            && self.top < self.bottom
            && self.right as usize <= width
            && self.bottom as usize <= height
    }
}

/// What to do to each slice.
#[derive(Clone, Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub enum TaskKind {
    /// Multiply every element by `factor`.
    Scale {
        /// Multiplier.
        factor: f64,
    },
    /// Set every element to `value`.
    Fill {
        /// Value to write.
        value: f64,
    },
    /// Write the deterministic test pattern from [`pattern_value`].
    WritePattern {
        /// Pattern seed.
        seed: u64,
    },
    /// Copy the same slice from another array of identical shape and type.
    CopyFrom {
        /// Array to copy from.
        source: ArrayRef,
    },
    /// Decode image file `paths[i]` into slice `i`.
    LoadImages {
        /// One path per slice.
        paths: Vec<String>,
    },
}

impl TaskKind {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Scale { .. } => "scale",
            Self::Fill { .. } => "fill",
            Self::WritePattern { .. } => "write-pattern",
            Self::CopyFrom { .. } => "copy",
            Self::LoadImages { .. } => "load-images",
        }
    }

    fn is_elementwise(&self) -> bool {
        matches!(self, Self::Scale { .. } | Self::Fill { .. })
    }
}

/// A complete unit of work: target array, per-slice operation and an
/// optional region of interest.
#[derive(Clone, Debug, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[rkyv(derive(Debug))]
pub struct Task {
    /// Array modified in place.
    pub target: ArrayRef,
    /// Per-slice operation.
    pub kind: TaskKind,
    /// Restricts element-wise operations to this region of each slice.
    pub roi: Option<Roi>,
}

impl Task {
    /// Task operating on `target`.
    pub fn new(target: &SharedArray, kind: TaskKind) -> Self {
        Self {
            target: target.array_ref(),
            kind,
            roi: None,
        }
    }

    /// Restrict the task to a region of interest.
    pub fn with_roi(mut self, roi: Roi) -> Self {
        self.roi = Some(roi);
        self
    }

    /// Check that the task can process `total_items` slices, without
    /// touching shared memory.
    pub fn validate(&self, total_items: usize) -> Result<()> {
        let shape = self.target.shape();
        let slices = shape.first().copied().unwrap_or(0);
        if total_items > slices {
            return Err(Error::InvalidSegment(format!(
                "{} has {slices} slices, cannot process {total_items}",
                self.target.name
            )));
        }

        if let Some(roi) = &self.roi {
            if !self.kind.is_elementwise() {
                return Err(Error::Config(format!(
                    "{} does not take a region of interest",
                    self.kind.name()
                )));
            }
            if shape.len() != 3 || !roi.fits(shape[1], shape[2]) {
                return Err(Error::Config(format!(
                    "region {roi:?} does not fit slices of {shape:?}"
                )));
            }
        }

        match &self.kind {
            TaskKind::CopyFrom { source } => {
                if source.shape != self.target.shape || source.dtype != self.target.dtype {
                    return Err(Error::InvalidSegment(format!(
                        "cannot copy {:?} {} into {:?} {}",
                        source.shape, source.dtype, self.target.shape, self.target.dtype
                    )));
                }
            }
            TaskKind::LoadImages { paths } => {
                if paths.len() < total_items {
                    return Err(Error::Config(format!(
                        "{} paths for {total_items} slices",
                        paths.len()
                    )));
                }
                if shape.len() != 3 {
                    return Err(Error::Config(format!(
                        "images load into 3-D stacks, target is {shape:?}"
                    )));
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Map the arrays this task touches from `dir`.
    pub fn attach(&self, dir: &Path) -> Result<BoundTask<'_>> {
        let target = SharedArray::attach_ref(dir, &self.target)?;
        let source = match &self.kind {
            TaskKind::CopyFrom { source } => Some(SharedArray::attach_ref(dir, source)?),
            _ => None,
        };
        Ok(BoundTask {
            task: self,
            target,
            source,
        })
    }
}

/// A task with its arrays mapped into this process.
#[derive(Debug)]
pub struct BoundTask<'a> {
    task: &'a Task,
    target: SharedArray,
    source: Option<SharedArray>,
}

impl BoundTask<'_> {
    /// Apply the task to slice `index`.
    ///
    /// Errors that do not already identify the failing item are wrapped in
    /// [`Error::WorkerTask`] carrying `index`.
    pub fn apply(&mut self, index: usize) -> Result<()> {
        self.apply_inner(index).map_err(|e| match e {
            Error::DimensionMismatch { .. } | Error::Load { .. } | Error::WorkerTask { .. } => e,
            other => Error::WorkerTask {
                index,
                message: other.to_string(),
            },
        })
    }

    fn apply_inner(&mut self, index: usize) -> Result<()> {
        let roi = self.task.roi;
        let dtype = self.target.dtype();
        match &self.task.kind {
            TaskKind::Scale { factor } => {
                let factor = *factor;
                with_element!(dtype, T => {
                    map_slice::<T>(&mut self.target, index, roi, |v| v * factor)
                })
            }
            TaskKind::Fill { value } => {
                let value = *value;
                with_element!(dtype, T => {
                    map_slice::<T>(&mut self.target, index, roi, |_| value)
                })
            }
            TaskKind::WritePattern { seed } => {
                let seed = *seed;
                with_element!(dtype, T => {
                    let slice = self.target.slice_mut::<T>(index)?;
                    for (j, v) in slice.iter_mut().enumerate() {
                        *v = T::from_f64(pattern_value(seed, index, j));
                    }
                    Ok(())
                })
            }
            TaskKind::CopyFrom { .. } => {
                let source = self
                    .source
                    .as_ref()
                    .ok_or_else(|| Error::InvalidSegment("copy source not attached".into()))?;
                let bytes = source.slice_bytes(index)?;
                self.target.slice_bytes_mut(index)?.copy_from_slice(bytes);
                Ok(())
            }
            TaskKind::LoadImages { paths } => {
                let path = PathBuf::from(paths.get(index).ok_or_else(|| {
                    Error::Config(format!("no image path for slice {index}"))
                })?);
                let expected = self.target.slice_shape().to_vec();
                let image = read_image(&path)?;
                if image.shape != expected {
                    return Err(Error::DimensionMismatch {
                        path,
                        expected,
                        actual: image.shape,
                    });
                }
                if !dtype.holds_bits(image.bits) {
                    return Err(Error::Load {
                        path,
                        reason: format!("{}-bit samples do not fit a {dtype} array", image.bits),
                    });
                }
                let pixels = image.pixels;
                with_element!(dtype, T => {
                    let slice = self.target.slice_mut::<T>(index)?;
                    for (dst, &src) in slice.iter_mut().zip(&pixels) {
                        *dst = T::from_f64(src);
                    }
                    Ok(())
                })
            }
        }
    }
}

/// Value of the test pattern at element `j` of slice `index`.
///
/// Always an integer in `0..251`, so it is exact in every element type.
pub fn pattern_value(seed: u64, index: usize, j: usize) -> f64 {
    let mixed = seed
        .wrapping_mul(31)
        .wrapping_add(index as u64 * 7919)
        .wrapping_add(j as u64);
    (mixed % 251) as f64
}

fn map_slice<T: Element>(
    array: &mut SharedArray,
    index: usize,
    roi: Option<Roi>,
    f: impl Fn(f64) -> f64,
) -> Result<()> {
    let width = array.slice_shape().last().copied().unwrap_or(1);
    let slice = array.slice_mut::<T>(index)?;
    match roi {
        None => {
            for v in slice.iter_mut() {
                *v = T::from_f64(f(v.to_f64()));
            }
        }
        Some(roi) => {
            for row in roi.top as usize..roi.bottom as usize {
                let start = row * width;
                for v in &mut slice[start + roi.left as usize..start + roi.right as usize] {
                    *v = T::from_f64(f(v.to_f64()));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::DType;

    fn array(dir: &Path, name: &str, shape: &[usize], dtype: DType) -> SharedArray {
        SharedArray::create(dir, name, shape, dtype).unwrap()
    }

    #[test]
    fn test_scale_slice() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = array(dir.path(), "TP_1_scale", &[3, 2, 2], DType::F32);
        a.as_mut_slice::<f32>().unwrap().fill(1.5);

        let task = Task::new(&a, TaskKind::Scale { factor: 2.0 });
        let mut bound = task.attach(dir.path()).unwrap();
        bound.apply(1).unwrap();

        assert_eq!(a.slice::<f32>(0).unwrap(), &[1.5; 4]);
        assert_eq!(a.slice::<f32>(1).unwrap(), &[3.0; 4]);
        assert_eq!(a.slice::<f32>(2).unwrap(), &[1.5; 4]);
    }

    #[test]
    fn test_fill_with_roi() {
        let dir = tempfile::tempdir().unwrap();
        let a = array(dir.path(), "TP_1_roi", &[1, 4, 4], DType::U16);

        let task = Task::new(&a, TaskKind::Fill { value: 9.0 }).with_roi(Roi::new(1, 2, 3, 4));
        task.validate(1).unwrap();
        task.attach(dir.path()).unwrap().apply(0).unwrap();

        #[rustfmt::skip]
        let expected: [u16; 16] = [
            0, 0, 0, 0,
            0, 0, 0, 0,
            0, 9, 9, 0,
            0, 9, 9, 0,
        ];
        assert_eq!(a.slice::<u16>(0).unwrap(), &expected);
    }

    #[test]
    fn test_pattern_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let a = array(dir.path(), "TP_1_pat", &[2, 3], DType::U8);

        let task = Task::new(&a, TaskKind::WritePattern { seed: 5 });
        let mut bound = task.attach(dir.path()).unwrap();
        bound.apply(0).unwrap();
        bound.apply(1).unwrap();

        for i in 0..2 {
            for (j, &v) in a.slice::<u8>(i).unwrap().iter().enumerate() {
                assert_eq!(v as f64, pattern_value(5, i, j));
            }
        }
    }

    #[test]
    fn test_copy_from() {
        let dir = tempfile::tempdir().unwrap();
        let mut src = array(dir.path(), "TP_1_src", &[2, 2], DType::F64);
        let dst = array(dir.path(), "TP_1_dst", &[2, 2], DType::F64);
        src.as_mut_slice::<f64>().unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);

        let task = Task::new(&dst, TaskKind::CopyFrom { source: src.array_ref() });
        task.validate(2).unwrap();
        let mut bound = task.attach(dir.path()).unwrap();
        bound.apply(1).unwrap();

        assert_eq!(dst.as_slice::<f64>().unwrap(), &[0.0, 0.0, 3.0, 4.0]);
    }

    #[test]
    fn test_validate_rejects_bad_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let a = array(dir.path(), "TP_1_val", &[2, 4, 4], DType::F32);
        let b = array(dir.path(), "TP_1_val2", &[2, 4, 4], DType::U16);

        assert!(Task::new(&a, TaskKind::Fill { value: 0.0 }).validate(3).is_err());
        assert!(Task::new(&a, TaskKind::Fill { value: 0.0 })
            .with_roi(Roi::new(0, 0, 5, 4))
            .validate(2)
            .is_err());
        assert!(Task::new(&a, TaskKind::WritePattern { seed: 0 })
            .with_roi(Roi::new(0, 0, 1, 1))
            .validate(2)
            .is_err());
        assert!(Task::new(&a, TaskKind::CopyFrom { source: b.array_ref() })
            .validate(2)
            .is_err());
        assert!(Task::new(&a, TaskKind::LoadImages { paths: vec!["x.tif".into()] })
            .validate(2)
            .is_err());
    }

    #[test]
    fn test_missing_image_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let a = array(dir.path(), "TP_1_load", &[1, 2, 2], DType::F32);
        let missing = dir.path().join("missing.tif").to_string_lossy().into_owned();

        let task = Task::new(&a, TaskKind::LoadImages { paths: vec![missing] });
        let err = task.attach(dir.path()).unwrap().apply(0).unwrap_err();
        assert!(matches!(err, Error::Load { path, .. } if path.ends_with("missing.tif")));
    }

    #[test]
    fn test_other_errors_carry_index() {
        let dir = tempfile::tempdir().unwrap();
        let a = array(dir.path(), "TP_1_idx", &[2, 2], DType::F32);
        let task = Task::new(&a, TaskKind::Fill { value: 1.0 });
        let err = task.attach(dir.path()).unwrap().apply(5).unwrap_err();
        assert!(matches!(err, Error::WorkerTask { index: 5, .. }));
    }
}
