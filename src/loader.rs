//! Loading image stacks into shared memory.
//!
//! Every file in a stack becomes one slice along the leading axis. The first
//! file fixes the slice dimensions; the whole stack is allocated before any
//! other file is read, so an oversized stack fails before the expensive
//! part starts.

use crate::error::{Error, Result};
use crate::execution::{NoProgress, ParallelEngine, ProgressReporter, Task, TaskKind};
use crate::memory::{Allocator, DType, Element, SharedArray, with_element};
use image::{DynamicImage, ImageError};
use std::path::{Path, PathBuf};

/// A decoded grayscale image.
pub(crate) struct GrayImage {
    /// `[height, width]`.
    pub shape: Vec<usize>,
    /// Pixels in row-major order.
    pub pixels: Vec<f64>,
    /// Bits per sample after decoding.
    pub bits: u32,
}

/// Decode a grayscale image.
///
/// 8- and 16-bit gray images keep their values; anything else is converted
/// to 16-bit gray.
pub(crate) fn read_image(path: &Path) -> Result<GrayImage> {
    let image = image::open(path).map_err(|e| Error::Load {
        path: path.to_path_buf(),
        reason: match e {
            ImageError::IoError(io) => io.to_string(),
            other => other.to_string(),
        },
    })?;

    let shape = vec![image.height() as usize, image.width() as usize];
    let (pixels, bits): (Vec<f64>, u32) = match image {
        DynamicImage::ImageLuma8(buf) => (buf.into_raw().into_iter().map(f64::from).collect(), 8),
        DynamicImage::ImageLuma16(buf) => {
            (buf.into_raw().into_iter().map(f64::from).collect(), 16)
        }
        other => (
            other.to_luma16().into_raw().into_iter().map(f64::from).collect(),
            16,
        ),
    };
    Ok(GrayImage {
        shape,
        pixels,
        bits,
    })
}

/// Loads image files into shared arrays.
#[derive(Debug, Clone, Copy)]
pub struct StackLoader<'a> {
    allocator: &'a Allocator,
    engine: &'a ParallelEngine,
    cores: Option<usize>,
    chunksize: Option<usize>,
}

impl<'a> StackLoader<'a> {
    /// Loader allocating from `allocator` and running on `engine`.
    pub fn new(allocator: &'a Allocator, engine: &'a ParallelEngine) -> Self {
        Self {
            allocator,
            engine,
            cores: None,
            chunksize: None,
        }
    }

    /// Use at most `cores` processes.
    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = Some(cores);
        self
    }

    /// Dispatch `chunksize` files at a time.
    pub fn with_chunksize(mut self, chunksize: usize) -> Self {
        self.chunksize = Some(chunksize);
        self
    }

    /// Load `paths` into a new `(N, H, W)` array owned by the allocator.
    ///
    /// On any error the partially filled array is freed.
    pub fn load(
        &self,
        paths: &[PathBuf],
        dtype: DType,
        progress: &mut dyn ProgressReporter,
    ) -> Result<SharedArray> {
        let first = paths
            .first()
            .ok_or_else(|| Error::Config("no images to load".into()))?;
        let slice_shape = read_image(first)?.shape;
        let names = paths
            .iter()
            .map(|path| {
                path.to_str().map(str::to_owned).ok_or_else(|| Error::Load {
                    path: path.clone(),
                    reason: "path is not valid UTF-8".into(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let shape = [paths.len(), slice_shape[0], slice_shape[1]];
        let array = self.allocator.create(&shape, dtype)?;
        tracing::info!(segment = array.name(), ?shape, %dtype, "loading image stack");

        let task = Task::new(&array, TaskKind::LoadImages { paths: names });
        let cores = self.engine.plan_cores(&shape, self.cores);
        match self
            .engine
            .execute(paths.len(), &task, cores, self.chunksize, progress, "Loading")
        {
            Ok(()) => Ok(array),
            Err(e) => {
                if let Err(free_err) = self.allocator.free(array) {
                    tracing::warn!(error = %free_err, "failed to free partially loaded stack");
                }
                Err(e)
            }
        }
    }

    /// Per-pixel mean of the images in `paths`, as `H * W` values.
    ///
    /// Used for flat and dark fields. The temporary stack is freed before
    /// returning.
    pub fn load_average(&self, paths: &[PathBuf], dtype: DType) -> Result<Vec<f64>> {
        let stack = self.load(paths, dtype, &mut NoProgress)?;
        let mean = mean_along_leading_axis(&stack);
        self.allocator.free(stack)?;
        mean
    }
}

fn mean_along_leading_axis(array: &SharedArray) -> Result<Vec<f64>> {
    let count = array.num_slices();
    let mut sum = vec![0.0f64; array.slice_len()];
    with_element!(array.dtype(), T => {
        for index in 0..count {
            for (acc, &v) in sum.iter_mut().zip(array.slice::<T>(index)?) {
                *acc += v.to_f64();
            }
        }
    });
    if count > 0 {
        sum.iter_mut().for_each(|v| *v /= count as f64);
    }
    Ok(sum)
}
