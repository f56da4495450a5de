use crate::engine::cielab::srgb_to_cielab_pixel;
use crate::error::{BridgeError, Result};
use crate::image_handle::{ElementType, ImageHandle};
use aligned_vec::{AVec, ConstAlign};
use rayon::prelude::*;
use std::ops::{Index, IndexMut};

pub(crate) const ALIGN: usize = 64;

/// Row-major 2D storage with 64-byte aligned rows start.
#[derive(Debug, Clone)]
pub struct Array2D<T> {
    pub data: AVec<T, ConstAlign<ALIGN>>,
    pub width: usize,
    pub height: usize,
}

impl<T> Array2D<T> {
    pub fn from_slice(data: &[T], width: usize, height: usize) -> Result<Self>
    where
        T: Clone,
    {
        if data.len() != width * height {
            return Err(BridgeError::InvalidShape(format!(
                "{} elements cannot fill {width}x{height}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data: AVec::from_slice(ALIGN, data),
        })
    }

    pub fn from_fill(value: T, width: usize, height: usize) -> Self
    where
        T: Clone + Copy,
    {
        let data: AVec<T, ConstAlign<ALIGN>> =
            AVec::from_iter(ALIGN, (0..width * height).map(|_| value));
        Self {
            width,
            height,
            data,
        }
    }

    pub fn fill(&mut self, value: T)
    where
        T: Clone,
    {
        self.data.fill(value)
    }

    #[inline(always)]
    pub fn get_row(&self, row: usize) -> &[T] {
        debug_assert!(row < self.height);
        &self.data[(self.width * row)..(self.width * row + self.width)]
    }

    #[inline(always)]
    pub fn get_row_mut(&mut self, row: usize) -> &mut [T] {
        debug_assert!(row < self.height);
        &mut self.data[(self.width * row)..(self.width * row + self.width)]
    }

    #[inline(always)]
    pub fn get_index(&self, x: usize, y: usize) -> usize {
        debug_assert!(self.width > x);
        debug_assert!(self.height > y);
        self.width * y + x
    }

    pub fn as_slice(&self) -> &[T] {
        self.data.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.data.as_mut_slice()
    }
}

impl<T> Index<(usize, usize)> for Array2D<T> {
    type Output = T;
    fn index(&self, (x, y): (usize, usize)) -> &Self::Output {
        &self.data[self.get_index(x, y)]
    }
}

impl<T> IndexMut<(usize, usize)> for Array2D<T> {
    fn index_mut(&mut self, (x, y): (usize, usize)) -> &mut Self::Output {
        let idx = self.get_index(x, y);
        &mut self.data[idx]
    }
}

/// Packed Lab image with a padding byte per pixel (`[L, a, b, 0]`).
pub struct LabImage {
    pub lab_data: AVec<u8, ConstAlign<ALIGN>>,
    pub width: usize,
    pub height: usize,
}

impl LabImage {
    /// Converts any supported image handle to Lab.
    ///
    /// Single-channel and gray-alpha images are treated as gray RGB, a fourth channel is
    /// ignored, and `float32` samples are clamped to `[0, 1]` before quantization.
    pub fn from_handle(image: &ImageHandle<'_>) -> Self {
        let width = image.width();
        let height = image.height();
        let mut lab_data: AVec<u8, ConstAlign<ALIGN>> =
            AVec::from_iter(ALIGN, (0..width * height * 4).map(|_| 0u8));
        lab_data
            .as_mut_slice()
            .par_chunks_mut(width * 4)
            .enumerate()
            .for_each(|(y, out_row)| {
                let row = image.row(y);
                for (x, out) in out_row.chunks_exact_mut(4).enumerate() {
                    let rgb = rgb8_at(row, x, image.channels(), image.element_type());
                    out[..3].copy_from_slice(&srgb_to_cielab_pixel(&rgb));
                }
            });
        Self {
            width,
            height,
            lab_data,
        }
    }

    pub fn from_srgb(rgb_image: &[u8], width: usize, height: usize) -> Self {
        assert!(width > 0);
        assert!(height > 0);
        assert_eq!(rgb_image.len(), width * height * 3);
        let lab_data = AVec::from_iter(
            ALIGN,
            rgb_image.chunks_exact(3).flat_map(|p| {
                let lab = srgb_to_cielab_pixel(p);
                [lab[0], lab[1], lab[2], 0]
            }),
        );
        Self {
            width,
            height,
            lab_data,
        }
    }

    #[inline(always)]
    pub fn get_row(&self, row: usize) -> &[u8] {
        debug_assert!(row < self.height);
        &self.lab_data[(self.width * 4 * row)..(self.width * 4 * row + self.width * 4)]
    }

    #[inline(always)]
    pub fn get_index(&self, x: usize, y: usize) -> usize {
        debug_assert!(self.width > x);
        debug_assert!(self.height > y);
        self.width * y * 4 + x * 4
    }

    #[inline(always)]
    pub fn get_pixel(&self, x: usize, y: usize) -> &[u8] {
        let idx = self.get_index(x, y);
        &self.lab_data[idx..idx + 3]
    }
}

impl Index<(usize, usize)> for LabImage {
    type Output = [u8];
    fn index(&self, (x, y): (usize, usize)) -> &Self::Output {
        self.get_pixel(x, y)
    }
}

#[inline(always)]
pub(crate) fn rgb8_at(row: &[u8], x: usize, channels: usize, element_type: ElementType) -> [u8; 3] {
    let sample = |c: usize| -> u8 {
        match element_type {
            ElementType::U8 => row[x * channels + c],
            ElementType::F32 => {
                let offset = (x * channels + c) * 4;
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&row[offset..offset + 4]);
                quantize(f32::from_ne_bytes(bytes))
            }
        }
    };
    if channels >= 3 {
        [sample(0), sample(1), sample(2)]
    } else {
        let v = sample(0);
        [v, v, v]
    }
}

#[inline(always)]
pub(crate) fn quantize(value: f32) -> u8 {
    if value.is_nan() {
        return 0;
    }
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}
