//! Reading and writing images and label maps on disk.

use crate::arrays::{quantize, rgb8_at};
use crate::error::{BridgeError, Result};
use crate::image_handle::{ElementType, ImageHandle, OwnedImage};
use crate::label_map::{LabelMap, Labels, UNLABELED};
use image::{ColorType, DynamicImage, ImageBuffer, Luma};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

/// Stored in 16-bit label PNGs for unlabeled pixels.
const PNG_UNLABELED: u16 = u16::MAX;

fn dimension(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| BridgeError::Raster(format!("dimension {value} too large")))
}

/// Decodes an image. 8-bit and float images keep their layout, 16-bit ones are reduced
/// to 8 bits.
pub fn load_image(path: impl AsRef<Path>) -> Result<OwnedImage> {
    let path = path.as_ref();
    let decoded = image::open(path)?;
    let (width, height) = (decoded.width() as usize, decoded.height() as usize);
    let image = match decoded {
        DynamicImage::ImageLuma8(buf) => OwnedImage::from_u8(buf.as_raw(), width, height, 1)?,
        DynamicImage::ImageLumaA8(buf) => OwnedImage::from_u8(buf.as_raw(), width, height, 2)?,
        DynamicImage::ImageRgb8(buf) => OwnedImage::from_u8(buf.as_raw(), width, height, 3)?,
        DynamicImage::ImageRgba8(buf) => OwnedImage::from_u8(buf.as_raw(), width, height, 4)?,
        DynamicImage::ImageRgb32F(buf) => OwnedImage::from_f32(buf.as_raw(), width, height, 3)?,
        DynamicImage::ImageRgba32F(buf) => OwnedImage::from_f32(buf.as_raw(), width, height, 4)?,
        other if other.color().has_alpha() => {
            OwnedImage::from_u8(other.to_rgba8().as_raw(), width, height, 4)?
        }
        other if other.color().has_color() => {
            OwnedImage::from_u8(other.to_rgb8().as_raw(), width, height, 3)?
        }
        other => OwnedImage::from_u8(other.to_luma8().as_raw(), width, height, 1)?,
    };
    debug!(
        path = %path.display(),
        width,
        height,
        channels = image.channels(),
        element_type = %image.element_type(),
        "loaded image"
    );
    Ok(image)
}

/// Encodes an image with 1 to 4 channels; the format follows the file extension.
/// `float32` samples are clamped to `[0, 1]` and stored as 8-bit.
pub fn save_image(image: &ImageHandle<'_>, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let color = match image.channels() {
        1 => ColorType::L8,
        2 => ColorType::La8,
        3 => ColorType::Rgb8,
        4 => ColorType::Rgba8,
        n => {
            return Err(BridgeError::UnsupportedLayout(format!(
                "cannot encode {n} channels"
            )))
        }
    };
    let bytes = match image.element_type() {
        ElementType::U8 => image.to_contiguous_bytes(),
        ElementType::F32 => (0..image.height())
            .flat_map(|y| {
                (0..image.width() * image.channels()).map(move |i| {
                    quantize(image.sample(i / image.channels(), y, i % image.channels()))
                })
            })
            .collect(),
    };
    image::save_buffer(
        path,
        &bytes,
        dimension(image.width())?,
        dimension(image.height())?,
        color,
    )?;
    debug!(path = %path.display(), "saved image");
    Ok(())
}

/// Reads a 16-bit grayscale label PNG; `65535` reads back as unlabeled.
pub fn load_labels_png(path: impl AsRef<Path>) -> Result<Labels> {
    let decoded = image::open(path.as_ref())?.into_luma16();
    let (width, height) = (decoded.width() as usize, decoded.height() as usize);
    let data = decoded
        .into_raw()
        .into_iter()
        .map(|v| if v == PNG_UNLABELED { UNLABELED } else { v as i32 })
        .collect();
    Labels::from_vec(data, width, height)
}

/// Writes labels as a 16-bit grayscale PNG. Labels must fit in `[-1, 65535)`.
pub fn save_labels_png(labels: &LabelMap<'_>, path: impl AsRef<Path>) -> Result<()> {
    let mut data = Vec::with_capacity(labels.width() * labels.height());
    for y in 0..labels.height() {
        for (x, value) in labels.row(y).iter().enumerate() {
            let stored = match *value {
                UNLABELED => PNG_UNLABELED,
                v if (0..PNG_UNLABELED as i32).contains(&v) => v as u16,
                v => {
                    return Err(BridgeError::LabelOutOfRange {
                        value: v,
                        x,
                        y,
                        count: PNG_UNLABELED as u32,
                    })
                }
            };
            data.push(stored);
        }
    }
    let buffer: ImageBuffer<Luma<u16>, Vec<u16>> =
        ImageBuffer::from_raw(dimension(labels.width())?, dimension(labels.height())?, data)
            .ok_or_else(|| BridgeError::Raster("label buffer size mismatch".to_string()))?;
    buffer.save(path.as_ref())?;
    Ok(())
}

/// Reads comma separated label rows, one image row per line.
pub fn read_labels_csv(path: impl AsRef<Path>) -> Result<Labels> {
    let text = std::fs::read_to_string(path.as_ref())?;
    let mut data = Vec::new();
    let mut width = None;
    let mut height = 0;
    for (line_number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let before = data.len();
        for field in line.split(',') {
            let value = field.trim().parse::<i32>().map_err(|err| {
                BridgeError::Raster(format!("line {}: `{field}`: {err}", line_number + 1))
            })?;
            data.push(value);
        }
        let row_width = data.len() - before;
        match width {
            None => width = Some(row_width),
            Some(w) if w != row_width => {
                return Err(BridgeError::InvalidShape(format!(
                    "line {} has {row_width} labels, expected {w}",
                    line_number + 1
                )))
            }
            Some(_) => {}
        }
        height += 1;
    }
    let width =
        width.ok_or_else(|| BridgeError::InvalidShape("label file has no rows".to_string()))?;
    Labels::from_vec(data, width, height)
}

pub fn write_labels_csv(labels: &LabelMap<'_>, path: impl AsRef<Path>) -> Result<()> {
    let mut out = BufWriter::new(File::create(path.as_ref())?);
    for y in 0..labels.height() {
        let row: Vec<String> = labels.row(y).iter().map(|v| v.to_string()).collect();
        writeln!(out, "{}", row.join(","))?;
    }
    out.flush()?;
    Ok(())
}

/// RGB copy of `image` with every pixel on a superpixel boundary painted `color`.
///
/// A pixel is on a boundary when its right or lower neighbour carries another label.
pub fn draw_contours(
    image: &ImageHandle<'_>,
    labels: &LabelMap<'_>,
    color: [u8; 3],
) -> Result<OwnedImage> {
    labels.validate_against(image)?;
    let (width, height) = (image.width(), image.height());
    let mut out = OwnedImage::new(width, height, 3, ElementType::U8)?;
    let bytes = out.as_bytes_mut();
    for y in 0..height {
        let row = image.row(y);
        for x in 0..width {
            let value = labels.get(x, y);
            let edge = (x + 1 < width && labels.get(x + 1, y) != value)
                || (y + 1 < height && labels.get(x, y + 1) != value);
            let pixel = if edge {
                color
            } else {
                rgb8_at(row, x, image.channels(), image.element_type())
            };
            let offset = (y * width + x) * 3;
            bytes[offset..offset + 3].copy_from_slice(&pixel);
        }
    }
    Ok(out)
}
