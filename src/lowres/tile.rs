//! One lowres tile and its PNG encoding
//!
//! The image is `size + 1` pixels wide and `2 * (size + 1)` high. The top half
//! holds the straight-alpha color of each point. The bottom half packs block
//! light into red and the height, as a signed 16 bit big endian value, into
//! green and blue.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use image::{ImageFormat, Rgba, RgbaImage};
use parking_lot::{Mutex, RwLock};

use super::{Color, LowresError, LowresResult, Sample};

pub struct LowresTile {
    size: u32,
    image: RwLock<RgbaImage>,
    dirty: AtomicBool,
    last_save: Mutex<Instant>,
}

impl LowresTile {
    /// Blank tile with `size` points per edge plus the seam margin
    pub fn new(size: u32) -> Self {
        let edge = size + 1;
        let mut image = RgbaImage::new(edge, edge * 2);
        for z in 0..edge {
            for x in 0..edge {
                image.put_pixel(x, edge + z, Rgba([0, 0, 0, 255]));
            }
        }
        Self::from_image(size, image)
    }

    pub fn from_png(size: u32, data: &[u8]) -> LowresResult<Self> {
        let image = image::load_from_memory_with_format(data, ImageFormat::Png)?.to_rgba8();
        let (width, height) = (size + 1, (size + 1) * 2);
        if image.dimensions() != (width, height) {
            return Err(LowresError::TileSize {
                width,
                height,
                found_width: image.width(),
                found_height: image.height(),
            });
        }
        Ok(Self::from_image(size, image))
    }

    fn from_image(size: u32, image: RgbaImage) -> Self {
        Self {
            size,
            image: RwLock::new(image),
            dirty: AtomicBool::new(false),
            last_save: Mutex::new(Instant::now()),
        }
    }

    pub fn to_png(&self) -> LowresResult<Vec<u8>> {
        let mut data = Cursor::new(Vec::new());
        self.image.read().write_to(&mut data, ImageFormat::Png)?;
        Ok(data.into_inner())
    }

    /// Points per edge, not counting the margin
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Set the point at `x, z`, both in `0..=size`
    pub fn set(&self, x: u32, z: u32, sample: &Sample) {
        if x > self.size || z > self.size {
            log::warn!("Ignoring lowres write outside the tile at {},{}", x, z);
            return;
        }

        let edge = self.size + 1;
        let [height_hi, height_lo] = (sample.height.clamp(i16::MIN as i32, i16::MAX as i32) as i16).to_be_bytes();
        {
            let mut image = self.image.write();
            image.put_pixel(x, z, Rgba(sample.color.to_rgba8()));
            image.put_pixel(x, edge + z, Rgba([sample.block_light, height_hi, height_lo, 255]));
        }
        self.dirty.store(true, Ordering::Release);
    }

    pub fn get(&self, x: u32, z: u32) -> Sample {
        if x > self.size || z > self.size {
            return Sample::default();
        }
        let image = self.image.read();
        decode_point(&image, self.size + 1, x, z)
    }

    /// Every interior point, row by row, read under a single lock
    pub(crate) fn interior(&self) -> Vec<Sample> {
        let edge = self.size + 1;
        let image = self.image.read();
        let mut samples = Vec::with_capacity((self.size * self.size) as usize);
        for z in 0..self.size {
            for x in 0..self.size {
                samples.push(decode_point(&image, edge, x, z));
            }
        }
        samples
    }

    /// Whether the tile changed since it was last saved
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn last_save(&self) -> Instant {
        *self.last_save.lock()
    }

    /// Clear the dirty flag, returning whether it was set
    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn mark_saved(&self) {
        *self.last_save.lock() = Instant::now();
    }
}

fn decode_point(image: &RgbaImage, edge: u32, x: u32, z: u32) -> Sample {
    let Rgba(color) = *image.get_pixel(x, z);
    let Rgba([light, height_hi, height_lo, _]) = *image.get_pixel(x, edge + z);
    Sample {
        height: i16::from_be_bytes([height_hi, height_lo]) as i32,
        block_light: light,
        color: Color::from_rgba8(color),
    }
}

impl std::fmt::Debug for LowresTile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LowresTile")
            .field("size", &self.size)
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn red(height: i32) -> Sample {
        Sample::new(height, 10, Color::premultiplied(1.0, 0.0, 0.0, 1.0))
    }

    #[test]
    fn test_new_tile_is_clean_and_blank() {
        let tile = LowresTile::new(4);
        assert!(!tile.is_dirty());
        assert_eq!(tile.get(4, 4), Sample::default());
    }

    #[test]
    fn test_set_marks_dirty_and_reads_back() {
        let tile = LowresTile::new(4);
        tile.set(4, 0, &red(-70));
        assert!(tile.is_dirty());
        assert_eq!(tile.get(4, 0), red(-70));
        assert!(tile.take_dirty());
        assert!(!tile.is_dirty());
    }

    #[test]
    fn test_png_keeps_points_and_margin() {
        let tile = LowresTile::new(8);
        tile.set(0, 0, &red(64));
        tile.set(8, 8, &red(300));

        let png = tile.to_png().expect("encode");
        let decoded = LowresTile::from_png(8, &png).expect("decode");
        assert_eq!(decoded.get(0, 0), red(64));
        assert_eq!(decoded.get(8, 8), red(300));
        assert!(!decoded.is_dirty());
    }

    #[test]
    fn test_png_of_other_size_is_rejected() {
        let png = LowresTile::new(8).to_png().expect("encode");
        assert!(matches!(LowresTile::from_png(16, &png), Err(LowresError::TileSize { .. })));
    }

    #[test]
    fn test_heights_beyond_16_bits_saturate() {
        let tile = LowresTile::new(2);
        tile.set(1, 1, &red(100_000));
        assert_eq!(tile.get(1, 1).height, i16::MAX as i32);
    }

    #[test]
    fn test_out_of_range_write_is_ignored() {
        let tile = LowresTile::new(2);
        tile.set(3, 0, &red(1));
        assert!(!tile.is_dirty());
    }
}
