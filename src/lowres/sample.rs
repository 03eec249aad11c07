use std::ops::{Add, Div};

/// RGBA color with premultiplied alpha, components in `0.0..=1.0`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub const TRANSPARENT: Color = Color {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 0.0,
    };

    /// Color whose components are already multiplied by alpha
    pub fn premultiplied(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn from_straight(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self {
            r: r * a,
            g: g * a,
            b: b * a,
            a,
        }
    }

    /// Decode a straight-alpha pixel
    pub fn from_rgba8(rgba: [u8; 4]) -> Self {
        let [r, g, b, a] = rgba.map(|c| c as f32 / 255.0);
        Self::from_straight(r, g, b, a)
    }

    /// Straight-alpha pixel, fully transparent colors become black
    pub fn to_rgba8(self) -> [u8; 4] {
        let to_byte = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
        if self.a <= 0.0 {
            return [0, 0, 0, 0];
        }
        [
            to_byte(self.r / self.a),
            to_byte(self.g / self.a),
            to_byte(self.b / self.a),
            to_byte(self.a),
        ]
    }
}

impl Add for Color {
    type Output = Color;

    fn add(self, other: Color) -> Color {
        Color {
            r: self.r + other.r,
            g: self.g + other.g,
            b: self.b + other.b,
            a: self.a + other.a,
        }
    }
}

impl Div<f32> for Color {
    type Output = Color;

    fn div(self, divisor: f32) -> Color {
        Color {
            r: self.r / divisor,
            g: self.g / divisor,
            b: self.b / divisor,
            a: self.a / divisor,
        }
    }
}

/// One point of a lowres tile
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    pub height: i32,
    /// Block light, `0..=15`
    pub block_light: u8,
    pub color: Color,
}

impl Sample {
    pub fn new(height: i32, block_light: u8, color: Color) -> Self {
        Self {
            height,
            block_light: block_light.min(15),
            color,
        }
    }

    /// Plain mean of heights and block light, colors summed while premultiplied.
    ///
    /// Integer means truncate toward zero. Returns the default sample for an
    /// empty input.
    pub fn average(samples: &[Sample]) -> Sample {
        if samples.is_empty() {
            return Sample::default();
        }

        let count = samples.len() as i64;
        let (height, light, color) = samples.iter().fold(
            (0i64, 0i64, Color::TRANSPARENT),
            |(height, light, color), sample| {
                (
                    height + sample.height as i64,
                    light + sample.block_light as i64,
                    color + sample.color,
                )
            },
        );

        Sample {
            height: (height / count) as i32,
            block_light: (light / count) as u8,
            color: color / count as f32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_straight_round_trip_keeps_opaque_colors() {
        let color = Color::from_rgba8([200, 100, 50, 255]);
        assert_eq!(color.to_rgba8(), [200, 100, 50, 255]);
    }

    #[test]
    fn test_transparent_color_encodes_as_zero() {
        assert_eq!(Color::premultiplied(0.5, 0.0, 0.0, 0.0).to_rgba8(), [0, 0, 0, 0]);
    }

    #[test]
    fn test_average_sums_premultiplied_colors() {
        let opaque_red = Sample::new(10, 4, Color::premultiplied(1.0, 0.0, 0.0, 1.0));
        let clear = Sample::new(20, 8, Color::TRANSPARENT);

        let average = Sample::average(&[opaque_red, clear]);
        assert_eq!(average.height, 15);
        assert_eq!(average.block_light, 6);
        assert_eq!(average.color, Color::premultiplied(0.5, 0.0, 0.0, 0.5));
        // Straight red at half alpha, not a darkened red
        assert_eq!(average.color.to_rgba8(), [255, 0, 0, 128]);
    }

    #[test]
    fn test_average_truncates_toward_zero() {
        let samples = [Sample::new(-3, 0, Color::TRANSPARENT), Sample::new(0, 1, Color::TRANSPARENT)];
        let average = Sample::average(&samples);
        assert_eq!(average.height, -1);
        assert_eq!(average.block_light, 0);
    }

    #[test]
    fn test_block_light_is_clamped() {
        assert_eq!(Sample::new(0, 200, Color::TRANSPARENT).block_light, 15);
    }
}
