//! Binary greymap raster (netpbm `P5`) decoding.
//!
//! A raster file starts with the magic number `P5`, followed by the width, the height and the
//! maximum sample value written as ASCII decimals. Tokens are separated by whitespace and `#`
//! comments may appear between them. A single whitespace byte terminates the header, then
//! `width * height` samples follow in row-major order. Samples take one byte when the maximum
//! value is below 256 and two bytes otherwise.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAGIC: &[u8; 2] = b"P5";

/// Error raised when a buffer is not a valid binary greymap.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// The buffer does not start with the `P5` magic number.
    #[error("missing `P5` magic number")]
    MissingMagic,

    /// A header field is absent or unparsable.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// Zero-sized or overflowing dimensions.
    #[error("invalid dimensions {width}x{height}")]
    InvalidDimensions {
        /// Declared width.
        width: u32,
        /// Declared height.
        height: u32,
    },

    /// The maximum sample value is outside `1..=65535`.
    #[error("invalid max value {0}, expected a value in 1..=65535")]
    InvalidMaxValue(u32),

    /// The pixel payload does not match `width * height * sample_size`.
    #[error("payload is {actual} bytes long, expected exactly {expected}")]
    PayloadLength {
        /// Expected payload length in bytes.
        expected: usize,
        /// Actual payload length in bytes.
        actual: usize,
    },
}

/// Byte order of two-byte samples. Netpbm mandates big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ByteOrder {
    /// Most significant byte first.
    #[default]
    BigEndian,
    /// Least significant byte first.
    LittleEndian,
}

/// Storage size of a single sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleDepth {
    /// 8-bit unsigned.
    U8,
    /// 16-bit unsigned.
    U16,
}

impl SampleDepth {
    /// Depth implied by a header's maximum value.
    pub fn for_max_value(max_value: u16) -> Self {
        if max_value < 256 {
            SampleDepth::U8
        } else {
            SampleDepth::U16
        }
    }

    /// Size of one sample in bytes.
    pub fn size(&self) -> usize {
        match self {
            SampleDepth::U8 => 1,
            SampleDepth::U16 => 2,
        }
    }
}

/// Flat, row-major sample buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Samples {
    /// 8-bit samples.
    U8(Vec<u8>),
    /// 16-bit samples.
    U16(Vec<u16>),
}

impl Samples {
    /// Number of samples.
    pub fn len(&self) -> usize {
        match self {
            Samples::U8(values) => values.len(),
            Samples::U16(values) => values.len(),
        }
    }

    /// Whether the buffer holds no sample.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Storage depth of the buffer.
    pub fn depth(&self) -> SampleDepth {
        match self {
            Samples::U8(_) => SampleDepth::U8,
            Samples::U16(_) => SampleDepth::U16,
        }
    }

    /// Sample at the given flat index, widened to `u16`.
    pub fn get(&self, index: usize) -> Option<u16> {
        match self {
            Samples::U8(values) => values.get(index).map(|&v| v as u16),
            Samples::U16(values) => values.get(index).copied(),
        }
    }

    /// Copies the samples in `start..end`.
    ///
    /// Panics if the range is out of bounds.
    pub(crate) fn slice(&self, start: usize, end: usize) -> Samples {
        match self {
            Samples::U8(values) => Samples::U8(values[start..end].to_vec()),
            Samples::U16(values) => Samples::U16(values[start..end].to_vec()),
        }
    }

    /// Converts every sample to 16 bits.
    pub fn widen(self) -> Vec<u16> {
        match self {
            Samples::U8(values) => values.into_iter().map(u16::from).collect(),
            Samples::U16(values) => values,
        }
    }

    fn iter(&self) -> Box<dyn Iterator<Item = u16> + '_> {
        match self {
            Samples::U8(values) => Box::new(values.iter().map(|&v| v as u16)),
            Samples::U16(values) => Box::new(values.iter().copied()),
        }
    }
}

/// A decoded greymap: `height` rows of `width` samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasterImage {
    height: usize,
    width: usize,
    max_value: u16,
    samples: Samples,
}

impl RasterImage {
    /// Creates an image from row-major samples.
    pub fn new(
        height: usize,
        width: usize,
        max_value: u16,
        samples: Samples,
    ) -> Result<Self, FormatError> {
        let expected = height
            .checked_mul(width)
            .filter(|&len| len > 0)
            .ok_or(FormatError::InvalidDimensions {
                width: width as u32,
                height: height as u32,
            })?;

        if max_value == 0 {
            return Err(FormatError::InvalidMaxValue(0));
        }

        if samples.len() != expected {
            return Err(FormatError::PayloadLength {
                expected: expected * samples.depth().size(),
                actual: samples.len() * samples.depth().size(),
            });
        }

        Ok(Self {
            height,
            width,
            max_value,
            samples,
        })
    }

    /// Number of rows.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Number of columns.
    pub fn width(&self) -> usize {
        self.width
    }

    /// `(height, width)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Maximum sample value declared by the source.
    pub fn max_value(&self) -> u16 {
        self.max_value
    }

    /// Storage depth of the samples.
    pub fn depth(&self) -> SampleDepth {
        self.samples.depth()
    }

    /// Row-major samples.
    pub fn samples(&self) -> &Samples {
        &self.samples
    }

    /// Consumes the image, returning its samples.
    pub fn into_samples(self) -> Samples {
        self.samples
    }

    /// Sample at `(row, col)`.
    pub fn get(&self, row: usize, col: usize) -> Option<u16> {
        if row >= self.height || col >= self.width {
            return None;
        }
        self.samples.get(row * self.width + col)
    }

    /// Samples as floats scaled to `[0, 1]` by the maximum value.
    pub fn to_f32(&self) -> Vec<f32> {
        let max = self.max_value as f32;
        self.samples.iter().map(|v| v as f32 / max).collect()
    }

    /// Encodes the image as a binary greymap.
    ///
    /// The sample size is chosen from the maximum value, so a widened 8-bit image is written back
    /// with one byte per sample. Two-byte samples are written big-endian.
    pub fn to_pgm(&self) -> Vec<u8> {
        let depth = SampleDepth::for_max_value(self.max_value);
        let header = format!("P5\n{} {}\n{}\n", self.width, self.height, self.max_value);

        let mut bytes = Vec::with_capacity(header.len() + self.samples.len() * depth.size());
        bytes.extend_from_slice(header.as_bytes());

        match depth {
            SampleDepth::U8 => bytes.extend(self.samples.iter().map(|v| v as u8)),
            SampleDepth::U16 => {
                for value in self.samples.iter() {
                    bytes.extend_from_slice(&value.to_be_bytes());
                }
            }
        }

        bytes
    }
}

/// Decodes a binary greymap with big-endian two-byte samples.
pub fn decode(bytes: &[u8]) -> Result<RasterImage, FormatError> {
    decode_with(bytes, ByteOrder::BigEndian)
}

/// Decodes a binary greymap, reading two-byte samples in the given byte order.
pub fn decode_with(bytes: &[u8], byte_order: ByteOrder) -> Result<RasterImage, FormatError> {
    let mut header = HeaderReader::new(bytes);
    header.magic()?;
    let width = header.field("width")?;
    let height = header.field("height")?;
    let max_value = header.field("max value")?;
    let offset = header.end()?;

    if max_value == 0 || max_value > u16::MAX as u32 {
        return Err(FormatError::InvalidMaxValue(max_value));
    }
    let max_value = max_value as u16;
    let depth = SampleDepth::for_max_value(max_value);

    let invalid_dimensions = FormatError::InvalidDimensions { width, height };
    if width == 0 || height == 0 {
        return Err(invalid_dimensions);
    }
    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|len| len.checked_mul(depth.size()))
        .ok_or(invalid_dimensions)?;

    let payload = &bytes[offset..];
    if payload.len() != expected {
        return Err(FormatError::PayloadLength {
            expected,
            actual: payload.len(),
        });
    }

    let samples = match depth {
        SampleDepth::U8 => Samples::U8(payload.to_vec()),
        SampleDepth::U16 => Samples::U16(
            payload
                .chunks_exact(2)
                .map(|pair| {
                    let pair = [pair[0], pair[1]];
                    match byte_order {
                        ByteOrder::BigEndian => u16::from_be_bytes(pair),
                        ByteOrder::LittleEndian => u16::from_le_bytes(pair),
                    }
                })
                .collect(),
        ),
    };

    RasterImage::new(height as usize, width as usize, max_value, samples)
}

/// Cursor over the ASCII header.
struct HeaderReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> HeaderReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn magic(&mut self) -> Result<(), FormatError> {
        if !self.bytes.starts_with(MAGIC) {
            return Err(FormatError::MissingMagic);
        }
        self.pos = MAGIC.len();

        match self.bytes.get(self.pos) {
            Some(byte) if byte.is_ascii_whitespace() => Ok(()),
            _ => Err(FormatError::MissingMagic),
        }
    }

    /// Skips whitespace and comments, a comment running up to the end of its line.
    fn skip_separators(&mut self) {
        while let Some(&byte) = self.bytes.get(self.pos) {
            if byte.is_ascii_whitespace() {
                self.pos += 1;
            } else if byte == b'#' {
                while let Some(&byte) = self.bytes.get(self.pos) {
                    self.pos += 1;
                    if byte == b'\n' || byte == b'\r' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn field(&mut self, name: &str) -> Result<u32, FormatError> {
        self.skip_separators();

        let start = self.pos;
        while self.bytes.get(self.pos).is_some_and(u8::is_ascii_digit) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(FormatError::MalformedHeader(format!(
                "expected {name} at byte {start}"
            )));
        }

        let digits = String::from_utf8_lossy(&self.bytes[start..self.pos]);
        digits
            .parse::<u32>()
            .map_err(|_| FormatError::MalformedHeader(format!("{name} `{digits}` is too large")))
    }

    /// Consumes the single whitespace byte closing the header, returning the payload offset.
    fn end(&mut self) -> Result<usize, FormatError> {
        match self.bytes.get(self.pos) {
            Some(byte) if byte.is_ascii_whitespace() => Ok(self.pos + 1),
            _ => Err(FormatError::MalformedHeader(
                "expected whitespace after max value".to_string(),
            )),
        }
    }
}
