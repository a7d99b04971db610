//! Core types for decoded APTS and OPAMP event data.
//!
//! This module defines the frame, event and waveform structures produced by
//! the decoders, together with the chip variant that selects the pixel mapping.

/// Number of pixels (and ADC channels) on an APTS matrix.
pub const PIXELS: usize = 16;

/// Side length of the square APTS pixel matrix.
pub const MATRIX_SIDE: usize = 4;

/// Physical-to-logical pixel mapping of the standard APTS flavours.
///
/// `APTS_PIXEL_ADC_MAPPING[adc]` is the logical pixel index `x + 4 * y`
/// read out by ADC channel `adc`.
pub const APTS_PIXEL_ADC_MAPPING: [u8; PIXELS] =
    [2, 1, 5, 0, 4, 8, 9, 12, 13, 14, 10, 15, 11, 7, 6, 3];

/// Physical-to-logical pixel mapping of the multiplexed APTS flavours.
pub const APTS_MUX_PIXEL_ADC_MAPPING: [u8; PIXELS] =
    [3, 2, 1, 0, 4, 8, 9, 5, 12, 13, 14, 15, 10, 11, 6, 7];

/// Chip front-end variant, which determines how ADC channels map to pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChipVariant {
    /// Non-multiplexed chip (the default for APTS SF and OPAMP readout)
    #[default]
    Standard,
    /// Chip with the on-pixel multiplexer selecting among front-ends
    Mux,
}

impl ChipVariant {
    /// Returns the ADC-to-pixel mapping table for this variant.
    #[inline]
    pub fn pixel_adc_mapping(&self) -> &'static [u8; PIXELS] {
        match self {
            Self::Standard => &APTS_PIXEL_ADC_MAPPING,
            Self::Mux => &APTS_MUX_PIXEL_ADC_MAPPING,
        }
    }
}

/// One time sample of the full 4x4 pixel matrix.
///
/// Values are stored by logical pixel index `x + 4 * y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pixels: [u16; PIXELS],
}

impl Frame {
    /// Creates a frame from values ordered by logical pixel index.
    #[inline]
    pub fn new(pixels: [u16; PIXELS]) -> Self {
        Self { pixels }
    }

    /// Returns the ADC value of pixel (`x`, `y`).
    ///
    /// # Panics
    ///
    /// Panics if either coordinate is outside the 4x4 matrix.
    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u16 {
        assert!(x < MATRIX_SIDE && y < MATRIX_SIDE, "pixel ({x},{y}) outside matrix");
        self.pixels[x + MATRIX_SIDE * y]
    }

    /// Returns all pixel values ordered by logical pixel index.
    #[inline]
    pub fn pixels(&self) -> &[u16; PIXELS] {
        &self.pixels
    }
}

/// A decoded APTS (or OPAMP ADC) event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AptsEvent {
    /// Frames in acquisition order
    pub frames: Vec<Frame>,
    /// Per-frame 48-bit timestamps, when requested from the decoder
    pub frame_timestamps: Option<Vec<u64>>,
    /// Trigger timestamp appended by the firmware, if present
    pub trigger_timestamp: Option<u64>,
}

impl AptsEvent {
    /// Shape of the waveform array, `[x, y, frames]`.
    #[inline]
    pub fn shape(&self) -> [usize; 3] {
        [MATRIX_SIDE, MATRIX_SIDE, self.frames.len()]
    }

    /// Returns the waveform of pixel (`x`, `y`) across all frames.
    pub fn waveform(&self, x: usize, y: usize) -> Vec<u16> {
        self.frames.iter().map(|frame| frame.get(x, y)).collect()
    }
}

/// All events of one APTS run, shape-checked against the first event.
#[derive(Debug, Clone, Default)]
pub struct AptsRun {
    pub events: Vec<AptsEvent>,
}

impl AptsRun {
    /// Number of frames per event (0 for an empty run).
    pub fn frames_per_event(&self) -> usize {
        self.events.first().map_or(0, |event| event.frames.len())
    }

    /// Trigger timestamps of all events, in event order.
    pub fn trigger_timestamps(&self) -> Vec<Option<u64>> {
        self.events.iter().map(|event| event.trigger_timestamp).collect()
    }
}

/// Storage width of one oscilloscope sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleWidth {
    /// Signed 8-bit samples
    #[default]
    I8,
    /// Signed 16-bit little-endian samples
    I16,
    /// 32-bit little-endian float samples
    F32,
}

impl SampleWidth {
    /// Parses a sample width from its size in bytes (1, 2 or 4).
    #[inline]
    pub fn from_bytes(bytes: usize) -> Option<Self> {
        match bytes {
            1 => Some(Self::I8),
            2 => Some(Self::I16),
            4 => Some(Self::F32),
            _ => None,
        }
    }

    /// Size of one sample in bytes.
    #[inline]
    pub fn bytes(&self) -> usize {
        match self {
            Self::I8 => 1,
            Self::I16 => 2,
            Self::F32 => 4,
        }
    }
}

/// Oscilloscope samples of one event, stored channel-major.
#[derive(Debug, Clone, PartialEq)]
pub enum ScopeSamples {
    I8(Vec<i8>),
    I16(Vec<i16>),
    F32(Vec<f32>),
}

impl ScopeSamples {
    /// Total number of samples over all channels.
    pub fn len(&self) -> usize {
        match self {
            Self::I8(v) => v.len(),
            Self::I16(v) => v.len(),
            Self::F32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A decoded oscilloscope event of shape `(channels, samples)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeEvent {
    pub channels: usize,
    pub samples: usize,
    pub data: ScopeSamples,
}

impl ScopeEvent {
    #[inline]
    pub fn shape(&self) -> [usize; 2] {
        [self.channels, self.samples]
    }

    /// Returns one channel's waveform converted to `f64`.
    ///
    /// # Panics
    ///
    /// Panics if `channel >= self.channels`.
    pub fn channel(&self, channel: usize) -> Vec<f64> {
        assert!(channel < self.channels, "channel {channel} out of range");
        let range = channel * self.samples..(channel + 1) * self.samples;
        match &self.data {
            ScopeSamples::I8(v) => v[range].iter().map(|&s| s as f64).collect(),
            ScopeSamples::I16(v) => v[range].iter().map(|&s| s as f64).collect(),
            ScopeSamples::F32(v) => v[range].iter().map(|&s| s as f64).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_permutation(mapping: &[u8; PIXELS]) -> bool {
        let mut seen = [false; PIXELS];
        for &pixel in mapping {
            if seen[pixel as usize] {
                return false;
            }
            seen[pixel as usize] = true;
        }
        seen.iter().all(|&s| s)
    }

    #[test]
    fn test_mappings_are_bijections() {
        assert!(is_permutation(ChipVariant::Standard.pixel_adc_mapping()));
        assert!(is_permutation(ChipVariant::Mux.pixel_adc_mapping()));
    }

    #[test]
    fn test_frame_indexing() {
        let mut pixels = [0u16; PIXELS];
        pixels[1 + 4 * 2] = 1234;
        let frame = Frame::new(pixels);
        assert_eq!(frame.get(1, 2), 1234);
        assert_eq!(frame.get(2, 1), 0);
    }

    #[test]
    fn test_sample_width_parsing() {
        assert_eq!(SampleWidth::from_bytes(1), Some(SampleWidth::I8));
        assert_eq!(SampleWidth::from_bytes(2), Some(SampleWidth::I16));
        assert_eq!(SampleWidth::from_bytes(4), Some(SampleWidth::F32));
        assert_eq!(SampleWidth::from_bytes(3), None);
        assert_eq!(SampleWidth::F32.bytes(), 4);
    }

    #[test]
    fn test_scope_channel_extraction() {
        let event = ScopeEvent {
            channels: 2,
            samples: 3,
            data: ScopeSamples::I16(vec![1, 2, 3, -4, -5, -6]),
        };
        assert_eq!(event.shape(), [2, 3]);
        assert_eq!(event.channel(1), vec![-4.0, -5.0, -6.0]);
    }
}
