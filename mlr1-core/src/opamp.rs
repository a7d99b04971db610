//! Dual-stream decoder for OPAMP acquisitions.
//!
//! An OPAMP run records two independent streams: the DAQ board ADC stream,
//! framed exactly like APTS data, and the oscilloscope waveform stream, which
//! has no sentinels at all. Scope events are located purely by position: each
//! occupies `channels * samples * sample_width` bytes, channel-major.
//!
//! The two streams keep separate cursors and counters. Matching ADC event `k`
//! with scope event `k` is left to the caller.

use crate::decoder::{AptsDecoder, DecodeError};
use crate::progress::{ProgressSink, ProgressSlot};
use crate::types::{AptsEvent, AptsRun, ChipVariant, SampleWidth, ScopeEvent, ScopeSamples};
use byteorder::{ByteOrder, LittleEndian};

/// Geometry of one oscilloscope event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeLayout {
    /// Number of measured channels
    pub channels: usize,
    /// Samples per channel (the scope memory depth)
    pub samples: usize,
    pub sample_width: SampleWidth,
}

impl ScopeLayout {
    /// Bytes of one channel waveform, or `None` if it overflows `usize`.
    #[inline]
    pub fn waveform_size(&self) -> Option<usize> {
        self.samples.checked_mul(self.sample_width.bytes())
    }

    /// Bytes of one full scope event, or `None` if it overflows `usize`.
    #[inline]
    pub fn event_size(&self) -> Option<usize> {
        self.waveform_size()?.checked_mul(self.channels)
    }

    /// Error for a geometry no stream of `available` bytes can hold.
    fn oversized(available: usize) -> DecodeError {
        DecodeError::Truncated {
            event: 0,
            offset: 0,
            needed: usize::MAX,
            available,
        }
    }
}

/// Per-waveform header and footer added by the oscilloscope on transfer.
///
/// The raw scope stream is a sequence of
/// `scanned_points * pulses * channels` blocks of
/// `header_bytes + waveform + footer_bytes` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderTrim {
    pub header_bytes: usize,
    pub footer_bytes: usize,
    pub pulses: usize,
    pub scanned_points: usize,
}

impl HeaderTrim {
    /// Number of waveform blocks expected in the stream, or `None` on overflow.
    #[inline]
    pub fn blocks(&self, layout: &ScopeLayout) -> Option<usize> {
        self.scanned_points
            .checked_mul(self.pulses)?
            .checked_mul(layout.channels)
    }

    /// Strips header and footer from every block and concatenates the waveforms.
    ///
    /// All expected blocks must be complete. One extra complete block after
    /// them is kept as well; anything shorter is dropped.
    pub fn strip(&self, raw: &[u8], layout: &ScopeLayout) -> Result<Vec<u8>, DecodeError> {
        let oversized = || ScopeLayout::oversized(raw.len());
        let waveform = layout.waveform_size().ok_or_else(oversized)?;
        let block = self
            .header_bytes
            .checked_add(waveform)
            .and_then(|n| n.checked_add(self.footer_bytes))
            .ok_or_else(oversized)?;
        let expected = self.blocks(layout).ok_or_else(oversized)?;

        let capacity = expected
            .saturating_add(1)
            .saturating_mul(waveform)
            .min(raw.len());
        let mut out = Vec::with_capacity(capacity);
        for k in 0..=expected {
            let start = k
                .checked_mul(block)
                .and_then(|n| n.checked_add(self.header_bytes));
            let samples = start
                .and_then(|start| Some(start..start.checked_add(waveform)?))
                .and_then(|range| raw.get(range));
            match samples {
                Some(samples) => out.extend_from_slice(samples),
                None if k == expected => {
                    let leftover = raw.len().saturating_sub(k.saturating_mul(block));
                    if leftover > 0 {
                        log::warn!("Dropping {} trailing scope bytes after {} blocks", leftover, k);
                    }
                }
                None => {
                    let offset = start.unwrap_or(usize::MAX);
                    return Err(DecodeError::Truncated {
                        event: k,
                        offset,
                        needed: waveform,
                        available: raw.len().saturating_sub(offset),
                    });
                }
            }
        }
        Ok(out)
    }
}

/// Decodes one scope event of `layout.event_size()` bytes.
///
/// # Panics
///
/// Panics if `data` is not exactly one event long.
pub fn decode_scope_event(data: &[u8], layout: &ScopeLayout) -> ScopeEvent {
    assert_eq!(Some(data.len()), layout.event_size(), "scope event size mismatch");
    let n = data.len() / layout.sample_width.bytes();
    let samples = match layout.sample_width {
        SampleWidth::I8 => ScopeSamples::I8(data.iter().map(|&b| b as i8).collect()),
        SampleWidth::I16 => {
            let mut values = vec![0i16; n];
            LittleEndian::read_i16_into(data, &mut values);
            ScopeSamples::I16(values)
        }
        SampleWidth::F32 => {
            let mut values = vec![0f32; n];
            LittleEndian::read_f32_into(data, &mut values);
            ScopeSamples::F32(values)
        }
    };
    ScopeEvent {
        channels: layout.channels,
        samples: layout.samples,
        data: samples,
    }
}

/// Positional reader over the scope stream.
#[derive(Debug)]
struct ScopeStream {
    data: Vec<u8>,
    position: usize,
    event_index: usize,
    layout: ScopeLayout,
    event_size: usize,
    progress: ProgressSlot,
}

impl ScopeStream {
    /// A zero-sized layout can never advance, so it is done immediately.
    fn is_done(&mut self) -> bool {
        let done = self.event_size == 0 || self.position >= self.data.len();
        if done {
            self.progress.release();
        }
        done
    }

    fn next_event(&mut self) -> Result<Option<ScopeEvent>, DecodeError> {
        if self.is_done() {
            return Ok(None);
        }
        let size = self.event_size;
        let start = self.position;
        let bytes = start
            .checked_add(size)
            .and_then(|end| self.data.get(start..end))
            .ok_or(DecodeError::Truncated {
                event: self.event_index,
                offset: start,
                needed: size,
                available: self.data.len() - start,
            })?;

        let event = decode_scope_event(bytes, &self.layout);
        self.progress.update(size as u64);
        self.position += size;
        self.event_index += 1;
        Ok(Some(event))
    }
}

/// Decoder over the ADC and scope streams of one OPAMP run.
#[derive(Debug)]
pub struct OpampDecoder {
    adc: AptsDecoder,
    scope: ScopeStream,
}

impl OpampDecoder {
    /// Creates the decoder. When `trim` is given, scope headers and footers
    /// are stripped once, before any event is decoded.
    ///
    /// OPAMP chips are never multiplexed, so the ADC stream uses the standard
    /// pixel mapping.
    pub fn new(
        adc: Vec<u8>,
        scope: Vec<u8>,
        layout: ScopeLayout,
        trim: Option<HeaderTrim>,
    ) -> Result<Self, DecodeError> {
        let scope = match trim {
            Some(trim) => {
                let stripped = trim.strip(&scope, &layout)?;
                log::debug!(
                    "Stripped scope stream from {} to {} bytes",
                    scope.len(),
                    stripped.len()
                );
                stripped
            }
            None => scope,
        };
        let event_size = layout
            .event_size()
            .ok_or_else(|| ScopeLayout::oversized(scope.len()))?;
        if event_size == 0 && !scope.is_empty() {
            log::warn!("Scope layout has zero event size; scope stream will not be decoded");
        }

        Ok(Self {
            adc: AptsDecoder::from_bytes(adc, ChipVariant::Standard),
            scope: ScopeStream {
                data: scope,
                position: 0,
                event_index: 0,
                layout,
                event_size,
                progress: ProgressSlot::default(),
            },
        })
    }

    /// Attaches one progress sink per stream.
    pub fn with_progress(
        mut self,
        adc: Box<dyn ProgressSink>,
        scope: Box<dyn ProgressSink>,
    ) -> Self {
        self.adc = self.adc.with_progress(adc);
        self.scope.progress = ProgressSlot::new(scope);
        self
    }

    /// Layout used for the scope stream.
    pub fn scope_layout(&self) -> ScopeLayout {
        self.scope.layout
    }

    pub fn adc_len(&self) -> usize {
        self.adc.len()
    }

    /// Length of the scope stream after header stripping.
    pub fn scope_len(&self) -> usize {
        self.scope.data.len()
    }

    pub fn adc_events_decoded(&self) -> usize {
        self.adc.events_decoded()
    }

    pub fn scope_events_decoded(&self) -> usize {
        self.scope.event_index
    }

    pub fn is_adc_done(&mut self) -> bool {
        self.adc.is_done()
    }

    pub fn next_adc_event(&mut self) -> Result<Option<AptsEvent>, DecodeError> {
        self.adc.next_event()
    }

    /// Returns true once the scope cursor reached the end of the scope stream.
    ///
    /// A zero-sized layout can never advance, so it reports done immediately.
    pub fn is_scope_done(&mut self) -> bool {
        self.scope.is_done()
    }

    pub fn next_scope_event(&mut self) -> Result<Option<ScopeEvent>, DecodeError> {
        self.scope.next_event()
    }

    /// Decodes all remaining ADC events, shape-checked.
    pub fn drain_adc(&mut self) -> Result<AptsRun, DecodeError> {
        self.adc.drain()
    }

    /// Decodes all remaining scope events, shape-checked.
    pub fn drain_scope(&mut self) -> Result<Vec<ScopeEvent>, DecodeError> {
        let mut events: Vec<ScopeEvent> = Vec::new();
        while let Some(event) = self.next_scope_event()? {
            if let Some(first) = events.first() {
                if event.shape() != first.shape() {
                    return Err(DecodeError::ShapeMismatch {
                        event: events.len(),
                        expected: first.shape().to_vec(),
                        found: event.shape().to_vec(),
                    });
                }
            }
            events.push(event);
        }
        Ok(events)
    }
}
