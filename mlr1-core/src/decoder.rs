//! Stateful APTS event stream decoder.
//!
//! A raw APTS file is a sequence of events. Each event is
//!
//! ```text
//! AA AA AA AA | length (u32 LE) | length bytes of 40-byte frames
//!             | optional: BB BB BB BB | ts_high (u32 LE) | ts_low (u32 LE) | 00 AE AE AE
//! ```
//!
//! The decoder buffers the whole file and walks it with a forward-only cursor.
//! Any framing error is fatal: the stream is not resynchronised.

use crate::parser::{self, FrameError, EVENT_HEADER, TRIGGER_HEADER, TRIGGER_RECORD_SIZE};
use crate::progress::{ProgressSink, ProgressSlot};
use crate::types::{AptsEvent, AptsRun, ChipVariant};
use byteorder::{ByteOrder, LittleEndian};
use std::path::Path;
use thiserror::Error;

/// Size of the event header (sentinel and length field).
const EVENT_HEADER_SIZE: usize = 8;

/// Errors that can occur during event decoding.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Event {event}: expected header at byte {offset}, got {found:02X?}")]
    UnexpectedHeader {
        event: usize,
        offset: usize,
        found: Vec<u8>,
    },

    #[error("Event {event}: need {needed} bytes at byte {offset}, only {available} left")]
    Truncated {
        event: usize,
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("Event {event}: {source}")]
    Frame {
        event: usize,
        #[source]
        source: FrameError,
    },

    #[error("Event {event}: shape changed from {expected:?} to {found:?}")]
    ShapeMismatch {
        event: usize,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

/// Stateful APTS event decoder.
///
/// Owns the raw buffer and a cursor that only moves forward. Each call to
/// [`AptsDecoder::next_event`] consumes exactly one event.
#[derive(Debug)]
pub struct AptsDecoder {
    data: Vec<u8>,
    position: usize,
    event_index: usize,
    variant: ChipVariant,
    frame_timestamps: bool,
    failed: bool,
    progress: ProgressSlot,
}

impl AptsDecoder {
    /// Creates a decoder over an in-memory buffer.
    pub fn from_bytes(data: Vec<u8>, variant: ChipVariant) -> Self {
        Self {
            data,
            position: 0,
            event_index: 0,
            variant,
            frame_timestamps: false,
            failed: false,
            progress: ProgressSlot::default(),
        }
    }

    /// Reads a raw file fully into memory and creates a decoder over it.
    pub fn open<P: AsRef<Path>>(path: P, variant: ChipVariant) -> Result<Self, DecodeError> {
        let data = std::fs::read(path.as_ref())?;
        log::debug!(
            "Loaded {} bytes from {:?} ({:?} mapping)",
            data.len(),
            path.as_ref(),
            variant
        );
        Ok(Self::from_bytes(data, variant))
    }

    /// Attaches a progress sink, advanced by the bytes of each decoded event.
    pub fn with_progress(mut self, sink: Box<dyn ProgressSink>) -> Self {
        self.progress = ProgressSlot::new(sink);
        self
    }

    /// Also extracts the 48-bit timestamp of every frame.
    pub fn with_frame_timestamps(mut self, enabled: bool) -> Self {
        self.frame_timestamps = enabled;
        self
    }

    /// Total size of the raw buffer in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current cursor position in bytes.
    #[inline]
    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of events decoded so far.
    #[inline]
    pub fn events_decoded(&self) -> usize {
        self.event_index
    }

    /// Chip variant used for the pixel mapping.
    #[inline]
    pub fn variant(&self) -> ChipVariant {
        self.variant
    }

    /// Returns true once the cursor has reached the end of the buffer.
    ///
    /// The first call observing the end closes the progress sink; further
    /// calls keep returning true.
    pub fn is_done(&mut self) -> bool {
        let done = self.position >= self.data.len();
        if done {
            self.progress.release();
        }
        done
    }

    /// Decodes the next event, or returns `None` when the stream is exhausted.
    pub fn next_event(&mut self) -> Result<Option<AptsEvent>, DecodeError> {
        if self.is_done() {
            return Ok(None);
        }

        let event = self.event_index;
        let start = self.position;

        let header = self.bytes_at(start, EVENT_HEADER_SIZE)?;
        if header[..4] != EVENT_HEADER {
            return Err(DecodeError::UnexpectedHeader {
                event,
                offset: start,
                found: header[..4].to_vec(),
            });
        }
        let length = LittleEndian::read_u32(&header[4..8]) as usize;

        let mut cursor = start + EVENT_HEADER_SIZE;
        let payload = self.bytes_at(cursor, length)?;
        let (frames, frame_timestamps) =
            parser::decode_event_payload(payload, self.variant, self.frame_timestamps)
                .map_err(|source| DecodeError::Frame { event, source })?;
        cursor += length;

        let trigger_timestamp = if self.has_trigger_record(cursor) {
            let record: &[u8; TRIGGER_RECORD_SIZE] = self
                .bytes_at(cursor + TRIGGER_HEADER.len(), TRIGGER_RECORD_SIZE)?
                .try_into()
                .map_err(|_| self.truncated(cursor, TRIGGER_RECORD_SIZE))?;
            let ts = parser::decode_trigger_timestamp(record)
                .map_err(|source| DecodeError::Frame { event, source })?;
            cursor += TRIGGER_HEADER.len() + TRIGGER_RECORD_SIZE;
            Some(ts)
        } else {
            None
        };

        log::trace!(
            "Event {}: {} frames, trigger timestamp {:?}",
            event,
            frames.len(),
            trigger_timestamp
        );

        self.progress.update((cursor - start) as u64);
        self.position = cursor;
        self.event_index += 1;

        Ok(Some(AptsEvent {
            frames,
            frame_timestamps,
            trigger_timestamp,
        }))
    }

    /// Decodes all remaining events, requiring every event to have the shape
    /// of the first one.
    pub fn drain(&mut self) -> Result<AptsRun, DecodeError> {
        let mut run = AptsRun::default();
        while let Some(event) = self.next_event()? {
            if let Some(first) = run.events.first() {
                if event.shape() != first.shape() {
                    return Err(DecodeError::ShapeMismatch {
                        event: self.event_index - 1,
                        expected: first.shape().to_vec(),
                        found: event.shape().to_vec(),
                    });
                }
            }
            run.events.push(event);
        }
        log::debug!(
            "Decoded {} events of {} frames",
            run.events.len(),
            run.frames_per_event()
        );
        Ok(run)
    }

    /// Consumes the decoder and returns all events, shape-checked.
    pub fn decode_all(mut self) -> Result<AptsRun, DecodeError> {
        self.drain()
    }

    #[inline]
    fn has_trigger_record(&self, offset: usize) -> bool {
        self.data.get(offset..offset + TRIGGER_HEADER.len()) == Some(&TRIGGER_HEADER[..])
    }

    /// Returns `needed` bytes at `offset`, or a truncation error.
    fn bytes_at(&self, offset: usize, needed: usize) -> Result<&[u8], DecodeError> {
        offset
            .checked_add(needed)
            .and_then(|end| self.data.get(offset..end))
            .ok_or_else(|| self.truncated(offset, needed))
    }

    fn truncated(&self, offset: usize, needed: usize) -> DecodeError {
        DecodeError::Truncated {
            event: self.event_index,
            offset,
            needed,
            available: self.data.len().saturating_sub(offset),
        }
    }
}

impl Iterator for AptsDecoder {
    type Item = Result<AptsEvent, DecodeError>;

    /// Yields events until the end of the stream or the first error.
    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_event() {
            Ok(event) => event.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{EVENT_TRAILER, FRAME_SIZE, FRAME_TRAILER, TRIGGER_TRAILER};
    use crate::progress::testing::recording;

    fn event_bytes(n_frames: usize, trigger: Option<(u32, u32)>) -> Vec<u8> {
        let mut out = EVENT_HEADER.to_vec();
        out.extend_from_slice(&((n_frames * FRAME_SIZE) as u32).to_le_bytes());
        for i in 0..n_frames {
            let mut frame = [0u8; FRAME_SIZE];
            let trailer = if i + 1 < n_frames {
                FRAME_TRAILER
            } else {
                EVENT_TRAILER
            };
            frame[38..40].copy_from_slice(&trailer.to_le_bytes());
            out.extend_from_slice(&frame);
        }
        if let Some((high, low)) = trigger {
            out.extend_from_slice(&TRIGGER_HEADER);
            out.extend_from_slice(&high.to_le_bytes());
            out.extend_from_slice(&low.to_le_bytes());
            out.extend_from_slice(&TRIGGER_TRAILER.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_decoder_initial_state() {
        let mut decoder = AptsDecoder::from_bytes(event_bytes(1, None), ChipVariant::Standard);
        assert_eq!(decoder.position(), 0);
        assert_eq!(decoder.events_decoded(), 0);
        assert!(!decoder.is_done());
    }

    #[test]
    fn test_decode_events_with_and_without_trigger() {
        let mut data = event_bytes(3, Some((1, 2)));
        data.extend(event_bytes(3, None));
        let mut decoder = AptsDecoder::from_bytes(data, ChipVariant::Standard);

        let first = decoder.next_event().unwrap().unwrap();
        assert_eq!(first.frames.len(), 3);
        assert_eq!(first.trigger_timestamp, Some((1 << 32) | 2));
        assert_eq!(first.frame_timestamps, None);

        let second = decoder.next_event().unwrap().unwrap();
        assert_eq!(second.trigger_timestamp, None);

        assert!(decoder.is_done());
        assert!(decoder.next_event().unwrap().is_none());
        assert!(decoder.is_done());
    }

    #[test]
    fn test_unexpected_header() {
        let mut data = event_bytes(1, None);
        data[2] = 0x00;
        let mut decoder = AptsDecoder::from_bytes(data, ChipVariant::Standard);
        match decoder.next_event() {
            Err(DecodeError::UnexpectedHeader { event, offset, found }) => {
                assert_eq!(event, 0);
                assert_eq!(offset, 0);
                assert_eq!(found, vec![0xAA, 0xAA, 0x00, 0xAA]);
            }
            other => panic!("expected header error, got {:?}", other),
        }
    }

    #[test]
    fn test_declared_length_exceeds_buffer() {
        let mut data = event_bytes(2, None);
        data.truncate(data.len() - 1);
        let mut decoder = AptsDecoder::from_bytes(data, ChipVariant::Standard);
        assert!(matches!(
            decoder.next_event(),
            Err(DecodeError::Truncated { event: 0, offset: 8, needed: 80, available: 79 })
        ));
    }

    #[test]
    fn test_short_header() {
        let mut decoder = AptsDecoder::from_bytes(vec![0xAA; 5], ChipVariant::Standard);
        assert!(matches!(
            decoder.next_event(),
            Err(DecodeError::Truncated { needed: 8, available: 5, .. })
        ));
    }

    #[test]
    fn test_iterator_stops_after_error() {
        let mut data = event_bytes(1, None);
        data.extend_from_slice(&[0x00; 8]);
        let decoder = AptsDecoder::from_bytes(data, ChipVariant::Standard);
        let results: Vec<_> = decoder.collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[test]
    fn test_shape_mismatch() {
        let mut data = event_bytes(2, None);
        data.extend(event_bytes(3, None));
        let decoder = AptsDecoder::from_bytes(data, ChipVariant::Standard);
        match decoder.decode_all() {
            Err(DecodeError::ShapeMismatch { event, expected, found }) => {
                assert_eq!(event, 1);
                assert_eq!(expected, vec![4, 4, 2]);
                assert_eq!(found, vec![4, 4, 3]);
            }
            other => panic!("expected shape mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_progress_released_on_done() {
        let data = event_bytes(2, Some((0, 7)));
        let total = data.len() as u64;
        let (sink, record) = recording();
        let mut decoder = AptsDecoder::from_bytes(data, ChipVariant::Standard).with_progress(sink);

        decoder.next_event().unwrap();
        assert_eq!(record.borrow().closed, 0);
        assert!(decoder.is_done());
        assert!(decoder.is_done());
        drop(decoder);

        assert_eq!(record.borrow().bytes, total);
        assert_eq!(record.borrow().closed, 1);
    }

    #[test]
    fn test_trigger_record_trailer_checked() {
        let mut data = event_bytes(1, Some((0, 1)));
        let last = data.len() - 1;
        data[last] = 0x00;
        let mut decoder = AptsDecoder::from_bytes(data, ChipVariant::Standard);
        assert!(matches!(
            decoder.next_event(),
            Err(DecodeError::Frame { event: 0, source: FrameError::TriggerTrailer(_) })
        ));
    }
}
