//! Low-level parsing of APTS frames and trigger timestamp records.
//!
//! An APTS frame is 40 bytes: a 16x16 bit block holding one 16-bit conversion
//! for each of the 16 ADC channels, a 6-byte frame timestamp and a 2-byte
//! trailer. The bit block is transposed: row `r` of the block (bytes `2r` and
//! `2r + 1`, least significant bit first) holds bit `15 - r` of every channel.

use crate::types::{ChipVariant, Frame, PIXELS};
use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Size of one frame in bytes.
pub const FRAME_SIZE: usize = 40;

/// Size of the transposed ADC bit block at the start of each frame.
pub const FRAME_BITS_SIZE: usize = 32;

/// Sentinel opening every event.
pub const EVENT_HEADER: [u8; 4] = [0xAA; 4];

/// Sentinel opening the optional trigger timestamp record.
pub const TRIGGER_HEADER: [u8; 4] = [0xBB; 4];

/// Size of the trigger timestamp record following its sentinel.
pub const TRIGGER_RECORD_SIZE: usize = 12;

/// Trailer of every frame except the last one of an event.
pub const FRAME_TRAILER: u16 = 0xFEFE;

/// Trailer of the last frame of an event.
pub const EVENT_TRAILER: u16 = 0xAEAE;

/// Trailer word of the trigger timestamp record.
pub const TRIGGER_TRAILER: u32 = 0xAEAE_AE00;

/// Frame bytes making up the 48-bit frame timestamp, most significant first.
pub const FRAME_TIMESTAMP_BYTES: [usize; 6] = [33, 32, 35, 34, 37, 36];

/// Errors found while parsing frames or trigger records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("payload of {0} bytes is not a multiple of the frame size ({size} bytes)", size = FRAME_SIZE)]
    Length(usize),

    #[error("frame {frame} of {frames}: unexpected trailer 0x{found:04X}, expected 0x{expected:04X}")]
    Trailer {
        frame: usize,
        frames: usize,
        expected: u16,
        found: u16,
    },

    #[error("unexpected trigger timestamp trailer 0x{0:08X}, expected 0x{exp:08X}", exp = TRIGGER_TRAILER)]
    TriggerTrailer(u32),
}

/// Source location of every output bit, indexed `[channel][r]`.
///
/// Entry `(byte, bit)` is the block bit that becomes bit `15 - r` of the
/// channel's 16-bit word.
pub const TRANSPOSE_TABLE: [[(u8, u8); 16]; PIXELS] = build_transpose_table();

const fn build_transpose_table() -> [[(u8, u8); 16]; PIXELS] {
    let mut table = [[(0u8, 0u8); 16]; PIXELS];
    let mut channel = 0;
    while channel < PIXELS {
        let mut r = 0;
        while r < 16 {
            table[channel][r] = ((2 * r + channel / 8) as u8, (channel % 8) as u8);
            r += 1;
        }
        channel += 1;
    }
    table
}

/// Reassembles the 16 raw ADC words of a frame, in ADC channel order.
#[inline]
pub fn adc_words(frame: &[u8; FRAME_SIZE]) -> [u16; PIXELS] {
    let mut words = [0u16; PIXELS];
    for (word, sources) in words.iter_mut().zip(TRANSPOSE_TABLE.iter()) {
        for &(byte, bit) in sources {
            *word = (*word << 1) | ((frame[byte as usize] >> bit) & 0x1) as u16;
        }
    }
    words
}

/// Decodes one frame into logical pixel order using the variant's mapping.
pub fn decode_frame(frame: &[u8; FRAME_SIZE], variant: ChipVariant) -> Frame {
    let mapping = variant.pixel_adc_mapping();
    let mut pixels = [0u16; PIXELS];
    for (adc, word) in adc_words(frame).into_iter().enumerate() {
        pixels[mapping[adc] as usize] = word;
    }
    Frame::new(pixels)
}

/// Extracts the 48-bit frame timestamp.
#[inline]
pub fn frame_timestamp(frame: &[u8; FRAME_SIZE]) -> u64 {
    FRAME_TIMESTAMP_BYTES
        .iter()
        .fold(0u64, |ts, &i| (ts << 8) | frame[i] as u64)
}

/// Extracts the little-endian frame trailer.
#[inline]
pub fn frame_trailer(frame: &[u8; FRAME_SIZE]) -> u16 {
    LittleEndian::read_u16(&frame[38..40])
}

/// Decodes the frame payload of one event.
///
/// Every trailer is validated: intermediate frames must end in
/// [`FRAME_TRAILER`], the last one in [`EVENT_TRAILER`]. Frame timestamps are
/// only extracted when `with_timestamps` is set.
pub fn decode_event_payload(
    payload: &[u8],
    variant: ChipVariant,
    with_timestamps: bool,
) -> Result<(Vec<Frame>, Option<Vec<u64>>), FrameError> {
    if payload.len() % FRAME_SIZE != 0 {
        return Err(FrameError::Length(payload.len()));
    }

    let n_frames = payload.len() / FRAME_SIZE;
    let mut frames = Vec::with_capacity(n_frames);
    let mut timestamps = with_timestamps.then(|| Vec::with_capacity(n_frames));

    for (i, chunk) in payload.chunks_exact(FRAME_SIZE).enumerate() {
        let frame: &[u8; FRAME_SIZE] = chunk
            .try_into()
            .map_err(|_| FrameError::Length(payload.len()))?;

        frames.push(decode_frame(frame, variant));
        if let Some(ts) = timestamps.as_mut() {
            ts.push(frame_timestamp(frame));
        }

        let expected = if i + 1 < n_frames {
            FRAME_TRAILER
        } else {
            EVENT_TRAILER
        };
        let found = frame_trailer(frame);
        if found != expected {
            return Err(FrameError::Trailer {
                frame: i,
                frames: n_frames,
                expected,
                found,
            });
        }
    }

    Ok((frames, timestamps))
}

/// Decodes a 12-byte trigger timestamp record (the bytes after its sentinel).
///
/// The record holds two little-endian words forming `(w0 << 32) | w1`,
/// followed by [`TRIGGER_TRAILER`].
pub fn decode_trigger_timestamp(record: &[u8; TRIGGER_RECORD_SIZE]) -> Result<u64, FrameError> {
    let high = LittleEndian::read_u32(&record[0..4]);
    let low = LittleEndian::read_u32(&record[4..8]);
    let trailer = LittleEndian::read_u32(&record[8..12]);
    if trailer != TRIGGER_TRAILER {
        return Err(FrameError::TriggerTrailer(trailer));
    }
    Ok(((high as u64) << 32) | low as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(bytes: &[(usize, u8)], trailer: u16) -> [u8; FRAME_SIZE] {
        let mut frame = [0u8; FRAME_SIZE];
        for &(i, b) in bytes {
            frame[i] = b;
        }
        frame[38..40].copy_from_slice(&trailer.to_le_bytes());
        frame
    }

    #[test]
    fn test_transpose_msb_of_first_channel() {
        // Byte 0, bit 0 is the MSB of ADC channel 0
        let frame = frame_with(&[(0, 0x01)], EVENT_TRAILER);
        let words = adc_words(&frame);
        assert_eq!(words[0], 0x8000);
        assert!(words[1..].iter().all(|&w| w == 0));
    }

    #[test]
    fn test_transpose_lsb_of_last_channel() {
        // Byte 31, bit 7 is the LSB of ADC channel 15
        let frame = frame_with(&[(31, 0x80)], EVENT_TRAILER);
        let words = adc_words(&frame);
        assert_eq!(words[15], 0x0001);
        assert!(words[..15].iter().all(|&w| w == 0));
    }

    #[test]
    fn test_pixel_mapping_applied() {
        let frame = frame_with(&[(31, 0x80)], EVENT_TRAILER);

        // ADC 15 reads pixel 3 (x=3, y=0) on standard chips
        let standard = decode_frame(&frame, ChipVariant::Standard);
        assert_eq!(standard.get(3, 0), 1);

        // and pixel 7 (x=3, y=1) on mux chips
        let mux = decode_frame(&frame, ChipVariant::Mux);
        assert_eq!(mux.get(3, 1), 1);
        assert_eq!(mux.get(3, 0), 0);
    }

    #[test]
    fn test_uniform_frame_decodes_uniformly() {
        let value: u16 = 0xA5C3;
        let mut frame = [0u8; FRAME_SIZE];
        for r in 0..16 {
            let fill = if (value >> (15 - r)) & 1 == 1 { 0xFF } else { 0x00 };
            frame[2 * r] = fill;
            frame[2 * r + 1] = fill;
        }
        for variant in [ChipVariant::Standard, ChipVariant::Mux] {
            let decoded = decode_frame(&frame, variant);
            assert!(decoded.pixels().iter().all(|&p| p == value));
        }
    }

    #[test]
    fn test_frame_timestamp_byte_order() {
        let frame = frame_with(
            &[(32, 0x11), (33, 0x22), (34, 0x33), (35, 0x44), (36, 0x55), (37, 0x66)],
            EVENT_TRAILER,
        );
        assert_eq!(frame_timestamp(&frame), 0x2211_4433_6655);
    }

    #[test]
    fn test_payload_length_must_be_frame_multiple() {
        let payload = vec![0u8; FRAME_SIZE + 1];
        assert_eq!(
            decode_event_payload(&payload, ChipVariant::Standard, false),
            Err(FrameError::Length(41))
        );
    }

    #[test]
    fn test_payload_trailers() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&frame_with(&[], FRAME_TRAILER));
        payload.extend_from_slice(&frame_with(&[(32, 0x01)], EVENT_TRAILER));

        let (frames, ts) = decode_event_payload(&payload, ChipVariant::Standard, true).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(ts, Some(vec![0, 1 << 32]));

        // Corrupt the first trailer
        payload[38] = 0x00;
        let err = decode_event_payload(&payload, ChipVariant::Standard, false).unwrap_err();
        assert_eq!(
            err,
            FrameError::Trailer {
                frame: 0,
                frames: 2,
                expected: FRAME_TRAILER,
                found: 0xFE00,
            }
        );
    }

    #[test]
    fn test_last_frame_needs_event_trailer() {
        let payload = frame_with(&[], FRAME_TRAILER);
        let err = decode_event_payload(&payload, ChipVariant::Standard, false).unwrap_err();
        assert!(matches!(err, FrameError::Trailer { frame: 0, expected: EVENT_TRAILER, .. }));
    }

    #[test]
    fn test_trigger_timestamp() {
        let mut record = [0u8; TRIGGER_RECORD_SIZE];
        record[0..4].copy_from_slice(&0x0102_0304u32.to_le_bytes());
        record[4..8].copy_from_slice(&0x0A0B_0C0Du32.to_le_bytes());
        record[8..12].copy_from_slice(&TRIGGER_TRAILER.to_le_bytes());
        assert_eq!(decode_trigger_timestamp(&record), Ok(0x0102_0304_0A0B_0C0D));

        record[11] = 0x00;
        assert_eq!(
            decode_trigger_timestamp(&record),
            Err(FrameError::TriggerTrailer(0x00AE_AE00))
        );
    }
}
