//! Output writers for decoded data.
//!
//! Arrays are written in the numpy `.npy` format (version 1.0, little-endian,
//! C order) so downstream analysis can `np.load` them directly. Timestamps and
//! trains are also available as CSV.

use crate::dpts::TrainSet;
use crate::types::{AptsRun, ScopeEvent, ScopeSamples, MATRIX_SIDE};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during output writing or array reading.
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Magic string opening every `.npy` file.
pub const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Header alignment required by numpy.
const NPY_ALIGN: usize = 64;

/// Element types that can be stored in a `.npy` array.
pub trait NpyElement: Copy {
    /// numpy dtype descriptor
    const DESCR: &'static str;

    fn write_le<W: Write>(self, writer: &mut W) -> std::io::Result<()>;
}

impl NpyElement for i8 {
    const DESCR: &'static str = "|i1";
    fn write_le<W: Write>(self, writer: &mut W) -> std::io::Result<()> {
        writer.write_i8(self)
    }
}

impl NpyElement for i16 {
    const DESCR: &'static str = "<i2";
    fn write_le<W: Write>(self, writer: &mut W) -> std::io::Result<()> {
        writer.write_i16::<LittleEndian>(self)
    }
}

impl NpyElement for u16 {
    const DESCR: &'static str = "<u2";
    fn write_le<W: Write>(self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u16::<LittleEndian>(self)
    }
}

impl NpyElement for u64 {
    const DESCR: &'static str = "<u8";
    fn write_le<W: Write>(self, writer: &mut W) -> std::io::Result<()> {
        writer.write_u64::<LittleEndian>(self)
    }
}

impl NpyElement for f32 {
    const DESCR: &'static str = "<f4";
    fn write_le<W: Write>(self, writer: &mut W) -> std::io::Result<()> {
        writer.write_f32::<LittleEndian>(self)
    }
}

impl NpyElement for f64 {
    const DESCR: &'static str = "<f8";
    fn write_le<W: Write>(self, writer: &mut W) -> std::io::Result<()> {
        writer.write_f64::<LittleEndian>(self)
    }
}

/// Builds the padded header dictionary for an array.
fn npy_header(descr: &str, shape: &[usize]) -> String {
    let shape = match shape {
        [n] => format!("({},)", n),
        dims => format!(
            "({})",
            dims.iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        descr, shape
    );
    // magic + version + length field + header + newline
    let unpadded = NPY_MAGIC.len() + 2 + 2 + header.len() + 1;
    let padding = (NPY_ALIGN - unpadded % NPY_ALIGN) % NPY_ALIGN;
    header.extend(std::iter::repeat(' ').take(padding));
    header.push('\n');
    header
}

/// Streaming `.npy` writer.
///
/// The header is written up front; [`NpyWriter::finish`] checks that exactly
/// as many values as the shape declares were written.
pub struct NpyWriter<W: Write, T: NpyElement> {
    writer: BufWriter<W>,
    remaining: usize,
    _element: PhantomData<T>,
}

impl<W: Write, T: NpyElement> NpyWriter<W, T> {
    /// Creates a writer and writes the header for an array of `shape`.
    pub fn new(writer: W, shape: &[usize]) -> Result<Self, OutputError> {
        let header = npy_header(T::DESCR, shape);
        let header_len = u16::try_from(header.len())
            .map_err(|_| OutputError::InvalidFormat(format!("shape {:?} too long", shape)))?;

        let mut writer = BufWriter::new(writer);
        writer.write_all(NPY_MAGIC)?;
        writer.write_all(&[1, 0])?;
        writer.write_u16::<LittleEndian>(header_len)?;
        writer.write_all(header.as_bytes())?;

        Ok(Self {
            writer,
            remaining: shape.iter().product(),
            _element: PhantomData,
        })
    }

    /// Writes a batch of values in C order.
    pub fn write_values(&mut self, values: &[T]) -> Result<(), OutputError> {
        if values.len() > self.remaining {
            return Err(OutputError::InvalidFormat(format!(
                "{} values exceed the declared shape by {}",
                values.len(),
                values.len() - self.remaining
            )));
        }
        for &value in values {
            value.write_le(&mut self.writer)?;
        }
        self.remaining -= values.len();
        Ok(())
    }

    /// Flushes the writer, failing if the array is incomplete.
    pub fn finish(mut self) -> Result<(), OutputError> {
        if self.remaining != 0 {
            return Err(OutputError::InvalidFormat(format!(
                "{} values missing from the declared shape",
                self.remaining
            )));
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// Writes a flat array of `shape` to a `.npy` file.
pub fn write_npy<P: AsRef<Path>, T: NpyElement>(
    path: P,
    shape: &[usize],
    values: &[T],
) -> Result<(), OutputError> {
    let mut writer = NpyWriter::new(File::create(path)?, shape)?;
    writer.write_values(values)?;
    writer.finish()
}

/// Writes an APTS run as an `(events, 4, 4, frames)` array of `u16`.
///
/// The array is indexed `[event][x][y][frame]`.
pub fn write_apts_npy<W: Write>(writer: W, run: &AptsRun) -> Result<(), OutputError> {
    let frames = run.frames_per_event();
    let shape = [run.events.len(), MATRIX_SIDE, MATRIX_SIDE, frames];
    let mut npy = NpyWriter::<W, u16>::new(writer, &shape)?;
    for event in &run.events {
        for x in 0..MATRIX_SIDE {
            for y in 0..MATRIX_SIDE {
                npy.write_values(&event.waveform(x, y))?;
            }
        }
    }
    npy.finish()
}

/// Writes an APTS run to a `.npy` file.
pub fn write_apts_npy_file<P: AsRef<Path>>(path: P, run: &AptsRun) -> Result<(), OutputError> {
    write_apts_npy(File::create(path)?, run)
}

/// Writes scope events as an `(events, channels, samples)` array.
///
/// The dtype follows the sample width; all events must share it.
pub fn write_scope_npy_file<P: AsRef<Path>>(
    path: P,
    events: &[ScopeEvent],
) -> Result<(), OutputError> {
    let first = events
        .first()
        .ok_or_else(|| OutputError::InvalidFormat("no scope events to write".to_string()))?;
    let shape = [events.len(), first.channels, first.samples];
    let file = File::create(path)?;
    match &first.data {
        ScopeSamples::I8(_) => write_scope_as(file, events, &shape, |d| match d {
            ScopeSamples::I8(v) => Some(v.as_slice()),
            _ => None,
        }),
        ScopeSamples::I16(_) => write_scope_as(file, events, &shape, |d| match d {
            ScopeSamples::I16(v) => Some(v.as_slice()),
            _ => None,
        }),
        ScopeSamples::F32(_) => write_scope_as(file, events, &shape, |d| match d {
            ScopeSamples::F32(v) => Some(v.as_slice()),
            _ => None,
        }),
    }
}

fn write_scope_as<W: Write, T: NpyElement>(
    writer: W,
    events: &[ScopeEvent],
    shape: &[usize],
    select: impl Fn(&ScopeSamples) -> Option<&[T]>,
) -> Result<(), OutputError> {
    let mut npy = NpyWriter::<W, T>::new(writer, shape)?;
    for (i, event) in events.iter().enumerate() {
        let values = select(&event.data).ok_or_else(|| {
            OutputError::InvalidFormat(format!("scope event {} has a different sample width", i))
        })?;
        npy.write_values(values)?;
    }
    npy.finish()
}

/// Returns the text following `'key':` in a header dictionary.
fn header_field<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let tag = format!("'{}':", key);
    let start = header.find(&tag)? + tag.len();
    Some(header[start..].trim_start())
}

/// Reads a little-endian float64 `.npy` array in C order.
///
/// Returns the shape and the flat values.
pub fn read_npy_f64<R: Read>(mut reader: R) -> Result<(Vec<usize>, Vec<f64>), OutputError> {
    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic)?;
    if &magic != NPY_MAGIC {
        return Err(OutputError::InvalidFormat("not a .npy file".to_string()));
    }

    let major = reader.read_u8()?;
    let _minor = reader.read_u8()?;
    let header_len = match major {
        1 => reader.read_u16::<LittleEndian>()? as usize,
        2 | 3 => reader.read_u32::<LittleEndian>()? as usize,
        v => {
            return Err(OutputError::InvalidFormat(format!(
                "unsupported .npy version {}",
                v
            )))
        }
    };
    let mut header = vec![0u8; header_len];
    reader.read_exact(&mut header)?;
    let header = std::str::from_utf8(&header)
        .map_err(|_| OutputError::InvalidFormat("header is not valid text".to_string()))?;

    let descr = header_field(header, "descr").unwrap_or_default();
    if !(descr.starts_with("'<f8'") || descr.starts_with("'=f8'")) {
        return Err(OutputError::InvalidFormat(format!(
            "expected float64 data, header is {}",
            header.trim()
        )));
    }
    if !header_field(header, "fortran_order").is_some_and(|v| v.starts_with("False")) {
        return Err(OutputError::InvalidFormat(
            "only C-ordered arrays are supported".to_string(),
        ));
    }

    let shape_text = header_field(header, "shape")
        .and_then(|v| v.strip_prefix('('))
        .and_then(|v| v.split(')').next())
        .ok_or_else(|| OutputError::InvalidFormat("missing shape".to_string()))?;
    let shape = shape_text
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| {
            d.parse::<usize>()
                .map_err(|_| OutputError::InvalidFormat(format!("bad dimension '{}'", d)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut values = vec![0f64; shape.iter().product()];
    reader.read_f64_into::<LittleEndian>(&mut values)?;
    Ok((shape, values))
}

/// Reads a float64 `.npy` file.
pub fn read_npy_f64_file<P: AsRef<Path>>(path: P) -> Result<(Vec<usize>, Vec<f64>), OutputError> {
    read_npy_f64(BufReader::new(File::open(path)?))
}

/// CSV writer for trigger timestamps.
pub struct TriggerCsvWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> TriggerCsvWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    pub fn write_header(&mut self) -> Result<(), OutputError> {
        writeln!(self.writer, "event,trigger_timestamp")?;
        Ok(())
    }

    /// Writes one row per event; events without a timestamp get an empty field.
    pub fn write_timestamps(&mut self, timestamps: &[Option<u64>]) -> Result<(), OutputError> {
        for (event, ts) in timestamps.iter().enumerate() {
            match ts {
                Some(ts) => writeln!(self.writer, "{},{}", event, ts)?,
                None => writeln!(self.writer, "{},", event)?,
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// CSV writer for DPTS trains.
pub struct TrainCsvWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> TrainCsvWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    pub fn write_header(&mut self) -> Result<(), OutputError> {
        writeln!(self.writer, "waveform,toa,pid,gid")?;
        Ok(())
    }

    /// Writes the good trains of one waveform.
    pub fn write_trains(&mut self, waveform: usize, set: &TrainSet) -> Result<(), OutputError> {
        for train in &set.trains {
            writeln!(
                self.writer,
                "{},{:e},{:e},{:e}",
                waveform,
                train.toa(),
                train.pid(),
                train.gid()
            )?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Writes trigger timestamps of a run to a CSV file.
pub fn write_trigger_csv<P: AsRef<Path>>(path: P, run: &AptsRun) -> Result<(), OutputError> {
    let mut writer = TriggerCsvWriter::new(File::create(path)?);
    writer.write_header()?;
    writer.write_timestamps(&run.trigger_timestamps())?;
    writer.flush()
}

/// Writes the trains of several waveforms to a CSV file.
pub fn write_trains_csv<P: AsRef<Path>>(path: P, sets: &[TrainSet]) -> Result<(), OutputError> {
    let mut writer = TrainCsvWriter::new(File::create(path)?);
    writer.write_header()?;
    for (i, set) in sets.iter().enumerate() {
        writer.write_trains(i, set)?;
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dpts::Train;
    use crate::types::{AptsEvent, Frame, PIXELS};

    fn header_of(bytes: &[u8]) -> (usize, String) {
        let len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        (len, String::from_utf8(bytes[10..10 + len].to_vec()).unwrap())
    }

    #[test]
    fn test_npy_header_alignment() {
        let mut output = Vec::new();
        let mut writer = NpyWriter::<_, u16>::new(&mut output, &[2, 3]).unwrap();
        writer.write_values(&[1, 2, 3, 4, 5, 6]).unwrap();
        writer.finish().unwrap();

        assert_eq!(&output[0..6], NPY_MAGIC);
        assert_eq!(&output[6..8], &[1, 0]);
        let (len, header) = header_of(&output);
        assert_eq!((10 + len) % 64, 0);
        assert!(header.starts_with("{'descr': '<u2', 'fortran_order': False, 'shape': (2, 3), }"));
        assert!(header.ends_with('\n'));
        assert_eq!(output.len(), 10 + len + 12);
        assert_eq!(&output[10 + len..10 + len + 2], &[1, 0]);
    }

    #[test]
    fn test_npy_one_dimensional_shape() {
        assert!(npy_header("<f8", &[5]).contains("'shape': (5,)"));
    }

    #[test]
    fn test_npy_writer_counts_values() {
        let mut output = Vec::new();
        let mut writer = NpyWriter::<_, f32>::new(&mut output, &[2]).unwrap();
        writer.write_values(&[1.0]).unwrap();
        assert!(writer.write_values(&[2.0, 3.0]).is_err());
        assert!(writer.finish().is_err());
    }

    #[test]
    fn test_apts_npy_layout() {
        let mut pixels = [0u16; PIXELS];
        pixels[1 + 4 * 2] = 7; // x=1, y=2
        let event = AptsEvent {
            frames: vec![Frame::new([0; PIXELS]), Frame::new(pixels)],
            frame_timestamps: None,
            trigger_timestamp: None,
        };
        let run = AptsRun {
            events: vec![event],
        };
        let mut output = Vec::new();
        write_apts_npy(&mut output, &run).unwrap();

        let (len, header) = header_of(&output);
        assert!(header.contains("'shape': (1, 4, 4, 2)"));
        let data = &output[10 + len..];
        assert_eq!(data.len(), 32 * 2);
        // [0][1][2][1] -> ((1 * 4 + 2) * 2 + 1) = 13
        let idx = 13 * 2;
        assert_eq!(u16::from_le_bytes([data[idx], data[idx + 1]]), 7);
    }

    #[test]
    fn test_read_npy_f64() {
        let mut output = Vec::new();
        let mut writer = NpyWriter::<_, f64>::new(&mut output, &[1, 2, 2]).unwrap();
        writer.write_values(&[0.5, 1.5, 2.5, 3.5]).unwrap();
        writer.finish().unwrap();

        let (shape, values) = read_npy_f64(output.as_slice()).unwrap();
        assert_eq!(shape, vec![1, 2, 2]);
        assert_eq!(values, vec![0.5, 1.5, 2.5, 3.5]);
    }

    #[test]
    fn test_read_npy_rejects_other_dtypes() {
        let mut output = Vec::new();
        let mut writer = NpyWriter::<_, u16>::new(&mut output, &[1]).unwrap();
        writer.write_values(&[1]).unwrap();
        writer.finish().unwrap();
        assert!(read_npy_f64(output.as_slice()).is_err());
    }

    #[test]
    fn test_trigger_csv() {
        let mut output = Vec::new();
        {
            let mut writer = TriggerCsvWriter::new(&mut output);
            writer.write_header().unwrap();
            writer.write_timestamps(&[Some(12345), None]).unwrap();
            writer.flush().unwrap();
        }
        let output_str = String::from_utf8(output).unwrap();
        assert_eq!(output_str, "event,trigger_timestamp\n0,12345\n1,\n");
    }

    #[test]
    fn test_train_csv() {
        let mut output = Vec::new();
        {
            let mut writer = TrainCsvWriter::new(&mut output);
            let set = TrainSet {
                trains: vec![Train([1.0, 2.0, 4.0, 8.0])],
                bad_trains: vec![vec![1.0]],
            };
            writer.write_trains(3, &set).unwrap();
            writer.flush().unwrap();
        }
        let output_str = String::from_utf8(output).unwrap();
        assert_eq!(output_str, "3,1e0,3e0,4e0\n");
    }
}
