//! DPTS zero-suppression and train decoding.
//!
//! DPTS pixels answer a hit with a differential pulse train on a shared
//! output. The scope records both lines; crossings of the positive trace over
//! the reference are turned into edge times, and edges are grouped into trains
//! of four. `pid = t3 - t1` and `gid = t4 - t3` identify the pixel through a
//! calibration table.

use crate::output::{self, OutputError};
use std::borrow::Cow;
use std::io::BufRead;
use std::path::Path;
use thiserror::Error;

/// Minimum gap between edges (in seconds) that closes a train group.
pub const MIN_SEP: f64 = 20e-9;

/// Floor of the self-derived baseline used by [`Threshold::OnlyPositive`].
pub const ONLY_POS_FLOOR: f64 = 10.0;

/// Errors that can occur during DPTS decoding.
#[derive(Error, Debug)]
pub enum DptsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Trace lengths differ: time {time}, positive {positive}, negative {negative}")]
    TraceLength {
        time: usize,
        positive: usize,
        negative: usize,
    },

    #[error("Line {line}: {reason}")]
    Csv { line: usize, reason: String },

    #[error("Invalid calibration: {0}")]
    Calibration(String),

    #[error("Failed to read calibration: {0}")]
    Output(#[from] OutputError),
}

/// Direction of a threshold crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Rising,
    Falling,
}

impl Polarity {
    /// +1 for rising, -1 for falling.
    #[inline]
    pub fn sign(&self) -> i8 {
        match self {
            Self::Rising => 1,
            Self::Falling => -1,
        }
    }
}

/// An interpolated threshold crossing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    /// Crossing time, in the unit of the time trace
    pub time: f64,
    pub polarity: Polarity,
}

/// Threshold applied to the positive trace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Threshold {
    /// Fixed level
    Fixed(f64),
    /// The negative trace, sample by sample (comparator emulation)
    Reference,
    /// Midpoint of the positive trace's range, floored at [`ONLY_POS_FLOOR`]
    OnlyPositive,
}

/// Zero-suppression settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZeroSuppress {
    pub threshold: Threshold,
    /// Swap positive and negative traces before anything else
    pub invert: bool,
}

impl Default for ZeroSuppress {
    fn default() -> Self {
        Self {
            threshold: Threshold::Reference,
            invert: false,
        }
    }
}

/// Finds the threshold crossings of the positive trace.
///
/// A crossing between samples `i` and `i + 1` is placed by linear
/// interpolation of `y = p - threshold`:
/// `t0 = t1 - y1 * (t2 - t1) / (y2 - y1)`.
pub fn zero_suppress(
    t: &[f64],
    p: &[f64],
    n: &[f64],
    settings: &ZeroSuppress,
) -> Result<Vec<Edge>, DptsError> {
    if t.len() != p.len() || p.len() != n.len() {
        return Err(DptsError::TraceLength {
            time: t.len(),
            positive: p.len(),
            negative: n.len(),
        });
    }

    let (p, n) = if settings.invert { (n, p) } else { (p, n) };

    let reference: Cow<[f64]> = match settings.threshold {
        Threshold::Fixed(level) => Cow::Owned(vec![level; p.len()]),
        Threshold::Reference => Cow::Borrowed(n),
        Threshold::OnlyPositive => {
            let min = p.iter().copied().fold(f64::INFINITY, f64::min);
            let max = p.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            Cow::Owned(vec![(0.5 * (min + max)).max(ONLY_POS_FLOOR); p.len()])
        }
    };

    let above: Vec<bool> = p.iter().zip(reference.iter()).map(|(a, b)| a > b).collect();

    let mut edges = Vec::new();
    for i in 0..above.len().saturating_sub(1) {
        if above[i] == above[i + 1] {
            continue;
        }
        let (t1, t2) = (t[i], t[i + 1]);
        let y1 = p[i] - reference[i];
        let y2 = p[i + 1] - reference[i + 1];
        edges.push(Edge {
            time: t1 - y1 * (t2 - t1) / (y2 - y1),
            polarity: if above[i + 1] {
                Polarity::Rising
            } else {
                Polarity::Falling
            },
        });
    }
    Ok(edges)
}

/// Drops the NaN padding of a fixed-size edge array.
///
/// Everything from the first edge with a NaN time is discarded.
pub fn truncate_padded(edges: &[Edge]) -> &[Edge] {
    let end = edges
        .iter()
        .position(|edge| edge.time.is_nan())
        .unwrap_or(edges.len());
    &edges[..end]
}

/// Four edge times of one pulse train.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Train(pub [f64; 4]);

impl Train {
    /// Time of arrival (first edge).
    #[inline]
    pub fn toa(&self) -> f64 {
        self.0[0]
    }

    /// Edge 3 minus edge 1.
    #[inline]
    pub fn pid(&self) -> f64 {
        self.0[2] - self.0[0]
    }

    /// Edge 4 minus edge 3.
    #[inline]
    pub fn gid(&self) -> f64 {
        self.0[3] - self.0[2]
    }
}

/// Trains found in one waveform, plus groups that were not a multiple of four.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainSet {
    pub trains: Vec<Train>,
    pub bad_trains: Vec<Vec<f64>>,
}

impl TrainSet {
    fn close_group(&mut self, group: &mut Vec<f64>) {
        if group.len() % 4 == 0 {
            self.trains.extend(
                group
                    .chunks_exact(4)
                    .map(|c| Train([c[0], c[1], c[2], c[3]])),
            );
        } else {
            self.bad_trains.push(group.clone());
        }
        group.clear();
    }
}

/// Groups time-ordered edges into trains.
///
/// A gap larger than [`MIN_SEP`] closes the current group. A group only
/// starts on a rising edge; falling edges before it are discarded.
pub fn zs_to_trains(edges: &[Edge]) -> TrainSet {
    let mut set = TrainSet::default();
    let mut group = Vec::new();
    let mut last = f64::NEG_INFINITY;

    for edge in edges {
        if edge.time - last > MIN_SEP {
            set.close_group(&mut group);
        }
        last = edge.time;
        if !group.is_empty() || edge.polarity == Polarity::Rising {
            group.push(edge.time);
        }
    }
    set.close_group(&mut group);
    set
}

/// Zero-suppresses the traces and groups the crossings into trains.
pub fn decode(
    t: &[f64],
    p: &[f64],
    n: &[f64],
    settings: &ZeroSuppress,
) -> Result<TrainSet, DptsError> {
    Ok(zs_to_trains(&zero_suppress(t, p, n, settings)?))
}

/// Returns `(gid, pid)` of every train.
pub fn trains_to_gid_pid(trains: &[Train]) -> Vec<(f64, f64)> {
    trains.iter().map(|train| (train.gid(), train.pid())).collect()
}

/// Pixel coordinates on the DPTS matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pixel {
    pub col: usize,
    pub row: usize,
}

/// Table of calibrated `(gid, pid)` per pixel.
///
/// Entries are stored column by column: entry `col * rows + row`.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    cols: usize,
    rows: usize,
    gid_pid: Vec<[f64; 2]>,
}

impl Calibration {
    /// Creates a calibration of `cols x rows` entries.
    pub fn new(cols: usize, rows: usize, gid_pid: Vec<[f64; 2]>) -> Result<Self, DptsError> {
        if cols == 0 || rows == 0 {
            return Err(DptsError::Calibration("empty table".to_string()));
        }
        if gid_pid.len() != cols * rows {
            return Err(DptsError::Calibration(format!(
                "{} entries for a {}x{} table",
                gid_pid.len(),
                cols,
                rows
            )));
        }
        Ok(Self {
            cols,
            rows,
            gid_pid,
        })
    }

    /// Loads the `(cols, rows, 2)` float64 table written by the calibration scan.
    pub fn from_npy_file<P: AsRef<Path>>(path: P) -> Result<Self, DptsError> {
        let (shape, values) = output::read_npy_f64_file(path)?;
        match shape.as_slice() {
            &[cols, rows, 2] => {
                let gid_pid = values.chunks_exact(2).map(|c| [c[0], c[1]]).collect();
                Self::new(cols, rows, gid_pid)
            }
            _ => Err(DptsError::Calibration(format!(
                "expected shape (cols, rows, 2), got {:?}",
                shape
            ))),
        }
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Finds the pixel whose calibrated `(gid, pid)` is closest to the given one.
    ///
    /// Entries are scanned in storage order and the first minimum wins, so
    /// ties resolve to the lowest `(col, row)`.
    pub fn nearest(&self, gid: f64, pid: f64) -> Pixel {
        let mut best = 0;
        let mut best_distance = f64::INFINITY;
        for (i, &[g, p]) in self.gid_pid.iter().enumerate() {
            let distance = (g - gid).powi(2) + (p - pid).powi(2);
            if distance < best_distance {
                best = i;
                best_distance = distance;
            }
        }
        Pixel {
            col: best / self.rows,
            row: best % self.rows,
        }
    }
}

/// Which half of the trains to identify.
///
/// A hit produces one train on the rising and one on the falling edge of the
/// injection, so the first `ceil(n / 2)` trains are taken as rising.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EdgeHalf {
    #[default]
    Rising,
    Falling,
}

/// Identifies the pixels of one half of the trains.
///
/// Returns `None` when the waveform contains only bad trains.
pub fn trains_to_pixels(
    calibration: &Calibration,
    set: &TrainSet,
    half: EdgeHalf,
) -> Option<Vec<Pixel>> {
    if set.trains.is_empty() && !set.bad_trains.is_empty() {
        return None;
    }
    let gps = trains_to_gid_pid(&set.trains);
    let split = (gps.len() + 1) / 2;
    let selected = match half {
        EdgeHalf::Rising => &gps[..split],
        EdgeHalf::Falling => &gps[split..],
    };
    Some(identify(calibration, selected.iter()))
}

/// Identifies rising and falling trains with separate calibrations.
///
/// With `interleaved` the trains alternate rising, falling, rising, ... (as
/// in fake-hit-rate data); otherwise the first half is rising.
pub fn trains_to_pixel_pairs(
    rising: &Calibration,
    falling: &Calibration,
    set: &TrainSet,
    interleaved: bool,
) -> Option<(Vec<Pixel>, Vec<Pixel>)> {
    if set.trains.is_empty() && !set.bad_trains.is_empty() {
        return None;
    }
    let gps = trains_to_gid_pid(&set.trains);
    if interleaved {
        Some((
            identify(rising, gps.iter().step_by(2)),
            identify(falling, gps.iter().skip(1).step_by(2)),
        ))
    } else {
        let split = (gps.len() + 1) / 2;
        Some((
            identify(rising, gps[..split].iter()),
            identify(falling, gps[split..].iter()),
        ))
    }
}

fn identify<'a>(
    calibration: &Calibration,
    gps: impl Iterator<Item = &'a (f64, f64)>,
) -> Vec<Pixel> {
    gps.map(|&(gid, pid)| calibration.nearest(gid, pid)).collect()
}

/// A DPTS waveform pair recorded by the oscilloscope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Waveform {
    /// Sample times in seconds
    pub time: Vec<f64>,
    /// Positive line in volts
    pub positive: Vec<f64>,
    /// Negative line in volts
    pub negative: Vec<f64>,
}

impl Waveform {
    /// Reads a scope CSV export.
    ///
    /// The first line is a header; columns 1, 2 and 3 hold the time in ns and
    /// the positive and negative lines in mV.
    pub fn read_csv<R: BufRead>(reader: R) -> Result<Self, DptsError> {
        let mut waveform = Self::default();
        for (i, line) in reader.lines().enumerate().skip(1) {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let columns: Vec<&str> = line.split(',').collect();
            if columns.len() < 4 {
                return Err(DptsError::Csv {
                    line: i + 1,
                    reason: format!("expected 4 columns, found {}", columns.len()),
                });
            }
            let parse = |column: usize| -> Result<f64, DptsError> {
                columns[column].trim().parse::<f64>().map_err(|e| DptsError::Csv {
                    line: i + 1,
                    reason: format!("column {}: {}", column, e),
                })
            };
            waveform.time.push(parse(1)? * 1e-9);
            waveform.positive.push(parse(2)? * 1e-3);
            waveform.negative.push(parse(3)? * 1e-3);
        }
        Ok(waveform)
    }

    /// Reads a scope CSV export from disk.
    pub fn read_csv_file<P: AsRef<Path>>(path: P) -> Result<Self, DptsError> {
        let file = std::fs::File::open(path)?;
        Self::read_csv(std::io::BufReader::new(file))
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Zero-suppresses the waveform and groups the crossings into trains.
    pub fn decode(&self, settings: &ZeroSuppress) -> Result<TrainSet, DptsError> {
        decode(&self.time, &self.positive, &self.negative, settings)
    }
}
