//! Python bindings for the MLR1 decoders with numpy output.
//!
//! Decoded APTS events are returned as `uint16` arrays indexed
//! `[x][y][frame]`, whole runs as `[event][x][y][frame]`. OPAMP scope events
//! keep the dtype of the recording. DPTS functions take numpy traces and
//! return edge and train arrays.

use mlr1_core::dpts::{self, Threshold, ZeroSuppress};
use mlr1_core::types::{
    AptsEvent, ChipVariant, SampleWidth, ScopeEvent, ScopeSamples, MATRIX_SIDE,
};
use mlr1_core::{DecodeError, DptsError, HeaderTrim, ScopeLayout, Sidecar};
use numpy::{PyArray1, PyArray2, PyArray3, PyArray4, PyReadonlyArray1};
use pyo3::exceptions::{PyIOError, PyValueError};
use pyo3::prelude::*;
use std::path::Path;

fn decode_err(e: DecodeError) -> PyErr {
    match e {
        DecodeError::Io(e) => PyIOError::new_err(format!("Failed to read file: {}", e)),
        e => PyValueError::new_err(format!("Failed to decode: {}", e)),
    }
}

fn dpts_err(e: DptsError) -> PyErr {
    match e {
        DptsError::Io(e) => PyIOError::new_err(e.to_string()),
        e => PyValueError::new_err(e.to_string()),
    }
}

/// Picks the pixel mapping: explicit `mux`, else chip_ID from the sidecar.
fn resolve_variant(path: &Path, mux: Option<bool>) -> PyResult<ChipVariant> {
    match mux {
        Some(true) => Ok(ChipVariant::Mux),
        Some(false) => Ok(ChipVariant::Standard),
        None => {
            let sidecar = Sidecar::for_raw_file(path)
                .map_err(|e| PyValueError::new_err(format!("Invalid sidecar: {}", e)))?;
            match sidecar {
                Some(sidecar) => sidecar
                    .variant()
                    .map_err(|e| PyValueError::new_err(e.to_string())),
                None => Ok(ChipVariant::Standard),
            }
        }
    }
}

/// Event waveforms as a `(4, 4, frames)` array.
fn event_array<'py>(py: Python<'py>, event: &AptsEvent) -> PyResult<&'py PyArray3<u16>> {
    let frames = event.frames.len();
    let mut data = Vec::with_capacity(MATRIX_SIDE * MATRIX_SIDE * frames);
    for x in 0..MATRIX_SIDE {
        for y in 0..MATRIX_SIDE {
            data.extend(event.waveform(x, y));
        }
    }
    PyArray1::from_vec(py, data).reshape([MATRIX_SIDE, MATRIX_SIDE, frames])
}

fn scope_array(py: Python<'_>, event: ScopeEvent) -> PyResult<PyObject> {
    let shape = [event.channels, event.samples];
    Ok(match event.data {
        ScopeSamples::I8(v) => PyArray1::from_vec(py, v).reshape(shape)?.into_py(py),
        ScopeSamples::I16(v) => PyArray1::from_vec(py, v).reshape(shape)?.into_py(py),
        ScopeSamples::F32(v) => PyArray1::from_vec(py, v).reshape(shape)?.into_py(py),
    })
}

/// Event-by-event decoder over an APTS .raw file.
///
/// Example:
///     >>> import _mlr1 as mlr1
///     >>> decoder = mlr1.AptsDecoder("apts_run.raw")
///     >>> while not decoder.is_done():
///     ...     waveforms, trigger_ts = decoder.get_next_event()
#[pyclass(name = "AptsDecoder", unsendable)]
pub struct PyAptsDecoder {
    inner: mlr1_core::AptsDecoder,
}

#[pymethods]
impl PyAptsDecoder {
    /// Opens a raw file. `mux=None` reads the chip variant from the sidecar.
    #[new]
    #[pyo3(signature = (path, mux=None))]
    fn new(path: &str, mux: Option<bool>) -> PyResult<Self> {
        let path = Path::new(path);
        let variant = resolve_variant(path, mux)?;
        let inner = mlr1_core::AptsDecoder::open(path, variant).map_err(decode_err)?;
        Ok(Self { inner })
    }

    fn is_done(&mut self) -> bool {
        self.inner.is_done()
    }

    /// Returns `(waveforms, trigger_timestamp)` of the next event, or None.
    fn get_next_event<'py>(
        &mut self,
        py: Python<'py>,
    ) -> PyResult<Option<(&'py PyArray3<u16>, Option<u64>)>> {
        match self.inner.next_event().map_err(decode_err)? {
            Some(event) => Ok(Some((event_array(py, &event)?, event.trigger_timestamp))),
            None => Ok(None),
        }
    }

    #[getter]
    fn events_decoded(&self) -> usize {
        self.inner.events_decoded()
    }

    #[getter]
    fn mux(&self) -> bool {
        self.inner.variant() == ChipVariant::Mux
    }

    fn __repr__(&self) -> String {
        format!(
            "AptsDecoder(position={}/{}, events={}, mapping={:?})",
            self.inner.position(),
            self.inner.len(),
            self.inner.events_decoded(),
            self.inner.variant()
        )
    }
}

/// Dual-stream decoder for OPAMP acquisitions.
#[pyclass(name = "OpampDecoder", unsendable)]
pub struct PyOpampDecoder {
    inner: mlr1_core::OpampDecoder,
}

#[pymethods]
impl PyOpampDecoder {
    /// Args:
    ///     adc_path: raw ADC stream
    ///     scope_path: raw oscilloscope stream
    ///     channels: number of scope channels
    ///     samples: samples per channel
    ///     precision: bytes per sample (1, 2 or 4)
    ///     header: optional (header bytes, footer bytes, pulses, scanned points)
    #[new]
    #[pyo3(signature = (adc_path, scope_path, channels, samples, precision=1, header=None))]
    fn new(
        adc_path: &str,
        scope_path: &str,
        channels: usize,
        samples: usize,
        precision: usize,
        header: Option<(usize, usize, usize, usize)>,
    ) -> PyResult<Self> {
        let sample_width = SampleWidth::from_bytes(precision).ok_or_else(|| {
            PyValueError::new_err(format!("Unsupported scope precision {}", precision))
        })?;
        let layout = ScopeLayout {
            channels,
            samples,
            sample_width,
        };
        let trim = header.map(|(header_bytes, footer_bytes, pulses, scanned_points)| HeaderTrim {
            header_bytes,
            footer_bytes,
            pulses,
            scanned_points,
        });
        let adc = std::fs::read(adc_path).map_err(|e| PyIOError::new_err(e.to_string()))?;
        let scope = std::fs::read(scope_path).map_err(|e| PyIOError::new_err(e.to_string()))?;
        let inner = mlr1_core::OpampDecoder::new(adc, scope, layout, trim).map_err(decode_err)?;
        Ok(Self { inner })
    }

    fn is_adc_done(&mut self) -> bool {
        self.inner.is_adc_done()
    }

    fn is_scope_done(&mut self) -> bool {
        self.inner.is_scope_done()
    }

    /// Returns `(waveforms, trigger_timestamp)` of the next ADC event, or None.
    fn get_next_adc_event<'py>(
        &mut self,
        py: Python<'py>,
    ) -> PyResult<Option<(&'py PyArray3<u16>, Option<u64>)>> {
        match self.inner.next_adc_event().map_err(decode_err)? {
            Some(event) => Ok(Some((event_array(py, &event)?, event.trigger_timestamp))),
            None => Ok(None),
        }
    }

    /// Returns the next scope event as a `(channels, samples)` array, or None.
    fn get_next_scope_event(&mut self, py: Python<'_>) -> PyResult<Option<PyObject>> {
        match self.inner.next_scope_event().map_err(decode_err)? {
            Some(event) => Ok(Some(scope_array(py, event)?)),
            None => Ok(None),
        }
    }
}

/// Decodes a whole APTS file.
///
/// Returns:
///     tuple: (uint16 array (events, 4, 4, frames), list of trigger timestamps)
#[pyfunction]
#[pyo3(signature = (path, mux=None))]
fn decode_apts_file<'py>(
    py: Python<'py>,
    path: &str,
    mux: Option<bool>,
) -> PyResult<(&'py PyArray4<u16>, Vec<Option<u64>>)> {
    let path = Path::new(path);
    let variant = resolve_variant(path, mux)?;
    let run = mlr1_core::AptsDecoder::open(path, variant)
        .and_then(|decoder| decoder.decode_all())
        .map_err(decode_err)?;

    let frames = run.frames_per_event();
    let mut data = Vec::with_capacity(run.events.len() * MATRIX_SIDE * MATRIX_SIDE * frames);
    for event in &run.events {
        for x in 0..MATRIX_SIDE {
            for y in 0..MATRIX_SIDE {
                data.extend(event.waveform(x, y));
            }
        }
    }
    let array = PyArray1::from_vec(py, data).reshape([
        run.events.len(),
        MATRIX_SIDE,
        MATRIX_SIDE,
        frames,
    ])?;
    Ok((array, run.trigger_timestamps()))
}

fn zs_settings(invert: bool, only_pos: bool, fix_thresh: Option<f64>) -> ZeroSuppress {
    ZeroSuppress {
        threshold: match fix_thresh {
            Some(level) => Threshold::Fixed(level),
            None if only_pos => Threshold::OnlyPositive,
            None => Threshold::Reference,
        },
        invert,
    }
}

fn traces<'a>(
    t: &'a PyReadonlyArray1<'_, f64>,
    p: &'a PyReadonlyArray1<'_, f64>,
    n: &'a PyReadonlyArray1<'_, f64>,
) -> PyResult<(&'a [f64], &'a [f64], &'a [f64])> {
    let contiguous = |_| PyValueError::new_err("traces must be contiguous arrays");
    Ok((
        t.as_slice().map_err(contiguous)?,
        p.as_slice().map_err(contiguous)?,
        n.as_slice().map_err(contiguous)?,
    ))
}

/// Finds the threshold crossings of a DPTS waveform.
///
/// Returns:
///     tuple: (crossing times, polarities +1/-1)
#[pyfunction]
#[pyo3(signature = (t, p, n, invert=false, only_pos=false, fix_thresh=None))]
fn zero_suppress<'py>(
    py: Python<'py>,
    t: PyReadonlyArray1<'py, f64>,
    p: PyReadonlyArray1<'py, f64>,
    n: PyReadonlyArray1<'py, f64>,
    invert: bool,
    only_pos: bool,
    fix_thresh: Option<f64>,
) -> PyResult<(&'py PyArray1<f64>, &'py PyArray1<i8>)> {
    let (t, p, n) = traces(&t, &p, &n)?;
    let edges = dpts::zero_suppress(t, p, n, &zs_settings(invert, only_pos, fix_thresh))
        .map_err(dpts_err)?;
    let times: Vec<f64> = edges.iter().map(|edge| edge.time).collect();
    let polarities: Vec<i8> = edges.iter().map(|edge| edge.polarity.sign()).collect();
    Ok((
        PyArray1::from_vec(py, times),
        PyArray1::from_vec(py, polarities),
    ))
}

/// Decodes a DPTS waveform into trains.
///
/// Returns:
///     tuple: (trains array (n, 4) of edge times, list of bad trains)
#[pyfunction]
#[pyo3(signature = (t, p, n, invert=false, only_pos=false, fix_thresh=None))]
fn dpts_decode<'py>(
    py: Python<'py>,
    t: PyReadonlyArray1<'py, f64>,
    p: PyReadonlyArray1<'py, f64>,
    n: PyReadonlyArray1<'py, f64>,
    invert: bool,
    only_pos: bool,
    fix_thresh: Option<f64>,
) -> PyResult<(&'py PyArray2<f64>, Vec<Vec<f64>>)> {
    let (t, p, n) = traces(&t, &p, &n)?;
    let set =
        dpts::decode(t, p, n, &zs_settings(invert, only_pos, fix_thresh)).map_err(dpts_err)?;
    let flat: Vec<f64> = set.trains.iter().flat_map(|train| train.0).collect();
    let trains = PyArray1::from_vec(py, flat).reshape([set.trains.len(), 4])?;
    Ok((trains, set.bad_trains))
}

/// MLR1 decoder module for Python.
#[pymodule]
fn _mlr1(_py: Python<'_>, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(decode_apts_file, m)?)?;
    m.add_function(wrap_pyfunction!(zero_suppress, m)?)?;
    m.add_function(wrap_pyfunction!(dpts_decode, m)?)?;
    m.add_class::<PyAptsDecoder>()?;
    m.add_class::<PyOpampDecoder>()?;
    Ok(())
}
