//! Python bindings, built with the `python` feature.
//!
//! The module exposes one class, `Beamline`, wrapping [`crate::beamline::Beamline`]. Signal
//! values cross the boundary as native Python objects (`None`, `bool`, `int`, `float`, `str`,
//! `list`, `dict`); the last image of a report device is returned as a NumPy array.

use std::sync::Arc;

use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict, PyFloat, PyList, PyLong, PyString};
use serde_json::{Map, Value as Json};

use crate::beamline::{BaseBeamline, Beamline};
use crate::client::SirepoClient;
use crate::config::SirepoConfig;
use crate::device::BaseDevice;
use crate::error::SirepoError;
use crate::report::{ReportConfig, ReportDevice};
use crate::sim::SimServer;
use crate::synthesis::SynthesisOptions;

impl From<SirepoError> for PyErr {
    fn from(err: SirepoError) -> PyErr {
        PyRuntimeError::new_err(err.to_string())
    }
}

fn to_py(py: Python, value: &Json) -> PyObject {
    match value {
        Json::Null => py.None(),
        Json::Bool(b) => b.to_object(py),
        Json::Number(n) => match n.as_i64() {
            Some(i) => i.to_object(py),
            None => n.as_f64().unwrap_or(f64::NAN).to_object(py),
        },
        Json::String(s) => s.to_object(py),
        Json::Array(items) => PyList::new(py, items.iter().map(|v| to_py(py, v))).to_object(py),
        Json::Object(map) => {
            let dict = PyDict::new(py);
            for (key, v) in map {
                // Inserting a str key into a fresh dict cannot fail.
                let _ = dict.set_item(key, to_py(py, v));
            }
            dict.to_object(py)
        }
    }
}

fn from_py(obj: &PyAny) -> PyResult<Json> {
    if obj.is_none() {
        return Ok(Json::Null);
    }
    if let Ok(b) = obj.downcast::<PyBool>() {
        return Ok(Json::Bool(b.is_true()));
    }
    if obj.downcast::<PyLong>().is_ok() {
        return Ok(Json::from(obj.extract::<i64>()?));
    }
    if obj.downcast::<PyFloat>().is_ok() {
        return Ok(crate::utils::f64_json(obj.extract::<f64>()?));
    }
    if let Ok(s) = obj.downcast::<PyString>() {
        return Ok(Json::String(s.to_str()?.to_string()));
    }
    if let Ok(list) = obj.downcast::<PyList>() {
        return list.iter().map(from_py).collect::<PyResult<Vec<_>>>().map(Json::Array);
    }
    if let Ok(dict) = obj.downcast::<PyDict>() {
        let mut map = Map::new();
        for (key, value) in dict.iter() {
            map.insert(key.str()?.to_str()?.to_string(), from_py(value)?);
        }
        return Ok(Json::Object(map));
    }
    Err(PyRuntimeError::new_err(format!(
        "cannot convert {} to a signal value",
        obj.get_type().name()?
    )))
}

#[pyclass(name = "Beamline", unsendable)]
pub struct PyBeamline {
    inner: Beamline,
}

impl PyBeamline {
    fn connect(client: SirepoClient, sim_type: &str, sim_id: &str, report: ReportConfig) -> PyResult<Self> {
        client.authenticate(sim_type, sim_id)?;
        let options = SynthesisOptions::default().with_report(report);
        Ok(Self {
            inner: Beamline::new(Arc::new(client), &options)?,
        })
    }
}

#[pymethods]
impl PyBeamline {
    /// Logs in to `sim_id` on `server` and synthesizes its devices.
    #[new]
    #[pyo3(signature = (sim_type, sim_id, server = None, secret = None, root_dir = None))]
    pub fn new(
        sim_type: &str,
        sim_id: &str,
        server: Option<&str>,
        secret: Option<&str>,
        root_dir: Option<&str>,
    ) -> PyResult<Self> {
        let mut config = SirepoConfig::default().with_env_overrides()?;
        if let Some(server) = server {
            config.server = server.to_string();
        }
        if let Some(secret) = secret {
            config.secret = secret.to_string();
        }
        if let Some(root_dir) = root_dir {
            config.root_dir = root_dir.into();
        }
        let client = SirepoClient::from_config(&config)?;
        Self::connect(client, sim_type, sim_id, ReportConfig::from(&config))
    }

    /// Same as the constructor, against the bundled in-process server and its fixtures.
    #[staticmethod]
    #[pyo3(signature = (sim_type, sim_id, root_dir = None))]
    pub fn offline(sim_type: &str, sim_id: &str, root_dir: Option<&str>) -> PyResult<Self> {
        let server = SimServer::srw_basic()
            .with_simulation(SimServer::SHADOW_SIM_ID, SimServer::shadow_document())
            .with_simulation(SimServer::MADX_SIM_ID, SimServer::madx_document());
        let mut report = ReportConfig::default();
        if let Some(root_dir) = root_dir {
            report.root_dir = root_dir.into();
        }
        let client = SirepoClient::new(Arc::new(server), "bluesky");
        Self::connect(client, sim_type, sim_id, report)
    }

    pub fn device_names(&self) -> Vec<String> {
        self.inner.device_names()
    }

    pub fn watchpoints(&self) -> Vec<String> {
        self.inner.watchpoints()
    }

    pub fn component_names(&self, name: &str) -> PyResult<Vec<String>> {
        Ok(self.inner.dev(name)?.component_names())
    }

    pub fn get(&self, name: &str, field: &str, py: Python) -> PyResult<PyObject> {
        Ok(to_py(py, &self.inner.signal_get(name, field)?))
    }

    pub fn set(&mut self, name: &str, field: &str, value: &PyAny) -> PyResult<()> {
        self.inner.signal_set(name, field, from_py(value)?)?;
        Ok(())
    }

    pub fn put(&mut self, name: &str, field: &str, value: &PyAny) -> PyResult<()> {
        self.inner.signal_put(name, field, from_py(value)?)?;
        Ok(())
    }

    pub fn stage(&mut self, name: &str) -> PyResult<()> {
        Ok(self.inner.stage(name)?)
    }

    pub fn trigger(&mut self, name: &str) -> PyResult<bool> {
        Ok(self.inner.trigger(name)?.success())
    }

    pub fn unstage(&mut self, name: &str) -> PyResult<()> {
        Ok(self.inner.unstage(name)?)
    }

    /// `{signal name: {"value": ..., "timestamp": ...}}`
    pub fn read(&self, name: &str, py: Python) -> PyResult<PyObject> {
        let readings = serde_json::to_value(self.inner.read(name)?)
            .map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
        Ok(to_py(py, &readings))
    }

    pub fn describe(&self, name: &str, py: Python) -> PyResult<PyObject> {
        let keys = serde_json::to_value(self.inner.describe(name)?)
            .map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
        Ok(to_py(py, &keys))
    }

    /// Parsed data of the device's most recent trigger, or `None`.
    pub fn last_image(&self, name: &str, py: Python) -> PyResult<PyObject> {
        let dev = self.inner.dev(name)?;
        match ReportDevice::report_state(dev).and_then(|state| state.last_data()) {
            Some(data) => Ok(numpy::PyArray::from_array(py, data).to_object(py)),
            None => Ok(py.None()),
        }
    }
}

#[pymodule]
fn sirepo_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<PyBeamline>()?;
    Ok(())
}
