//! In-process stand-in for the simulation service.
//!
//! [`SimServer`] implements [`Transport`] directly, so a [`SirepoClient`] can be pointed at it
//! without any network. It answers every endpoint the client uses:
//!
//! - login, with verification of the keyed hash;
//! - copy, delete and list of simulations;
//! - run submission and status polling, following a scripted sequence of states;
//! - result download, synthesized from the document that was submitted with the run;
//! - the three stateless computations.
//!
//! Results are deterministic. An SRW watchpoint image is a Gaussian spot scaled by the open area
//! of every aperture upstream of the watch, so its mean grows linearly with an aperture size.
//! MAD-X runs return a TFS table with one row per lattice element.
//!
//! [`SirepoClient`]: crate::client::SirepoClient

use std::collections::HashMap;

use indexmap::IndexMap;
use maplit::btreemap;
use parking_lot::Mutex;
use serde_json::{json, Map, Value as Json};

use crate::client::auth_hash;
use crate::document::*;
use crate::error::*;
use crate::transport::Transport;
use crate::utils::*;

const IMAGE_SIZE: (usize, usize) = (30, 40);
const HORIZONTAL_EXTENT: [f64; 2] = [-1e-3, 1e-3];
const VERTICAL_EXTENT: [f64; 2] = [-0.5e-3, 0.5e-3];
const SPOT_SIGMA: (f64, f64) = (0.3e-3, 0.15e-3);
const PEAK_INTENSITY: f64 = 1e12;
const SILICON_LATTICE: f64 = 5.43096890;
const HC_EV_ANGSTROM: f64 = 12398.4193;

struct Job {
    document: Json,
    calls: usize,
    state: String,
}

struct SimState {
    simulations: IndexMap<String, Json>,
    jobs: HashMap<String, Job>,
    calls: HashMap<String, usize>,
    copies: usize,
}

pub struct SimServer {
    secret: String,
    status_script: Vec<String>,
    poll_interval: f64,
    state: Mutex<SimState>,
}

impl SimServer {
    pub const SRW_SIM_ID: &'static str = "00000000";
    pub const SHADOW_SIM_ID: &'static str = "00000001";
    pub const MADX_SIM_ID: &'static str = "00000002";
    pub const EMPTY_SIM_ID: &'static str = "emptysim";

    /// A server without simulations, accepting logins hashed with `secret`.
    ///
    /// Runs go through one non-terminal "pending" state before completing.
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
            status_script: vec!["pending".to_string(), "completed".to_string()],
            poll_interval: 0.001,
            state: Mutex::new(SimState {
                simulations: IndexMap::new(),
                jobs: HashMap::new(),
                calls: HashMap::new(),
                copies: 0,
            }),
        }
    }

    /// The SRW fixture and an empty SRW simulation, secret `bluesky`.
    pub fn srw_basic() -> Self {
        Self::new("bluesky")
            .with_simulation(Self::SRW_SIM_ID, Self::srw_document())
            .with_simulation(Self::EMPTY_SIM_ID, Self::empty_srw_document())
    }

    pub fn shadow_basic() -> Self {
        Self::new("bluesky").with_simulation(Self::SHADOW_SIM_ID, Self::shadow_document())
    }

    pub fn madx_basic() -> Self {
        Self::new("bluesky").with_simulation(Self::MADX_SIM_ID, Self::madx_document())
    }

    pub fn with_simulation(self, sim_id: &str, document: Json) -> Self {
        self.state
            .lock()
            .simulations
            .insert(sim_id.to_string(), document);
        self
    }

    /// States answered to the submission and each following status call of every run; the last
    /// one repeats.
    pub fn with_status_script(mut self, states: &[&str]) -> Self {
        self.status_script = states.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_poll_interval(mut self, seconds: f64) -> Self {
        self.poll_interval = seconds;
        self
    }

    /// Requests received so far on `endpoint`.
    pub fn calls(&self, endpoint: &str) -> usize {
        self.state.lock().calls.get(endpoint).copied().unwrap_or(0)
    }

    /// Polling calls (submission included) of the last run of `sim_id`.
    pub fn run_calls(&self, sim_id: &str) -> usize {
        self.state.lock().jobs.get(sim_id).map(|j| j.calls).unwrap_or(0)
    }

    pub fn has_simulation(&self, sim_id: &str) -> bool {
        self.state.lock().simulations.contains_key(sim_id)
    }

    pub fn simulation_ids(&self) -> Vec<String> {
        self.state.lock().simulations.keys().cloned().collect()
    }

    /// Stored document of `sim_id`.
    pub fn simulation(&self, sim_id: &str) -> Option<Json> {
        self.state.lock().simulations.get(sim_id).cloned()
    }

    fn status_response(&self, sim_id: &str, sim_type: &Json, report: &Json, job: &mut Job) -> Json {
        let index = (job.calls - 1).min(self.status_script.len().saturating_sub(1));
        let state = self
            .status_script
            .get(index)
            .cloned()
            .unwrap_or_else(|| "completed".to_string());
        job.state = state.clone();
        match state.as_str() {
            "completed" => json!({ "state": "completed", "simulationId": sim_id }),
            "error" => json!({ "state": "error", "error": "scripted failure" }),
            _ => json!({
                "state": state,
                "nextRequestSeconds": self.poll_interval,
                "nextRequest": {
                    "simulationId": sim_id,
                    "simulationType": sim_type,
                    "report": report,
                },
            }),
        }
    }

    fn login(&self, payload: &Json) -> Json {
        let field = |key: &str| payload.get(key).and_then(Json::as_str).unwrap_or_default();
        let (sim_type, sim_id) = (field("simulationType"), field("simulationId"));
        let expected = auth_hash(field("authNonce"), sim_type, sim_id, &self.secret);
        if field("authHash") != expected {
            return json!({ "state": "error", "error": "invalid auth hash" });
        }
        match self.state.lock().simulations.get(sim_id) {
            Some(doc) if doc["simulationType"] == json!(sim_type) => json!({
                "state": "ok",
                "data": doc,
                "schema": { "simulationType": sim_type },
            }),
            _ => json!({ "state": "error", "error": "simulation not found" }),
        }
    }

    fn copy(&self, payload: &Json) -> Json {
        let mut state = self.state.lock();
        let source = payload["simulationId"].as_str().unwrap_or_default();
        let mut doc = match state.simulations.get(source) {
            Some(doc) => doc.clone(),
            None => return json!({ "state": "error", "error": "simulation not found" }),
        };
        state.copies += 1;
        let copy_id = format!("copy{:04}", state.copies);
        if let Some(simulation) = doc
            .pointer_mut("/models/simulation")
            .and_then(Json::as_object_mut)
        {
            simulation.insert("simulationId".to_string(), json!(copy_id));
            simulation.insert("name".to_string(), payload["name"].clone());
            simulation.insert("folder".to_string(), payload["folder"].clone());
        }
        state.simulations.insert(copy_id, doc.clone());
        doc
    }

    fn delete(&self, payload: &Json) -> Json {
        let mut state = self.state.lock();
        let sim_id = payload["simulationId"].as_str().unwrap_or_default();
        state.jobs.remove(sim_id);
        match state.simulations.shift_remove(sim_id) {
            Some(_) => json!({ "state": "ok" }),
            None => json!({ "state": "error", "error": "simulation not found" }),
        }
    }

    fn run(&self, payload: &Json) -> Json {
        let sim_id = payload["simulationId"].as_str().unwrap_or_default().to_string();
        let mut state = self.state.lock();
        if !state.simulations.contains_key(&sim_id) {
            return json!({ "state": "error", "error": "simulation not found" });
        }
        let mut job = Job {
            document: payload.clone(),
            calls: 1,
            state: String::new(),
        };
        let res = self.status_response(
            &sim_id,
            &payload["simulationType"],
            &payload["report"],
            &mut job,
        );
        state.jobs.insert(sim_id, job);
        res
    }

    fn status(&self, payload: &Json) -> Json {
        let sim_id = payload["simulationId"].as_str().unwrap_or_default();
        let mut state = self.state.lock();
        match state.jobs.get_mut(sim_id) {
            Some(job) => {
                job.calls += 1;
                self.status_response(sim_id, &payload["simulationType"], &payload["report"], job)
            }
            None => json!({ "state": "error", "error": "no such job" }),
        }
    }

    fn list(&self, payload: &Json) -> Json {
        let state = self.state.lock();
        let list: Vec<Json> = state
            .simulations
            .iter()
            .filter(|(_, doc)| doc["simulationType"] == payload["simulationType"])
            .map(|(id, doc)| {
                json!({
                    "simulationId": id,
                    "name": doc.pointer("/models/simulation/name").cloned().unwrap_or(Json::Null),
                    "folder": doc.pointer("/models/simulation/folder").cloned().unwrap_or(json!("/")),
                })
            })
            .collect();
        Json::Array(list)
    }

    fn download(&self, endpoint: &str) -> SirepoResult<Vec<u8>> {
        let not_found = || SirepoError::Http {
            url: endpoint.to_string(),
            status: 404,
        };
        let parts: Vec<&str> = endpoint.split('/').collect();
        let (sim_type, sim_id, report) = match parts.as_slice() {
            ["download-data-file", sim_type, sim_id, report, _index] => (*sim_type, *sim_id, *report),
            _ => return Err(not_found()),
        };
        let document = {
            let state = self.state.lock();
            match state.jobs.get(sim_id) {
                Some(job) if job.state == "completed" => job.document.clone(),
                _ => return Err(not_found()),
            }
        };
        let document = SimDocument::new(document);
        let text = match sim_type.parse::<SimType>()? {
            SimType::Srw if report == "intensityReport" => spectrum_file(&document)?,
            SimType::Srw => {
                let watch_id = report.strip_prefix("watchpointReport").ok_or_else(not_found)?;
                image_file(&document, "beamline", watch_id, IMAGE_SIZE)?
            }
            SimType::Shadow => {
                let watch_id = report.strip_prefix("watchpointReport").ok_or_else(not_found)?;
                let bins = document
                    .group(report)?
                    .get("histogramBins")
                    .and_then(json_f64)
                    .unwrap_or(100.) as usize;
                image_file(&document, "beamline", watch_id, (bins, bins))?
            }
            SimType::Madx => twiss_file(&document)?,
        };
        Ok(text.into_bytes())
    }

    fn compute(&self, payload: &Json) -> Json {
        let mut element = match payload["optical_element"].as_object() {
            Some(element) => element.clone(),
            None => return json!({ "state": "error", "error": "missing optical_element" }),
        };
        let number = |element: &Map<String, Json>, key: &str, default: f64| {
            element.get(key).and_then(json_f64).unwrap_or(default)
        };
        match payload["method"].as_str().unwrap_or_default() {
            "compute_grazing_orientation" => {
                let angle = number(&element, "grazingAngle", 0.);
                let autocompute = element
                    .get("autocomputeVectors")
                    .and_then(Json::as_str)
                    .unwrap_or("horizontal")
                    .to_string();
                update_grazing_vectors(&mut element, angle, &autocompute);
            }
            "compute_crl_characteristics" => {
                let radius = number(&element, "tipRadius", 1500.) * 1e-6;
                let lenses = number(&element, "numberOfLenses", 1.).max(1.);
                let delta = number(&element, "refractiveIndex", 4.2e-6);
                let focal = radius / (2. * lenses * delta);
                let position = number(&element, "position", 0.);
                element.insert("focalDistance".to_string(), f64_json(focal));
                element.insert("absoluteFocusPosition".to_string(), f64_json(position + focal));
            }
            "compute_crystal_orientation" => {
                for (key, value) in crystal_orientation(&element) {
                    element.insert(key.to_string(), f64_json(value));
                }
            }
            other => {
                return json!({ "state": "error", "error": format!("unknown method '{}'", other) })
            }
        }
        element.insert("state".to_string(), json!("ok"));
        Json::Object(element)
    }
}

impl Transport for SimServer {
    fn post_json(&self, endpoint: &str, payload: &Json) -> SirepoResult<Json> {
        *self
            .state
            .lock()
            .calls
            .entry(endpoint.to_string())
            .or_insert(0) += 1;
        match endpoint {
            "auth-bluesky-login" => Ok(self.login(payload)),
            "copy-simulation" => Ok(self.copy(payload)),
            "delete-simulation" => Ok(self.delete(payload)),
            "run-simulation" => Ok(self.run(payload)),
            "run-status" => Ok(self.status(payload)),
            "stateless-compute" => Ok(self.compute(payload)),
            "simulation-list" => Ok(self.list(payload)),
            _ => Err(SirepoError::Http {
                url: endpoint.to_string(),
                status: 404,
            }),
        }
    }

    fn get_bytes(&self, endpoint: &str) -> SirepoResult<Vec<u8>> {
        *self
            .state
            .lock()
            .calls
            .entry("download-data-file".to_string())
            .or_insert(0) += 1;
        self.download(endpoint)
    }

    fn describe(&self) -> String {
        "in-process simulation server".to_string()
    }
}

/// Product of the open areas of the apertures placed before the element with id `watch_id`.
fn transmission(document: &SimDocument, group: &str, watch_id: &str) -> SirepoResult<f64> {
    let elements = document.elements(group)?;
    let watch = elements
        .iter()
        .find(|e| e.get("id").map(id_key).as_deref() == Some(watch_id))
        .ok_or_else(|| SirepoError::not_found("id", watch_id))?;
    let watch_position = watch.get("position").and_then(json_f64).unwrap_or(f64::INFINITY);
    Ok(elements
        .iter()
        .filter(|e| e.get("type") == Some(&json!("aperture")))
        .filter(|e| e.get("position").and_then(json_f64).unwrap_or(0.) <= watch_position)
        .map(|e| {
            let size = |key| e.get(key).and_then(json_f64).unwrap_or(1.);
            size("horizontalSize") * size("verticalSize")
        })
        .product())
}

fn ascii_header(ranges: [f64; 9]) -> String {
    let labels = [
        "Initial Photon Energy [eV]",
        "Final Photon Energy [eV]",
        "Number of points vs Photon Energy",
        "Initial Horizontal Position [m]",
        "Final Horizontal Position [m]",
        "Number of points vs Horizontal Position",
        "Initial Vertical Position [m]",
        "Final Vertical Position [m]",
        "Number of points vs Vertical Position",
    ];
    let mut text = String::from(
        "#C-aligned Intensity (inner loop is vs photon energy, outer loop vs vertical position)\n",
    );
    for (value, label) in ranges.iter().zip(labels) {
        text.push_str(&format!("#{} #{}\n", value, label));
    }
    text
}

fn image_file(
    document: &SimDocument,
    group: &str,
    watch_id: &str,
    (ny, nx): (usize, usize),
) -> SirepoResult<String> {
    let scale = PEAK_INTENSITY * transmission(document, group, watch_id)?;
    let energy = document
        .as_json()
        .pointer("/models/simulation/photonEnergy")
        .and_then(json_f64)
        .unwrap_or(1000.);
    let mut text = ascii_header([
        energy,
        energy,
        1.,
        HORIZONTAL_EXTENT[0],
        HORIZONTAL_EXTENT[1],
        nx as f64,
        VERTICAL_EXTENT[0],
        VERTICAL_EXTENT[1],
        ny as f64,
    ]);
    let coord = |i: usize, n: usize, extent: [f64; 2]| {
        if n > 1 {
            extent[0] + (extent[1] - extent[0]) * i as f64 / (n - 1) as f64
        } else {
            0.5 * (extent[0] + extent[1])
        }
    };
    for row in 0..ny {
        let y = coord(row, ny, VERTICAL_EXTENT);
        for col in 0..nx {
            let x = coord(col, nx, HORIZONTAL_EXTENT);
            let r2 = (x / SPOT_SIGMA.0).powi(2) + (y / SPOT_SIGMA.1).powi(2);
            text.push_str(&format!("{}\n", scale * (-0.5 * r2).exp()));
        }
    }
    Ok(text)
}

fn spectrum_file(document: &SimDocument) -> SirepoResult<String> {
    let report = document.group("intensityReport")?;
    let value = |key: &str, default: f64| report.get(key).and_then(json_f64).unwrap_or(default);
    let (e0, e1) = (value("initialEnergy", 100.), value("finalEnergy", 20000.));
    let ne = value("photonEnergyPointCount", 100.).max(1.) as usize;
    let mut text = ascii_header([e0, e1, ne as f64, 0., 0., 1., 0., 0., 1.]);
    for i in 0..ne {
        let e = if ne > 1 {
            e0 + (e1 - e0) * i as f64 / (ne - 1) as f64
        } else {
            e0
        };
        text.push_str(&format!("{}\n", 1e10 * (1. + (e / 1000.).sin().powi(2))));
    }
    Ok(text)
}

fn twiss_file(document: &SimDocument) -> SirepoResult<String> {
    let mut text = String::from("@ NAME %08s \"TWISS\"\n@ TYPE %05s \"TWISS\"\n");
    text.push_str("* NAME KEYWORD S BETX BETY\n$ %s %s %le %le %le\n");
    let mut s = 0.;
    for element in document.elements(MADX_DIALECT.element_group)? {
        let name = element.get("name").and_then(Json::as_str).unwrap_or("UNNAMED");
        let keyword = element.get("type").and_then(Json::as_str).unwrap_or("MARKER");
        s += element.get("l").and_then(json_f64).unwrap_or(0.);
        let k1 = element.get("k1").and_then(json_f64).unwrap_or(0.);
        text.push_str(&format!(
            "\"{}\" \"{}\" {} {} {}\n",
            name,
            keyword,
            s,
            10. + s + k1,
            5. + 0.5 * s - k1
        ));
    }
    Ok(text)
}

/// Orientation of a symmetric silicon crystal at the element's `energy` (eV) and `h k l`.
fn crystal_orientation(element: &Map<String, Json>) -> Vec<(&'static str, f64)> {
    let number = |key: &str, default: f64| element.get(key).and_then(json_f64).unwrap_or(default);
    let (h, k, l) = (number("h", 1.), number("k", 1.), number("l", 1.));
    let energy = number("energy", 9000.).max(1.);
    let d_spacing = SILICON_LATTICE / (h * h + k * k + l * l).max(1.).sqrt();
    let theta = (HC_EV_ANGSTROM / energy / (2. * d_spacing)).clamp(-1., 1.).asin();
    let scale = (9000. / energy).powi(2);
    vec![
        ("dSpacing", d_spacing),
        ("grazingAngle", theta * 1000.),
        ("nvx", 0.),
        ("nvy", theta.cos()),
        ("nvz", -theta.sin()),
        ("outframevx", 1.),
        ("outframevy", 0.),
        ("outoptvx", 0.),
        ("outoptvy", (2. * theta).sin()),
        ("outoptvz", (2. * theta).cos()),
        ("psi0i", 1.9e-7 * scale),
        ("psi0r", -1.2e-5 * scale),
        ("psiHBi", 1.3e-7 * scale),
        ("psiHBr", -6.3e-6 * scale),
        ("psiHi", 1.3e-7 * scale),
        ("psiHr", -6.3e-6 * scale),
        ("tvx", 0.),
        ("tvy", theta.sin()),
    ]
}

fn propagation_row() -> Json {
    json!([0, 0, 1, 0, 0, 1.0, 1.0, 1.0, 1.0])
}

impl SimServer {
    /// SRW fixture: an aperture, a grazing mirror, a CRL, a crystal and the watchpoint `W9`.
    pub fn srw_document() -> Json {
        let mut crystal = json!({
            "id": 4,
            "title": "Mono Crystal 1",
            "type": "crystal",
            "position": 35,
            "material": "Silicon (SRW)",
            "energy": 9000,
            "h": 1,
            "k": 1,
            "l": 1,
            "crystalThickness": 0.01,
        });
        if let Some(crystal) = crystal.as_object_mut() {
            for (key, _) in crystal_orientation(&Map::new()) {
                crystal.insert(key.to_string(), json!(0.0));
            }
        }
        let rows = || json!([propagation_row(), propagation_row()]);
        let propagation = btreemap! {
            "1" => rows(),
            "2" => rows(),
            "3" => rows(),
            "4" => rows(),
            "9" => rows(),
        };
        json!({
            "simulationType": "srw",
            "models": {
                "simulation": {
                    "simulationId": Self::SRW_SIM_ID,
                    "name": "Basic Beamline",
                    "folder": "/",
                    "photonEnergy": 1000,
                },
                "beamline": [
                    {
                        "id": 1,
                        "title": "Aperture",
                        "type": "aperture",
                        "position": 20,
                        "shape": "r",
                        "horizontalSize": 1,
                        "verticalSize": 1,
                        "horizontalOffset": 0,
                        "verticalOffset": 0,
                    },
                    {
                        "id": 2,
                        "title": "HFM",
                        "type": "sphericalMirror",
                        "position": 25,
                        "autocomputeVectors": "horizontal",
                        "grazingAngle": 3.1415926,
                        "radius": 1049,
                        "sagittalSize": 0.01,
                        "tangentialSize": 0.5,
                        "normalVectorX": 0.9999950652018,
                        "normalVectorY": 0,
                        "normalVectorZ": -0.0031415874,
                        "tangentialVectorX": 0.0031415874,
                        "tangentialVectorY": 0,
                    },
                    {
                        "id": 3,
                        "title": "CRL1",
                        "type": "crl",
                        "position": 30,
                        "numberOfLenses": 4,
                        "tipRadius": 1500,
                        "refractiveIndex": 4.207e-06,
                        "attenuationLength": 0.007313,
                        "focalDistance": 0.0,
                        "absoluteFocusPosition": 0.0,
                    },
                    crystal,
                    {
                        "id": 9,
                        "title": "W9",
                        "type": "watch",
                        "position": 40,
                    },
                ],
                "propagation": propagation,
                "postPropagation": propagation_row(),
                "watchpointReport9": {
                    "characteristic": "0",
                    "fieldUnits": 1,
                    "polarization": "6",
                    "precision": 8,
                },
                "intensityReport": {
                    "initialEnergy": 100,
                    "finalEnergy": 20000,
                    "photonEnergyPointCount": 200,
                    "method": "1",
                    "precision": 0.01,
                    "distanceFromSource": 20,
                },
                "undulator": {
                    "period": 20,
                    "length": 3,
                    "horizontalAmplitude": 0,
                    "verticalAmplitude": 0.88,
                },
            },
        })
    }

    /// SRW simulation with an empty beamline, the base of spliced beamlines.
    pub fn empty_srw_document() -> Json {
        json!({
            "simulationType": "srw",
            "models": {
                "simulation": {
                    "simulationId": Self::EMPTY_SIM_ID,
                    "name": "Empty",
                    "folder": "/",
                    "photonEnergy": 1000,
                },
                "beamline": [],
                "propagation": {},
                "postPropagation": propagation_row(),
            },
        })
    }

    /// Shadow fixture: an aperture and the watchpoint `W2` with 50 histogram bins.
    pub fn shadow_document() -> Json {
        json!({
            "simulationType": "shadow",
            "models": {
                "simulation": {
                    "simulationId": Self::SHADOW_SIM_ID,
                    "name": "Basic Shadow",
                    "folder": "/",
                    "photonEnergy": 1000,
                },
                "beamline": [
                    {
                        "id": 1,
                        "title": "Aperture",
                        "type": "aperture",
                        "position": 10,
                        "horizontalSize": 2,
                        "verticalSize": 1,
                    },
                    {
                        "id": 2,
                        "title": "W2",
                        "type": "watch",
                        "position": 20,
                    },
                ],
                "watchpointReport2": {
                    "histogramBins": 50,
                    "columnX": 1,
                    "columnY": 3,
                    "weightColumn": 23,
                },
            },
        })
    }

    /// MAD-X fixture: a FODO cell with a monitor, two commands and one RPN variable.
    pub fn madx_document() -> Json {
        json!({
            "simulationType": "madx",
            "models": {
                "simulation": {
                    "simulationId": Self::MADX_SIM_ID,
                    "name": "FODO",
                    "folder": "/",
                },
                "elements": [
                    { "_id": 1, "name": "QF", "type": "QUADRUPOLE", "l": 0.5, "k1": 1.2 },
                    { "_id": 2, "name": "D1", "type": "DRIFT", "l": 2.0 },
                    { "_id": 3, "name": "QD", "type": "QUADRUPOLE", "l": 0.5, "k1": -1.2 },
                    { "_id": 4, "name": "BPM1", "type": "MONITOR", "l": 0.0 },
                ],
                "commands": [
                    { "_id": 10, "_type": "beam", "particle": "electron", "pc": 3 },
                    { "_id": 11, "_type": "twiss", "file": "1", "class": "ring" },
                ],
                "rpnVariables": [
                    { "name": "kq", "value": 1.2 },
                ],
            },
        })
    }
}

#[cfg(test)]
mod test {
    mod sim_server {
        use crate::client::auth_nonce;
        use crate::sim::*;
        use crate::transport::Transport;

        fn login(server: &SimServer, sim_type: &str, sim_id: &str, secret: &str) -> Json {
            let nonce = auth_nonce();
            server
                .post_json(
                    "auth-bluesky-login",
                    &json!({
                        "simulationType": sim_type,
                        "simulationId": sim_id,
                        "authNonce": nonce,
                        "authHash": auth_hash(&nonce, sim_type, sim_id, secret),
                    }),
                )
                .unwrap()
        }

        #[test]
        fn login_checks_the_hash() {
            let server = SimServer::srw_basic();
            assert_eq!(login(&server, "srw", "00000000", "bluesky")["state"], "ok");
            assert_eq!(login(&server, "srw", "00000000", "wrong")["state"], "error");
            assert_eq!(login(&server, "srw", "missing", "bluesky")["state"], "error");
            assert_eq!(server.calls("auth-bluesky-login"), 3);
        }

        #[test]
        fn scripted_runs() {
            let server = SimServer::srw_basic().with_status_script(&["pending", "running", "completed"]);
            let mut doc = SimServer::srw_document();
            doc["simulationId"] = json!("00000000");
            doc["report"] = json!("watchpointReport9");
            let first = server.post_json("run-simulation", &doc).unwrap();
            assert_eq!(first["state"], "pending");
            let second = server.post_json("run-status", &first["nextRequest"]).unwrap();
            assert_eq!(second["state"], "running");
            assert!(server.get_bytes("download-data-file/srw/00000000/watchpointReport9/-1").is_err());
            let third = server.post_json("run-status", &second["nextRequest"]).unwrap();
            assert_eq!(third["state"], "completed");
            assert_eq!(server.run_calls("00000000"), 3);
            let raw = server
                .get_bytes("download-data-file/srw/00000000/watchpointReport9/-1")
                .unwrap();
            assert!(String::from_utf8(raw).unwrap().starts_with("#C-aligned"));
        }

        #[test]
        fn transmission_follows_aperture_size() {
            let mut doc = SimServer::srw_document();
            doc["models"]["beamline"][0]["horizontalSize"] = json!(0.5);
            let doc = SimDocument::new(doc);
            assert_eq!(transmission(&doc, "beamline", "9").unwrap(), 0.5);
            assert!(transmission(&doc, "beamline", "7").is_err());
        }

        #[test]
        fn crl_characteristics() {
            let server = SimServer::srw_basic();
            let crl = SimServer::srw_document()["models"]["beamline"][2].clone();
            let res = server
                .post_json(
                    "stateless-compute",
                    &json!({ "method": "compute_crl_characteristics", "optical_element": crl }),
                )
                .unwrap();
            assert_eq!(res["state"], "ok");
            let focal = res["focalDistance"].as_f64().unwrap();
            assert!((focal - 1500e-6 / (8. * 4.207e-06)).abs() < 1e-9);
            assert!((res["absoluteFocusPosition"].as_f64().unwrap() - (30. + focal)).abs() < 1e-9);
        }

        #[test]
        fn copies_get_fresh_ids() {
            let server = SimServer::srw_basic();
            let copy = server
                .post_json(
                    "copy-simulation",
                    &json!({ "simulationId": "00000000", "name": "c", "folder": "/" }),
                )
                .unwrap();
            let id = copy["models"]["simulation"]["simulationId"].as_str().unwrap();
            assert!(server.has_simulation(id));
            let del = server
                .post_json("delete-simulation", &json!({ "simulationId": id }))
                .unwrap();
            assert_eq!(del["state"], "ok");
            assert!(!server.has_simulation(id));
        }
    }
}
