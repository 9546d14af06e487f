//! Multi-copy flyer: one simulation copy per parameter delta.
//!
//! ## Overview
//!
//! [`SirepoFlyer`] takes a list of parameter deltas, each mapping element titles to
//! `{parameter: value}` updates. On `kickoff` it clones the base simulation once per delta,
//! applies the delta to the clone's document and points the clone's report at the watchpoint.
//! Grazing mirrors whose angle changes get their orientation vectors recomputed locally, using the
//! `autocomputeVectors` setting read once from the base document.
//!
//! The copies run either one after the other inside `kickoff`, or on worker threads started by
//! `kickoff` and joined by `complete`. Either way the terminal state of each copy is stored by
//! copy index, and `collect` yields one row per copy in submission order: the datum of its result
//! file, the parsed statistics, the SHA-256 of the raw bytes, its state, and the values it was
//! given. Every server-side copy is deleted by `collect`.
//!
//! ## Example
//!
//! ```
//! use sirepo_backend::*;
//! use sirepo_flyer_backend::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let client = SirepoClient::new(Arc::new(SimServer::srw_basic()), "bluesky");
//! client.authenticate("srw", SimServer::SRW_SIM_ID).unwrap();
//!
//! let deltas: Vec<ParamDelta> = [0.5, 1.0]
//!     .iter()
//!     .map(|size| {
//!         let params = [("horizontalSize".to_string(), json!(size))].into();
//!         ParamDelta::from([("Aperture".to_string(), params)])
//!     })
//!     .collect();
//! let options = SirepoFlyerOptions {
//!     watch_name: "W9".to_string(),
//!     root_dir: std::env::temp_dir().join("sirepo-flyer-doc"),
//!     ..Default::default()
//! };
//! let mut flyer = SirepoFlyer::new(Arc::new(client), deltas, options);
//!
//! flyer.kickoff().unwrap();
//! flyer.complete().unwrap();
//! let rows = flyer.collect().unwrap();
//! assert_eq!(rows.len(), 2);
//! ```

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{json, Map, Value as Json};
use sirepo_backend::*;

use crate::flyer::*;
use crate::utils::content_hash;
use crate::worker::WorkerPool;

/// Element title to `{parameter: new value}`.
pub type ParamDelta = IndexMap<String, IndexMap<String, Json>>;

#[derive(Clone, Debug)]
pub struct SirepoFlyerOptions {
    /// Title of the watch element whose report every copy runs.
    pub watch_name: String,
    pub run_parallel: bool,
    /// Upper bound on copies running at once in parallel mode; `None` runs all of them.
    pub max_workers: Option<usize>,
    pub root_dir: PathBuf,
    /// Status-call budget of each copy; `None` keeps the base client's.
    pub max_status_calls: Option<usize>,
}

impl Default for SirepoFlyerOptions {
    fn default() -> Self {
        Self {
            watch_name: "Watchpoint".to_string(),
            run_parallel: true,
            max_workers: None,
            root_dir: SirepoConfig::default().root_dir,
            max_status_calls: None,
        }
    }
}

/// A copy created by `kickoff`, with the file its result goes to.
struct SimCopy {
    client: Arc<SirepoClient>,
    result_file: PathBuf,
    datum_factory: DatumFactory,
}

pub struct SirepoFlyer {
    name: String,
    connection: Arc<SirepoClient>,
    params_to_change: Vec<ParamDelta>,
    options: SirepoFlyerOptions,
    copies: Vec<SimCopy>,
    statuses: Vec<Option<String>>,
    datum_ids: Vec<String>,
    pool: Option<WorkerPool>,
    asset_docs: VecDeque<AssetDoc>,
}

impl SirepoFlyer {
    /// Flyer over `connection`, which must be authenticated against an SRW simulation.
    pub fn new(
        connection: Arc<SirepoClient>,
        params_to_change: Vec<ParamDelta>,
        options: SirepoFlyerOptions,
    ) -> Self {
        Self {
            name: "sirepo_flyer".to_string(),
            connection,
            params_to_change,
            options,
            copies: Vec::new(),
            statuses: Vec::new(),
            datum_ids: Vec::new(),
            pool: None,
            asset_docs: VecDeque::new(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn options(&self) -> &SirepoFlyerOptions {
        &self.options
    }

    pub fn params_to_change(&self) -> &[ParamDelta] {
        &self.params_to_change
    }

    pub fn copy_count(&self) -> usize {
        self.params_to_change.len()
    }

    /// Simulation ids of the copies created by the last `kickoff`.
    pub fn copy_ids(&self) -> Vec<String> {
        self.copies
            .iter()
            .filter_map(|c| c.client.sim_id())
            .collect()
    }

    /// Clients of the copies created by the last `kickoff`, in submission order.
    pub fn copy_clients(&self) -> Vec<Arc<SirepoClient>> {
        self.copies.iter().map(|c| c.client.clone()).collect()
    }

    /// Terminal state of each copy by copy index; `None` until that copy has finished.
    pub fn statuses(&self) -> &[Option<String>] {
        &self.statuses
    }

    /// `autocomputeVectors` of every element of the base beamline that has one, by title.
    fn autocompute_map(&self) -> SirepoResult<IndexMap<String, String>> {
        let document = self.connection.document().read();
        let group = self.connection.sim_type()?.dialect().element_group;
        Ok(document
            .elements(group)?
            .iter()
            .filter_map(|element| {
                let title = element.get("title")?.as_str()?;
                let autocompute = element.get("autocomputeVectors")?.as_str()?;
                Some((title.to_string(), autocompute.to_string()))
            })
            .collect())
    }

    /// Clones the base simulation and applies `delta` to the clone.
    ///
    /// A clone whose delta cannot be applied is deleted again before the error is returned.
    fn make_copy(
        &self,
        delta: &ParamDelta,
        autocompute: &IndexMap<String, String>,
    ) -> SirepoResult<SirepoClient> {
        let base_name = self
            .connection
            .document()
            .read()
            .as_json()
            .pointer("/models/simulation/name")
            .and_then(Json::as_str)
            .unwrap_or("simulation")
            .to_string();
        // The service renames copies as needed.
        let mut copy = self.connection.clone_simulation(&format!("{} Bluesky", base_name))?;
        if let Some(max_status_calls) = self.options.max_status_calls {
            copy = copy.with_max_status_calls(max_status_calls);
        }
        if let Err(err) = self.apply_delta(&copy, delta, autocompute) {
            discard_copy(&copy);
            return Err(err);
        }
        log::info!(
            "copy {} of {} with {} changed elements",
            copy.sim_id().unwrap_or_default(),
            base_name,
            delta.len()
        );
        Ok(copy)
    }

    /// Writes `delta` into the document of `copy` and points its report at the watchpoint.
    fn apply_delta(
        &self,
        copy: &SirepoClient,
        delta: &ParamDelta,
        autocompute: &IndexMap<String, String>,
    ) -> SirepoResult<()> {
        let group = copy.sim_type()?.dialect().element_group;
        let mut document = copy.document().write();
        for (title, params) in delta {
            let index = document.element_index(group, "title", &json!(title))?;
            let element = document
                .slot_(&Slot::Element {
                    group: group.to_string(),
                    index,
                })?
                .as_object_mut()
                .ok_or_else(|| {
                    SirepoError::SchemaMismatch(format!("element '{}' is not a mapping", title))
                })?;
            for (param, value) in params {
                element.insert(param.clone(), value.clone());
            }
            if let (Some(autocompute), Some(angle)) = (
                autocompute.get(title),
                params.get("grazingAngle").and_then(json_f64),
            ) {
                update_grazing_vectors(element, angle, autocompute);
            }
        }
        let watch = document.element_index(group, "title", &json!(self.options.watch_name))?;
        let watch_id = document.elements(group)?[watch]
            .get("id")
            .map(id_key)
            .ok_or_else(|| {
                SirepoError::SchemaMismatch(format!(
                    "watch '{}' has no id",
                    self.options.watch_name
                ))
            })?;
        document.set_report(&format!("watchpointReport{}", watch_id));
        Ok(())
    }

    /// Clones the base simulation once per delta and composes the resource of each copy.
    fn create_copies(&mut self) -> SirepoResult<()> {
        let autocompute = self.autocompute_map()?;
        for delta in &self.params_to_change {
            let client = Arc::new(self.make_copy(delta, &autocompute)?);
            let (relative, absolute) = match new_result_stem(&self.options.root_dir) {
                Ok(stem) => stem,
                Err(err) => {
                    discard_copy(&client);
                    return Err(err);
                }
            };
            let (resource, datum_factory) = compose_resource(
                "SIREPO_FLYER",
                &self.options.root_dir,
                &with_suffix(&relative, ".dat"),
                Map::new(),
            );
            self.asset_docs.push_back(AssetDoc::Resource(resource));
            self.copies.push(SimCopy {
                client,
                result_file: with_suffix(&absolute, ".dat"),
                datum_factory,
            });
        }
        Ok(())
    }

    fn record_status(&mut self, index: usize, result: &SirepoResult<String>) {
        let sim_id = self.copies[index].client.sim_id().unwrap_or_default();
        match result {
            Ok(state) => {
                log::info!("status of sim {}: {}", sim_id, state);
                self.statuses[index] = Some(state.clone());
            }
            Err(err) => {
                log::error!("sim {} failed: {}", sim_id, err);
                self.statuses[index] = Some(match err {
                    SirepoError::SimulationFailed { state, .. } => state.clone(),
                    SirepoError::PollBudgetExhausted { state, .. } => state.clone(),
                    _ => "error".to_string(),
                });
            }
        }
    }

    /// Joins any running workers, then deletes every copy still present on the service.
    ///
    /// Statuses are kept so that a failed run can still be inspected.
    fn discard_copies(&mut self) {
        if let Some(pool) = self.pool.take() {
            if let Err(err) = pool.join() {
                log::warn!("{}: {}", self.name, err);
            }
        }
        for copy in self.copies.drain(..) {
            discard_copy(&copy.client);
        }
        self.datum_ids.clear();
    }

    fn reset(&mut self) {
        self.discard_copies();
        self.statuses.clear();
    }

    /// Runs one copy to completion and returns its terminal state.
    fn run_copy(client: &SirepoClient) -> SirepoResult<String> {
        log::info!("running sim {}", client.sim_id().unwrap_or_default());
        let (status, _) = client.run_default()?;
        Ok(status
            .get("state")
            .and_then(Json::as_str)
            .unwrap_or("completed")
            .to_string())
    }

    /// Builds the row of every copy in submission order, deleting each copy once it is read.
    fn collect_rows(&self) -> SirepoResult<Vec<FlyerEvent>> {
        let reader = ReportConfig::default().reader_for(SimType::Srw)?;
        let now = now_timestamp();
        let mut events = Vec::with_capacity(self.copies.len());
        for (index, copy) in self.copies.iter().enumerate() {
            let raw = copy.client.fetch_result(-1)?;
            fs::write(&copy.result_file, &raw)?;
            let parsed = reader.read(&raw, &ReadOptions::image())?;
            let hash = content_hash(&raw);
            log::info!(
                "copy {} data hash: {}",
                copy.client.sim_id().unwrap_or_default(),
                hash
            );
            copy.client.delete_clone()?;

            let mut data = IndexMap::new();
            data.insert(self.data_key("image"), json!(self.datum_ids[index]));
            data.insert(self.data_key("shape"), json!(parsed.shape));
            data.insert(self.data_key("mean"), f64_json(parsed.mean));
            data.insert(self.data_key("photon_energy"), parsed.photon_energy.clone());
            data.insert(self.data_key("horizontal_extent"), json!(parsed.horizontal_extent));
            data.insert(self.data_key("vertical_extent"), json!(parsed.vertical_extent));
            data.insert(self.data_key("hash_value"), json!(hash));
            data.insert(
                self.data_key("status"),
                json!(self.statuses[index].clone().unwrap_or_default()),
            );
            for (title, params) in &self.params_to_change[index] {
                for (param, value) in params {
                    data.insert(self.data_key(&format!("{}_{}", title, param)), value.clone());
                }
            }
            events.push(FlyerEvent::new(data, now));
        }
        Ok(events)
    }
}

/// Deletes `copy` from the service unless it is already gone; failures are only logged.
fn discard_copy(copy: &SirepoClient) {
    if let Some(sim_id) = copy.sim_id() {
        match copy.delete_clone() {
            Ok(()) => log::info!("discarded copy {}", sim_id),
            Err(err) => log::warn!("could not delete copy {}: {}", sim_id, err),
        }
    }
}

impl Drop for SirepoFlyer {
    fn drop(&mut self) {
        self.discard_copies();
    }
}

impl BlueskyFlyer for SirepoFlyer {
    fn name(&self) -> &str {
        &self.name
    }
    fn asset_docs(&self) -> &VecDeque<AssetDoc> {
        &self.asset_docs
    }
    fn asset_docs_(&mut self) -> &mut VecDeque<AssetDoc> {
        &mut self.asset_docs
    }

    /// Creates the copies and their resources, then runs them.
    ///
    /// In serial mode the copies run here, in submission order, and the first failure is
    /// returned. In parallel mode the workers are only started. Copies left over from a
    /// previous run are deleted first, and every copy is deleted again when kickoff fails.
    fn kickoff(&mut self) -> SirepoResult<Status> {
        if self.connection.sim_type()? != SimType::Srw {
            return Err(SirepoError::Precondition(
                "the multi-copy flyer runs SRW watchpoints only".to_string(),
            ));
        }
        self.reset();
        if let Err(err) = self.create_copies() {
            self.discard_copies();
            return Err(err);
        }
        self.statuses = vec![None; self.copies.len()];

        if self.options.run_parallel {
            let jobs: Vec<_> = self
                .copies
                .iter()
                .map(|copy| {
                    let client = copy.client.clone();
                    move || Self::run_copy(&client)
                })
                .collect();
            self.pool = Some(WorkerPool::spawn(jobs, self.options.max_workers));
            log::info!("started {} workers", self.copies.len());
        } else {
            for index in 0..self.copies.len() {
                let result = Self::run_copy(&self.copies[index].client);
                self.record_status(index, &result);
                if let Err(err) = result {
                    self.discard_copies();
                    return Err(err);
                }
            }
        }
        Ok(Status::done())
    }

    /// Joins the workers (in parallel mode) and mints one datum per copy.
    ///
    /// When any copy failed, every copy is deleted and the first failure is returned.
    fn complete(&mut self) -> SirepoResult<Status> {
        if let Some(pool) = self.pool.take() {
            let results = match pool.join() {
                Ok(results) => results,
                Err(err) => {
                    self.discard_copies();
                    return Err(err);
                }
            };
            for (index, result) in results.iter().enumerate() {
                self.record_status(index, result);
            }
            if let Some(err) = results.into_iter().find_map(Result::err) {
                self.discard_copies();
                return Err(err);
            }
        }
        for copy in self.copies.iter_mut() {
            let datum = copy.datum_factory.mint(Map::new());
            self.datum_ids.push(datum.datum_id.clone());
            self.asset_docs.push_back(AssetDoc::Datum(datum));
        }
        Ok(Status::done())
    }

    fn describe_collect(&self) -> SirepoResult<IndexMap<String, IndexMap<String, DataKey>>> {
        let mut keys = IndexMap::new();
        let image = self.data_key("image");
        // The image shape is only known once a result is parsed.
        keys.insert(
            image.clone(),
            DataKey::external(&image, "FILESTORE:", Vec::new(), "<f8"),
        );
        for (suffix, dtype, shape) in [
            ("shape", "array", vec![2]),
            ("mean", "number", vec![]),
            ("photon_energy", "number", vec![]),
            ("horizontal_extent", "array", vec![2]),
            ("vertical_extent", "array", vec![2]),
            ("hash_value", "string", vec![]),
            ("status", "string", vec![]),
        ] {
            let key = self.data_key(suffix);
            keys.insert(key.clone(), column_key(&key, dtype, shape));
        }
        for delta in &self.params_to_change {
            for (title, params) in delta {
                for param in params.keys() {
                    let key = self.data_key(&format!("{}_{}", title, param));
                    keys.insert(key.clone(), column_key(&key, "number", vec![]));
                }
            }
        }
        let mut described = IndexMap::new();
        described.insert(self.name.clone(), keys);
        Ok(described)
    }

    /// Fetches, stores, parses and hashes every copy's result, deletes the copies and yields one
    /// row per copy in submission order.
    ///
    /// # Errors
    ///
    /// [`SirepoError::InternalConsistency`] if the number of datums minted by `complete` differs
    /// from the number of copies, plus the errors of fetching, parsing and deleting.
    fn collect(&mut self) -> SirepoResult<Vec<FlyerEvent>> {
        if self.datum_ids.len() != self.copies.len() {
            return Err(SirepoError::InternalConsistency(format!(
                "{} datums for {} copies",
                self.datum_ids.len(),
                self.copies.len()
            )));
        }
        let events = match self.collect_rows() {
            Ok(events) => events,
            Err(err) => {
                self.discard_copies();
                return Err(err);
            }
        };
        if events.len() != self.copies.len() {
            return Err(SirepoError::InternalConsistency(format!(
                "{} rows for {} copies",
                events.len(),
                self.copies.len()
            )));
        }
        self.copies.clear();
        self.datum_ids.clear();
        Ok(events)
    }
}
