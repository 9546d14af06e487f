//! The remote job client: one session with the simulation service and the document it loaded.
//!
//! A [`SirepoClient`] owns the [`DocumentHandle`] that every synthesized signal binds into, so
//! the client is always handed around behind an `Arc`. Its session state (simulation id, schema,
//! whether it is a server-side copy) sits behind a lock and every method takes `&self`; a client
//! can therefore be moved onto a worker thread, which is how the flyers run copies in parallel.
//!
//! Lifecycle:
//!
//! 1. [`SirepoClient::authenticate`] performs the login handshake and loads the document.
//! 2. Devices write parameters into the document, a report name is selected, and
//!    [`SirepoClient::run`] submits the document and polls until a terminal state.
//! 3. [`SirepoClient::fetch_result`] downloads the artifact of the selected report.
//!
//! [`SirepoClient::clone_simulation`] and [`SirepoClient::delete_clone`] manage server-side
//! copies with independent documents.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use parking_lot::RwLock;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Map, Value as Json};
use sha2::{Digest, Sha256};

use crate::config::SirepoConfig;
use crate::document::*;
use crate::error::*;
use crate::transport::*;
use crate::utils::*;

/// Stateless computations the service offers for individual optical elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RecomputeKind {
    GrazingOrientation,
    CrlCharacteristics,
    CrystalOrientation,
}

const GRAZING_FIELDS: [&str; 5] = [
    "normalVectorX",
    "normalVectorY",
    "normalVectorZ",
    "tangentialVectorX",
    "tangentialVectorY",
];

const CRL_FIELDS: [&str; 2] = ["absoluteFocusPosition", "focalDistance"];

const CRYSTAL_FIELDS: [&str; 18] = [
    "dSpacing",
    "grazingAngle",
    "nvx",
    "nvy",
    "nvz",
    "outframevx",
    "outframevy",
    "outoptvx",
    "outoptvy",
    "outoptvz",
    "psi0i",
    "psi0r",
    "psiHBi",
    "psiHBr",
    "psiHi",
    "psiHr",
    "tvx",
    "tvy",
];

const GRAZING_MIRRORS: [&str; 3] = ["sphericalMirror", "toroidalMirror", "ellipsoidMirror"];

impl RecomputeKind {
    /// Name of the `stateless-compute` method.
    pub fn method(&self) -> &'static str {
        match self {
            RecomputeKind::GrazingOrientation => "compute_grazing_orientation",
            RecomputeKind::CrlCharacteristics => "compute_crl_characteristics",
            RecomputeKind::CrystalOrientation => "compute_crystal_orientation",
        }
    }

    /// Sibling fields overwritten with the values the computation returns.
    pub fn dependent_fields(&self) -> &'static [&'static str] {
        match self {
            RecomputeKind::GrazingOrientation => &GRAZING_FIELDS,
            RecomputeKind::CrlCharacteristics => &CRL_FIELDS,
            RecomputeKind::CrystalOrientation => &CRYSTAL_FIELDS,
        }
    }

    /// The recomputation a write to `field` of an element of type `element_type` requires.
    ///
    /// Grazing mirrors recompute on their grazing angle only. CRLs and crystals recompute on
    /// every field except the ones the computation itself produces.
    pub fn for_field(element_type: &str, field: &str) -> Option<Self> {
        match element_type {
            t if GRAZING_MIRRORS.contains(&t) && field == "grazingAngle" => {
                Some(RecomputeKind::GrazingOrientation)
            }
            "crl" if !CRL_FIELDS.contains(&field) => Some(RecomputeKind::CrlCharacteristics),
            "crystal" if !CRYSTAL_FIELDS.contains(&field) => {
                Some(RecomputeKind::CrystalOrientation)
            }
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct Session {
    sim_type: Option<SimType>,
    sim_id: Option<String>,
    schema: Option<Arc<Json>>,
    is_copy: bool,
    has_run: bool,
}

pub struct SirepoClient {
    transport: Arc<dyn Transport>,
    secret: String,
    max_status_calls: usize,
    session: RwLock<Session>,
    document: DocumentHandle,
}

/// `<unix seconds>-<32 base62 characters>`, the nonce of the login handshake.
pub fn auth_nonce() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let salt: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    format!("{}-{}", secs, salt)
}

/// `v1:` followed by the URL-safe base64 SHA-256 of `nonce:sim_type:sim_id:secret`.
pub fn auth_hash(nonce: &str, sim_type: &str, sim_id: &str, secret: &str) -> String {
    let digest = Sha256::digest([nonce, sim_type, sim_id, secret].join(":").as_bytes());
    format!("v1:{}", URL_SAFE.encode(digest))
}

fn check_state(endpoint: &str, res: &Json) -> SirepoResult<()> {
    match res.get("state").and_then(Json::as_str) {
        Some("ok") => Ok(()),
        Some(state) => Err(SirepoError::Remote {
            endpoint: endpoint.to_string(),
            state: state.to_string(),
        }),
        None => Err(SirepoError::Protocol(format!("{} response has no state", endpoint))),
    }
}

impl SirepoClient {
    pub fn new(transport: Arc<dyn Transport>, secret: &str) -> Self {
        Self {
            transport,
            secret: secret.to_string(),
            max_status_calls: SirepoConfig::default().max_status_calls,
            session: RwLock::new(Session::default()),
            document: SimDocument::empty().into_handle(),
        }
    }

    /// Client talking HTTP to `config.server` with `config.secret`.
    pub fn from_config(config: &SirepoConfig) -> SirepoResult<Self> {
        let transport = HttpTransport::from_config(config)?;
        Ok(Self::new(Arc::new(transport), &config.secret).with_max_status_calls(config.max_status_calls))
    }

    pub fn with_max_status_calls(mut self, max_status_calls: usize) -> Self {
        self.max_status_calls = max_status_calls;
        self
    }

    // FIELD methods
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
    pub fn document(&self) -> &DocumentHandle {
        &self.document
    }
    pub fn max_status_calls(&self) -> usize {
        self.max_status_calls
    }
    pub fn sim_id(&self) -> Option<String> {
        self.session.read().sim_id.clone()
    }
    pub fn is_copy(&self) -> bool {
        self.session.read().is_copy
    }
    pub fn schema(&self) -> Option<Arc<Json>> {
        self.session.read().schema.clone()
    }
    pub fn is_authenticated(&self) -> bool {
        self.session.read().sim_type.is_some()
    }

    /// The simulation type of the loaded simulation; fails before authentication.
    pub fn sim_type(&self) -> SirepoResult<SimType> {
        self.session.read().sim_type.ok_or_else(|| {
            SirepoError::Precondition("authenticate before using the client".to_string())
        })
    }

    fn require_sim_id(&self) -> SirepoResult<String> {
        self.sim_type()?;
        self.sim_id().ok_or_else(|| {
            SirepoError::Precondition("the client has no current simulation id".to_string())
        })
    }

    /// Logs in to `sim_id` of `sim_type` and loads its document.
    ///
    /// Returns a copy of the loaded document together with the service schema. A state other
    /// than "ok" is reported as [`SirepoError::Authentication`].
    pub fn authenticate(&self, sim_type: &str, sim_id: &str) -> SirepoResult<(Json, Arc<Json>)> {
        let parsed: SimType = sim_type.parse()?;
        let nonce = auth_nonce();
        let payload = json!({
            "simulationType": sim_type,
            "simulationId": sim_id,
            "authNonce": nonce,
            "authHash": auth_hash(&nonce, sim_type, sim_id, &self.secret),
        });
        let res = self.transport.post_json("auth-bluesky-login", &payload)?;
        let state = res.get("state").and_then(Json::as_str).unwrap_or("missing");
        if state != "ok" {
            return Err(SirepoError::Authentication {
                sim_type: sim_type.to_string(),
                sim_id: sim_id.to_string(),
                reason: format!("login returned state '{}'", state),
            });
        }
        let data = require(&res, "data", "login response")?.clone();
        let schema = Arc::new(res.get("schema").cloned().unwrap_or(Json::Null));

        *self.document.write() = SimDocument::new(data.clone());
        *self.session.write() = Session {
            sim_type: Some(parsed),
            sim_id: Some(sim_id.to_string()),
            schema: Some(schema.clone()),
            is_copy: false,
            has_run: false,
        };
        log::info!(
            "authenticated {}/{} at {}",
            sim_type,
            sim_id,
            self.transport.describe()
        );
        Ok((data, schema))
    }

    /// Asks the service to copy the current simulation under `name`.
    ///
    /// The returned client shares this client's transport (and therefore its session cookie),
    /// secret and schema, but holds its own document loaded from the copy.
    pub fn clone_simulation(&self, name: &str) -> SirepoResult<SirepoClient> {
        let sim_id = self.require_sim_id()?;
        let sim_type = self.sim_type()?;
        let folder = self
            .document
            .read()
            .as_json()
            .pointer("/models/simulation/folder")
            .cloned()
            .unwrap_or_else(|| json!("/"));
        let payload = json!({
            "simulationId": sim_id,
            "simulationType": sim_type.as_str(),
            "folder": folder,
            "name": name,
        });
        let res = self.transport.post_json("copy-simulation", &payload)?;
        if let Some(state) = res.get("state").and_then(Json::as_str) {
            if state != "ok" {
                return Err(SirepoError::Remote {
                    endpoint: "copy-simulation".to_string(),
                    state: state.to_string(),
                });
            }
        }
        let copy_id = res
            .pointer("/models/simulation/simulationId")
            .and_then(Json::as_str)
            .ok_or_else(|| {
                SirepoError::Protocol("copy-simulation response has no simulationId".to_string())
            })?
            .to_string();
        log::info!("copied simulation {} to {} ('{}')", sim_id, copy_id, name);

        let session = Session {
            sim_type: Some(sim_type),
            sim_id: Some(copy_id),
            schema: self.schema(),
            is_copy: true,
            has_run: false,
        };
        Ok(SirepoClient {
            transport: self.transport.clone(),
            secret: self.secret.clone(),
            max_status_calls: self.max_status_calls,
            session: RwLock::new(session),
            document: SimDocument::new(res).into_handle(),
        })
    }

    /// Deletes the server-side copy this client represents and forgets its simulation id.
    pub fn delete_clone(&self) -> SirepoResult<()> {
        if !self.is_copy() {
            return Err(SirepoError::Precondition(
                "only a copied simulation can be deleted".to_string(),
            ));
        }
        let sim_id = self.require_sim_id()?;
        let payload = json!({
            "simulationId": sim_id,
            "simulationType": self.sim_type()?.as_str(),
        });
        let res = self.transport.post_json("delete-simulation", &payload)?;
        check_state("delete-simulation", &res)?;
        let mut session = self.session.write();
        session.sim_id = None;
        session.has_run = false;
        log::info!("deleted simulation copy {}", sim_id);
        Ok(())
    }

    /// Runs the selected report and polls until the service reports a terminal state.
    ///
    /// The submission counts as the first of at most `max_poll_attempts` calls. Between calls the
    /// client sleeps exactly the `nextRequestSeconds` the service asked for. Returns the final
    /// status response and the wall time spent.
    ///
    /// # Errors
    ///
    /// * [`SirepoError::Precondition`] without authentication, simulation id or selected report.
    /// * [`SirepoError::SimulationFailed`] when the terminal state is "error".
    /// * [`SirepoError::PollBudgetExhausted`] when the budget runs out first.
    pub fn run(&self, max_poll_attempts: usize) -> SirepoResult<(Json, Duration)> {
        let sim_id = self.require_sim_id()?;
        if max_poll_attempts == 0 {
            return Err(SirepoError::Precondition(
                "max_poll_attempts must be at least 1".to_string(),
            ));
        }
        let payload = {
            let doc = self.document.read();
            let report = doc.report().ok_or_else(|| {
                SirepoError::Precondition("select a report before running".to_string())
            })?;
            log::info!("running {} of simulation {}", report, sim_id);
            let mut payload = doc.as_json().clone();
            let root = payload.as_object_mut().ok_or_else(|| {
                SirepoError::SchemaMismatch("simulation document is not a mapping".to_string())
            })?;
            root.insert("simulationId".to_string(), json!(sim_id));
            root.insert("forceRun".to_string(), json!(true));
            payload
        };

        let started = std::time::Instant::now();
        let mut res = self.transport.post_json("run-simulation", &payload)?;
        let mut calls = 1;
        loop {
            let state = require(&res, "state", "run status")?
                .as_str()
                .unwrap_or_default()
                .to_string();
            match state.as_str() {
                "completed" => break,
                "error" => {
                    let detail = res
                        .get("error")
                        .and_then(Json::as_str)
                        .unwrap_or("no detail given")
                        .to_string();
                    return Err(SirepoError::SimulationFailed { state, detail });
                }
                _ => {}
            }
            if calls >= max_poll_attempts {
                return Err(SirepoError::PollBudgetExhausted {
                    attempts: calls,
                    state,
                });
            }
            let wait = require(&res, "nextRequestSeconds", "run status")?;
            let wait = json_f64(wait).ok_or_else(|| {
                SirepoError::Protocol(format!("nextRequestSeconds is not a number: {}", wait))
            })?;
            let next = require(&res, "nextRequest", "run status")?.clone();
            log::debug!("{} is {}, polling again in {}s", sim_id, state, wait);
            thread::sleep(Duration::from_secs_f64(wait.max(0.)));
            res = self.transport.post_json("run-status", &next)?;
            calls += 1;
        }
        let elapsed = started.elapsed();
        self.session.write().has_run = true;
        log::info!(
            "simulation {} completed after {} status calls in {:.3}s",
            sim_id,
            calls,
            elapsed.as_secs_f64()
        );
        Ok((res, elapsed))
    }

    /// [`SirepoClient::run`] with the configured status-call budget.
    pub fn run_default(&self) -> SirepoResult<(Json, Duration)> {
        self.run(self.max_status_calls)
    }

    /// Downloads result file `file_index` of the selected report; `-1` is the main artifact.
    pub fn fetch_result(&self, file_index: i64) -> SirepoResult<Vec<u8>> {
        let sim_id = self.require_sim_id()?;
        if !self.session.read().has_run {
            return Err(SirepoError::Precondition(
                "run the simulation before fetching results".to_string(),
            ));
        }
        let report = self
            .document
            .read()
            .report()
            .map(str::to_string)
            .ok_or_else(|| SirepoError::Precondition("no report selected".to_string()))?;
        let endpoint = format!(
            "download-data-file/{}/{}/{}/{}",
            self.sim_type()?,
            sim_id,
            report,
            file_index
        );
        self.transport.get_bytes(&endpoint)
    }

    /// First element of `elements` whose `field` equals `value`.
    pub fn find_element_by_name<'a>(
        elements: &'a [Json],
        field: &str,
        value: &Json,
    ) -> SirepoResult<&'a Json> {
        elements
            .iter()
            .find(|e| e.get(field) == Some(value))
            .ok_or_else(|| SirepoError::not_found(field, value))
    }

    /// Position of the element of `group` whose `field` equals `value`.
    pub fn find_element_index(&self, group: &str, field: &str, value: &Json) -> SirepoResult<usize> {
        self.document.read().element_index(group, field, value)
    }

    /// Position of the beamline optic titled `title`.
    pub fn find_optic_id_by_name(&self, title: &str) -> SirepoResult<usize> {
        let group = self.sim_type()?.dialect().element_group;
        self.find_element_index(group, "title", &json!(title))
    }

    /// Calls the `stateless-compute` method of `kind` on `element` and returns the response.
    pub fn recompute(&self, kind: RecomputeKind, element: &Map<String, Json>) -> SirepoResult<Json> {
        let sim_id = self.require_sim_id()?;
        let payload = json!({
            "method": kind.method(),
            "optical_element": element,
            "simulationId": sim_id,
            "simulationType": self.sim_type()?.as_str(),
        });
        let res = self.transport.post_json("stateless-compute", &payload)?;
        check_state("stateless-compute", &res)?;
        log::debug!("{} returned for element {:?}", kind.method(), element.get("title"));
        Ok(res)
    }

    /// Lists the simulations of the authenticated simulation type.
    pub fn simulation_list(&self) -> SirepoResult<Json> {
        let payload = json!({ "simulationType": self.sim_type()?.as_str() });
        self.transport.post_json("simulation-list", &payload)
    }
}

#[cfg(test)]
mod test {
    mod handshake {
        use crate::client::*;

        #[test]
        fn nonce_shape() {
            let nonce = auth_nonce();
            let (secs, salt) = nonce.split_once('-').unwrap();
            assert!(secs.parse::<u64>().is_ok());
            assert_eq!(salt.len(), 32);
            assert!(salt.chars().all(|c| c.is_ascii_alphanumeric()));
        }

        #[test]
        fn hash_is_versioned_and_deterministic() {
            let a = auth_hash("1-abc", "srw", "00000000", "bluesky");
            let b = auth_hash("1-abc", "srw", "00000000", "bluesky");
            let c = auth_hash("1-abc", "srw", "00000000", "other");
            assert_eq!(a, b);
            assert_ne!(a, c);
            assert!(a.starts_with("v1:"));
            // 32 digest bytes encode to 44 padded base64 characters
            assert_eq!(a.len(), 3 + 44);
        }
    }

    mod recompute_kinds {
        use crate::client::*;

        #[test]
        fn dispatch_table() {
            assert_eq!(
                RecomputeKind::for_field("toroidalMirror", "grazingAngle"),
                Some(RecomputeKind::GrazingOrientation)
            );
            assert_eq!(RecomputeKind::for_field("toroidalMirror", "position"), None);
            assert_eq!(
                RecomputeKind::for_field("crl", "numberOfLenses"),
                Some(RecomputeKind::CrlCharacteristics)
            );
            assert_eq!(RecomputeKind::for_field("crl", "focalDistance"), None);
            assert_eq!(
                RecomputeKind::for_field("crystal", "energy"),
                Some(RecomputeKind::CrystalOrientation)
            );
            assert_eq!(RecomputeKind::for_field("crystal", "psiHBr"), None);
            assert_eq!(RecomputeKind::for_field("aperture", "grazingAngle"), None);
        }
    }
}
