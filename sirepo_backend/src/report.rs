//! Report devices: watchpoints and single-electron spectra.
//!
//! This module extends [`Device`] with the scheduler lifecycle through the [`ReportDevice`]
//! trait. Plain element devices implement it trivially (staging does nothing, `trigger`
//! completes immediately); devices synthesized from report elements carry a [`ReportState`] and
//! run the simulation on trigger:
//!
//! 1. **stage**: a result location `<root>/<%Y/%m/%d>/<uuid>` and its resource document are
//!    created and a NaN frame buffer of the configured image shape is allocated.
//! 2. **trigger**: the device's report is selected and run, the artifact fetched, written to
//!    `<stem>_<simtype>_<frame:04>.dat`, parsed, and its statistics written to the output
//!    signals. A datum referencing the frame is minted and published through `image`. Last, the
//!    JSON snapshot of the whole document and its hash are recorded.
//! 3. **unstage**: the location, resource and buffer are released.
//!
//! A failed trigger leaves the device staged; the scheduler is expected to unstage it.

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use ndarray::{ArrayD, Ix2};
use serde_json::{json, Map, Value as Json};

use crate::asset::*;
use crate::config::SirepoConfig;
use crate::device::*;
use crate::document::{id_key, SimType};
use crate::error::*;
use crate::reader::*;
use crate::signal::*;
use crate::utils::*;

pub const SPECTRUM_REPORT: &str = "intensityReport";

/// Output location and parsing settings shared by the report devices of a beamline.
#[derive(Clone)]
pub struct ReportConfig {
    pub root_dir: PathBuf,
    pub image_shape: (usize, usize),
    /// Reader used for every simulation type; `None` selects the bundled reader.
    pub reader: Option<Arc<dyn ResultReader>>,
}

impl fmt::Debug for ReportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportConfig")
            .field("root_dir", &self.root_dir)
            .field("image_shape", &self.image_shape)
            .field("reader", &self.reader.as_ref().map(|_| "injected"))
            .finish()
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self::from(&SirepoConfig::default())
    }
}

impl From<&SirepoConfig> for ReportConfig {
    fn from(config: &SirepoConfig) -> Self {
        Self {
            root_dir: config.root_dir.clone(),
            image_shape: (config.image_shape[0], config.image_shape[1]),
            reader: None,
        }
    }
}

impl ReportConfig {
    pub fn with_reader(mut self, reader: Arc<dyn ResultReader>) -> Self {
        self.reader = Some(reader);
        self
    }

    /// The injected reader, or the bundled one for `sim_type`.
    pub fn reader_for(&self, sim_type: SimType) -> SirepoResult<Arc<dyn ResultReader>> {
        match (&self.reader, sim_type) {
            (Some(reader), _) => Ok(reader.clone()),
            (None, SimType::Srw) => Ok(Arc::new(SrwAsciiReader)),
            (None, other) => Err(SirepoError::Config(format!(
                "no result reader registered for {} reports",
                other
            ))),
        }
    }
}

/// Staging and asset bookkeeping of one report device.
pub struct ReportState {
    config: ReportConfig,
    sim_type: SimType,
    staged: bool,
    counter: usize,
    stem: Option<PathBuf>,
    resource: Option<ResourceDoc>,
    datum_factory: Option<DatumFactory>,
    frames: Option<FrameBuffer>,
    last_data: Option<ArrayD<f64>>,
    asset_docs: VecDeque<AssetDoc>,
}

impl ReportState {
    pub fn new(config: ReportConfig, sim_type: SimType) -> Self {
        Self {
            config,
            sim_type,
            staged: false,
            counter: 0,
            stem: None,
            resource: None,
            datum_factory: None,
            frames: None,
            last_data: None,
            asset_docs: VecDeque::new(),
        }
    }

    /// Output signals of a report device and their values before the first trigger.
    pub fn output_fields() -> Vec<(&'static str, Json)> {
        let mut fields: Vec<(&'static str, Json)> = [
            "image",
            "shape",
            "flux",
            "mean",
            "x",
            "y",
            "fwhm_x",
            "fwhm_y",
            "photon_energy",
            "horizontal_extent",
            "vertical_extent",
        ]
        .into_iter()
        .map(|f| (f, Json::Null))
        .collect();
        fields.push(("sirepo_data_json", json!("")));
        fields.push(("sirepo_data_hash", json!("")));
        fields.push(("duration", json!(-1.0)));
        fields
    }

    pub fn config(&self) -> &ReportConfig {
        &self.config
    }
    pub fn is_staged(&self) -> bool {
        self.staged
    }
    pub fn frames(&self) -> Option<&FrameBuffer> {
        self.frames.as_ref()
    }
    /// Parsed data of the most recent trigger, before any resampling.
    pub fn last_data(&self) -> Option<&ArrayD<f64>> {
        self.last_data.as_ref()
    }

    fn spec(&self) -> String {
        self.sim_type.as_str().to_uppercase()
    }

    fn push_resource(&mut self, resource: ResourceDoc) {
        self.asset_docs.push_back(AssetDoc::Resource(resource.clone()));
        self.resource = Some(resource);
    }

    /// Records a resource kwarg on the current resource and on its queued copy.
    fn set_resource_kwarg(&mut self, key: &str, value: Json) {
        if let Some(resource) = self.resource.as_mut() {
            resource.resource_kwargs.insert(key.to_string(), value.clone());
            for doc in self.asset_docs.iter_mut() {
                if let AssetDoc::Resource(queued) = doc {
                    if queued.uid == resource.uid {
                        queued.resource_kwargs.insert(key.to_string(), value.clone());
                    }
                }
            }
        }
    }

    fn mint_datum(&mut self, kwargs: Map<String, Json>) -> SirepoResult<String> {
        let factory = self.datum_factory.as_mut().ok_or_else(|| {
            SirepoError::Precondition("no resource to mint a datum for; stage first".to_string())
        })?;
        let datum = factory.mint(kwargs);
        let id = datum.datum_id.clone();
        self.asset_docs.push_back(AssetDoc::Datum(datum));
        Ok(id)
    }
}

fn json_usize(value: &Json, what: &str) -> SirepoResult<usize> {
    json_f64(value)
        .filter(|v| *v >= 0.)
        .map(|v| v as usize)
        .ok_or_else(|| SirepoError::SchemaMismatch(format!("{} is not a count: {}", what, value)))
}

pub trait ReportDevice: BaseDevice {
    fn report_state(&self) -> Option<&ReportState>;
    fn report_state_(&mut self) -> Option<&mut ReportState>;

    /// Report this device runs on trigger: `watchpointReport<id>` or the spectrum report.
    fn report_name(&self) -> SirepoResult<String> {
        match self.kind() {
            DeviceKind::Watchpoint => Ok(format!(
                "watchpointReport{}",
                id_key(&self.document_value("id")?)
            )),
            DeviceKind::SingleElectronSpectrum => Ok(SPECTRUM_REPORT.to_string()),
            _ => Err(SirepoError::Precondition(format!(
                "{} is not a report device",
                self.name()
            ))),
        }
    }

    fn stage(&mut self) -> SirepoResult<()> {
        let kind = self.kind();
        let name = self.name().to_string();
        let state = match self.report_state_() {
            Some(state) => state,
            None => return Ok(()),
        };
        if kind == DeviceKind::Watchpoint {
            let (relative, absolute) = new_result_stem(&state.config.root_dir)?;
            let (resource, factory) =
                compose_resource(&state.spec(), &state.config.root_dir, &relative, Map::new());
            state.push_resource(resource);
            state.datum_factory = Some(factory);
            state.stem = Some(absolute);
            state.frames = Some(FrameBuffer::new(state.config.image_shape));
        }
        state.counter = 0;
        state.staged = true;
        log::debug!("staged {}", name);
        Ok(())
    }

    /// Runs the device's report and publishes the result.
    ///
    /// Plain devices complete immediately. Any error of the remote run or the parse is returned
    /// as is; the device stays staged.
    fn trigger(&mut self) -> SirepoResult<Status> {
        match self.kind() {
            DeviceKind::Watchpoint => trigger_watchpoint(self),
            DeviceKind::SingleElectronSpectrum => trigger_spectrum(self),
            _ => Ok(Status::done()),
        }
    }

    fn unstage(&mut self) -> SirepoResult<()> {
        if let Some(state) = self.report_state_() {
            state.staged = false;
            state.stem = None;
            state.resource = None;
            state.datum_factory = None;
            state.frames = None;
        }
        Ok(())
    }

    fn read(&self) -> IndexMap<String, Reading> {
        self.read_signals()
    }

    /// Signal metadata; report devices describe `image` as external data of the report's shape.
    fn describe(&self) -> SirepoResult<IndexMap<String, DataKey>> {
        let mut keys = self.describe_signals();
        let state = match self.report_state() {
            Some(state) => state,
            None => return Ok(keys),
        };
        let report = self.report_name()?;
        let shape = {
            let doc = self.connection().document().read();
            match state.sim_type {
                SimType::Srw if report.starts_with("watchpointReport")
                    || report == "initialIntensityReport" =>
                {
                    vec![state.config.image_shape.0, state.config.image_shape.1]
                }
                SimType::Srw if report == SPECTRUM_REPORT => {
                    let points = doc.group(SPECTRUM_REPORT)?.get("photonEnergyPointCount");
                    vec![json_usize(points.unwrap_or(&Json::Null), "photonEnergyPointCount")?]
                }
                SimType::Shadow => {
                    let bins = doc.group(&report)?.get("histogramBins");
                    let bins = json_usize(bins.unwrap_or(&Json::Null), "histogramBins")?;
                    vec![bins, bins]
                }
                _ => return Err(SirepoError::UnknownReport(report)),
            }
        };

        let image = self.signal_name("image");
        keys.insert(
            image,
            DataKey::external(&format!("SIM:{}", report), "FILESTORE:", shape, "<f8"),
        );
        if let Some(key) = keys.get_mut(&self.signal_name("shape")) {
            key.dtype = "array".to_string();
            key.dtype_str = Some("<i8".to_string());
        }
        for field in ["horizontal_extent", "vertical_extent"] {
            if let Some(key) = keys.get_mut(&self.signal_name(field)) {
                key.dtype = "array".to_string();
                key.shape = vec![2];
                key.dtype_str = Some("<f8".to_string());
            }
        }
        Ok(keys)
    }

    /// Drains the resource and datum documents produced since the last call.
    fn collect_asset_docs(&mut self) -> Vec<AssetDoc> {
        match self.report_state_() {
            Some(state) => state.asset_docs.drain(..).collect(),
            None => Vec::new(),
        }
    }
}

impl ReportDevice for Device {
    fn report_state(&self) -> Option<&ReportState> {
        self.report()
    }
    fn report_state_(&mut self) -> Option<&mut ReportState> {
        self.report_()
    }
}

/// Selects `report`, runs it and returns the raw artifact and the run duration in seconds.
fn run_report<D: ReportDevice + ?Sized>(device: &D, report: &str) -> SirepoResult<(Vec<u8>, f64)> {
    let connection = device.connection();
    connection.document().write().set_report(report);
    let (_, duration) = connection.run_default()?;
    let raw = connection.fetch_result(-1)?;
    Ok((raw, duration.as_secs_f64()))
}

/// Writes the parsed statistics to the output signals.
fn publish_result<D: ReportDevice + ?Sized>(device: &mut D, parsed: &ParsedResult) -> SirepoResult<()> {
    let stats = match parsed.beam_stats() {
        Ok(stats) => stats,
        Err(_) => BeamStats {
            x: f64::NAN,
            y: f64::NAN,
            fwhm_x: f64::NAN,
            fwhm_y: f64::NAN,
            flux: parsed.flux.unwrap_or_else(|| parsed.data.sum()),
            mean: parsed.mean,
        },
    };
    let outputs = [
        ("shape", json!(parsed.shape)),
        ("flux", f64_json(stats.flux)),
        ("mean", f64_json(parsed.mean)),
        ("x", f64_json(stats.x)),
        ("y", f64_json(stats.y)),
        ("fwhm_x", f64_json(stats.fwhm_x)),
        ("fwhm_y", f64_json(stats.fwhm_y)),
        ("photon_energy", parsed.photon_energy.clone()),
        ("horizontal_extent", json!(parsed.horizontal_extent)),
        ("vertical_extent", json!(parsed.vertical_extent)),
    ];
    write_outputs(device, outputs)
}

fn write_outputs<D, I>(device: &mut D, outputs: I) -> SirepoResult<()>
where
    D: ReportDevice + ?Sized,
    I: IntoIterator<Item = (&'static str, Json)>,
{
    let document = device.connection().document().clone();
    for (field, value) in outputs {
        device.sig_(field)?.write(&document, value)?;
    }
    Ok(())
}

/// Records the JSON snapshot of the document and its hash.
fn publish_snapshot<D: ReportDevice + ?Sized>(device: &mut D) -> SirepoResult<()> {
    let (json, hash) = device.connection().document().read().snapshot()?;
    write_outputs(
        device,
        [("sirepo_data_json", json!(json)), ("sirepo_data_hash", json!(hash))],
    )
}

fn trigger_watchpoint<D: ReportDevice + ?Sized>(device: &mut D) -> SirepoResult<Status> {
    log::debug!("custom trigger for {}", device.name());
    let report = device.report_name()?;
    let (frame, stem, sim_type, image_shape, reader) = {
        let state = device.report_state_().ok_or_else(|| {
            SirepoError::InternalConsistency("watchpoint without report state".to_string())
        })?;
        let stem = match (&state.stem, state.staged) {
            (Some(stem), true) => stem.clone(),
            _ => {
                return Err(SirepoError::Precondition(
                    "stage the watchpoint before triggering it".to_string(),
                ))
            }
        };
        let frame = state.counter;
        state.counter += 1;
        let reader = state.config.reader_for(state.sim_type)?;
        (frame, stem, state.sim_type, state.config.image_shape, reader)
    };

    let (raw, duration) = run_report(device, &report)?;
    write_outputs(device, [("duration", f64_json(duration))])?;
    let result_file = with_suffix(&stem, &format!("_{}_{:04}.dat", sim_type, frame));
    fs::write(&result_file, &raw)?;

    let parsed = match sim_type {
        SimType::Srw => {
            let parsed = reader.read(&raw, &ReadOptions::image())?;
            let image = parsed
                .data
                .view()
                .into_dimensionality::<Ix2>()
                .map_err(|e| SirepoError::Parse(e.to_string()))?;
            let frame_data = resize_bilinear(image, image_shape);
            if let Some(frames) = device.report_state_().and_then(|s| s.frames.as_mut()) {
                frames.store(frame, frame_data.view())?;
            }
            parsed
        }
        SimType::Shadow => {
            let bins = {
                let doc = device.connection().document().read();
                let bins = doc.group(&report)?.get("histogramBins").cloned();
                json_usize(&bins.unwrap_or(Json::Null), "histogramBins")?
            };
            let parsed = reader.read(
                &raw,
                &ReadOptions {
                    ndim: 2,
                    histogram_bins: Some(bins),
                },
            )?;
            if let Some(state) = device.report_state_() {
                state.set_resource_kwarg("histogram_bins", json!(bins));
            }
            parsed
        }
        SimType::Madx => return Err(SirepoError::UnknownReport(report)),
    };
    publish_result(device, &parsed)?;

    let datum_id = {
        let state = device.report_state_().ok_or_else(|| {
            SirepoError::InternalConsistency("watchpoint without report state".to_string())
        })?;
        state.last_data = Some(parsed.data);
        let mut kwargs = Map::new();
        kwargs.insert("frame".to_string(), json!(frame));
        state.mint_datum(kwargs)?
    };
    write_outputs(device, [("image", json!(datum_id))])?;
    log::debug!("report for {}: {}", device.name(), report);

    publish_snapshot(device)?;
    Ok(Status::done())
}

fn trigger_spectrum<D: ReportDevice + ?Sized>(device: &mut D) -> SirepoResult<Status> {
    log::debug!("custom trigger for {}", device.name());
    let (root_dir, sim_type, reader, spec) = {
        let state = device.report_state_().ok_or_else(|| {
            SirepoError::InternalConsistency("spectrum without report state".to_string())
        })?;
        (
            state.config.root_dir.clone(),
            state.sim_type,
            state.config.reader_for(state.sim_type)?,
            state.sim_type.as_str().to_string(),
        )
    };
    if sim_type != SimType::Srw {
        return Err(SirepoError::UnknownReport(SPECTRUM_REPORT.to_string()));
    }

    let (relative, absolute) = new_result_stem(&root_dir)?;
    let relative = with_suffix(&relative, ".dat");
    let (resource, factory) = compose_resource(&spec, &root_dir, &relative, Map::new());
    if let Some(state) = device.report_state_() {
        state.push_resource(resource);
        state.datum_factory = Some(factory);
    }

    let (raw, duration) = run_report(device, SPECTRUM_REPORT)?;
    write_outputs(device, [("duration", f64_json(duration))])?;
    fs::write(with_suffix(&absolute, ".dat"), &raw)?;

    let options = ReadOptions::spectrum();
    let parsed = reader.read(&raw, &options)?;
    publish_result(device, &parsed)?;

    let datum_id = {
        let state = device.report_state_().ok_or_else(|| {
            SirepoError::InternalConsistency("spectrum without report state".to_string())
        })?;
        state.set_resource_kwarg("ndim", json!(options.ndim));
        state.last_data = Some(parsed.data);
        let datum_id = state.mint_datum(Map::new())?;
        state.resource = None;
        state.datum_factory = None;
        datum_id
    };
    write_outputs(device, [("image", json!(datum_id))])?;
    log::debug!("report for {}: {}", device.name(), SPECTRUM_REPORT);

    publish_snapshot(device)?;
    Ok(Status::done())
}

#[cfg(test)]
mod test {
    mod report {
        use crate::report::*;

        #[test]
        fn configs_are_printable() {
            let config = ReportConfig::default().with_reader(Arc::new(SrwAsciiReader));
            let printed = format!("{:?}", config);
            assert!(printed.contains("image_shape: (1024, 1024)"));
            assert!(printed.contains("Some(\"injected\")"));
            let options = crate::synthesis::SynthesisOptions::default();
            assert!(format!("{:?}", options).contains("ReportConfig"));
        }

        #[test]
        fn default_readers() {
            let config = ReportConfig::default();
            assert_eq!(config.image_shape, (1024, 1024));
            assert!(config.reader_for(SimType::Srw).is_ok());
            assert!(matches!(
                config.reader_for(SimType::Shadow),
                Err(SirepoError::Config(_))
            ));
            let injected = config.with_reader(Arc::new(SrwAsciiReader));
            assert!(injected.reader_for(SimType::Shadow).is_ok());
        }

        #[test]
        fn output_fields_of_reports() {
            let fields = ReportState::output_fields();
            let names: Vec<_> = fields.iter().map(|(n, _)| *n).collect();
            assert!(names.contains(&"image"));
            assert!(names.contains(&"sirepo_data_hash"));
            assert_eq!(fields.last().unwrap().1, json!(-1.0));
        }
    }
}
