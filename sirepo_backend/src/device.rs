//! Devices: named groups of signals synthesized from one element of the simulation document.
//!
//! ## Overview
//!
//! A [`Device`] corresponds to one beamline element (an aperture, a mirror, a watchpoint, a
//! lattice element...). Every parameter of the element becomes a [`Signal`] keyed by its field
//! name, and exposed to the scheduler as `<device>_<field>`. Devices are not written by hand:
//! the synthesis engine builds a [`DeviceClass`] per element, a description of the signal
//! kinds and document bindings, and instantiates it against a client.
//!
//! The behavior of devices is given by the [`BaseDevice`] trait: field accessors plus default
//! implementations of `get`, `set`, `put`, `read` and the recompute step of derived signals.
//! Report devices (watchpoints and spectra) additionally implement
//! [`ReportDevice`](crate::report::ReportDevice) for the stage/trigger/unstage lifecycle.
//!
//! ## Derived signals
//!
//! Writing a [`SignalKind::Derived`] signal first writes through to the document, then sends
//! the element to the service for recomputation and applies the returned values to a fixed set
//! of sibling signals as one [`RecomputeUpdate`]. The update is checked against the device before
//! anything is written, so a response that does not fit the device leaves it untouched.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value as Json;

use crate::client::{RecomputeKind, SirepoClient};
use crate::document::*;
use crate::error::*;
use crate::report::{ReportConfig, ReportState};
use crate::signal::*;

/// Base behavior of a synthesized device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Generic,
    Watchpoint,
    SingleElectronSpectrum,
    Propagation,
}

impl DeviceKind {
    pub fn is_report(&self) -> bool {
        matches!(self, DeviceKind::Watchpoint | DeviceKind::SingleElectronSpectrum)
    }
}

/// Sibling values returned by a recompute call, keyed by device field.
#[derive(Clone, Debug, PartialEq)]
pub struct RecomputeUpdate {
    pub kind: RecomputeKind,
    pub fields: IndexMap<String, Json>,
}

impl RecomputeUpdate {
    /// Extracts the dependent fields of `kind` from a `stateless-compute` response.
    ///
    /// The response echoes the whole element plus a `state` entry; only the fields the
    /// computation produces are kept. A response missing one of them is a schema mismatch.
    pub fn from_response(kind: RecomputeKind, response: &Json) -> SirepoResult<Self> {
        let mut fields = IndexMap::new();
        for field in kind.dependent_fields() {
            let value = response.get(*field).ok_or_else(|| {
                SirepoError::SchemaMismatch(format!(
                    "{} response has no '{}'",
                    kind.method(),
                    field
                ))
            })?;
            fields.insert(public_field_name(field).to_string(), value.clone());
        }
        Ok(Self { kind, fields })
    }
}

/// Signal of a device class before it is instantiated.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldSpec {
    pub field: String,
    pub kind: SignalKind,
    /// `None` for synthetic fields that exist only on the device.
    pub binding: Option<Binding>,
    pub value: Json,
}

/// Description of a synthesized device type: its name, base kind and signals.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceClass {
    class_name: String,
    kind: DeviceKind,
    fields: Vec<FieldSpec>,
}

impl DeviceClass {
    pub fn new(class_name: &str, kind: DeviceKind, fields: Vec<FieldSpec>) -> Self {
        Self {
            class_name: class_name.to_string(),
            kind,
            fields,
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.field.as_str()).collect()
    }

    /// Creates a device named `object_name` bound to `connection`'s document.
    ///
    /// Report kinds also receive their output signals and a fresh report state configured by
    /// `report`.
    pub fn instantiate(
        &self,
        object_name: &str,
        connection: Arc<SirepoClient>,
        report: &ReportConfig,
    ) -> SirepoResult<Device> {
        let sim_type = connection.sim_type()?;
        let mut device = Device::new(object_name, &self.class_name, self.kind, connection);
        for spec in &self.fields {
            device.add_signal(&spec.field, spec.kind, spec.binding.clone(), spec.value.clone());
        }
        if self.kind.is_report() {
            device.attach_report(ReportState::new(report.clone(), sim_type));
        }
        Ok(device)
    }
}

pub trait BaseDevice {
    // FIELD methods
    fn name(&self) -> &str;
    fn class_name(&self) -> &str;
    fn kind(&self) -> DeviceKind;
    fn connection(&self) -> &Arc<SirepoClient>;
    fn signals(&self) -> &IndexMap<String, Signal>;
    fn signals_(&mut self) -> &mut IndexMap<String, Signal>;

    /// Public name of the signal of `field`, `<device>_<field>`.
    fn signal_name(&self, field: &str) -> String {
        format!("{}_{}", self.name(), field)
    }

    fn component_names(&self) -> Vec<String> {
        self.signals().keys().cloned().collect()
    }

    fn has_signal(&self, field: &str) -> bool {
        self.signals().contains_key(field)
    }

    fn sig(&self, field: &str) -> SirepoResult<&Signal> {
        self.signals()
            .get(field)
            .ok_or_else(|| SirepoError::UnknownSignal {
                device: self.name().to_string(),
                field: field.to_string(),
            })
    }

    fn sig_(&mut self, field: &str) -> SirepoResult<&mut Signal> {
        let device = self.name().to_string();
        self.signals_()
            .get_mut(field)
            .ok_or_else(|| SirepoError::UnknownSignal {
                device,
                field: field.to_string(),
            })
    }

    /// Cached value of `field`.
    fn get(&self, field: &str) -> SirepoResult<Json> {
        Ok(self.sig(field)?.get().clone())
    }

    /// Value of `field` as it stands in the document right now, bypassing the cache.
    fn document_value(&self, field: &str) -> SirepoResult<Json> {
        let sig = self.sig(field)?;
        match sig.binding() {
            Some(binding) => self.connection().document().read().read(binding),
            None => Ok(sig.get().clone()),
        }
    }

    /// Writes `value` to `field`.
    ///
    /// Derived signals then recompute their element on the service and apply the result to
    /// their siblings before returning.
    ///
    /// # Errors
    ///
    /// [`SirepoError::ReadOnly`] for read-only signals, the client's errors for the recompute
    /// call, and [`SirepoError::SchemaMismatch`] when the response does not fit this device.
    fn set(&mut self, field: &str, value: Json) -> SirepoResult<Status> {
        let document = self.connection().document().clone();
        let (kind, slot) = {
            let sig = self.sig_(field)?;
            sig.set(&document, value)?;
            (sig.kind(), sig.binding().map(|b| b.slot.clone()))
        };
        if let SignalKind::Derived(recompute) = kind {
            let slot = slot.ok_or_else(|| {
                SirepoError::SchemaMismatch(format!("derived signal {} is not bound", field))
            })?;
            let element = document.read().slot_object(&slot)?;
            let response = self.connection().recompute(recompute, &element)?;
            let update = RecomputeUpdate::from_response(recompute, &response)?;
            self.apply_recompute(&update)?;
        }
        Ok(Status::done())
    }

    /// Same contract as [`BaseDevice::set`], without the completion marker.
    fn put(&mut self, field: &str, value: Json) -> SirepoResult<()> {
        self.set(field, value).map(|_| ())
    }

    /// Writes every field of `update` into the sibling of the same name.
    ///
    /// All siblings are looked up before the first write; a missing one fails the whole update.
    /// Sibling writes never recompute again.
    fn apply_recompute(&mut self, update: &RecomputeUpdate) -> SirepoResult<()> {
        if let Some(missing) = update.fields.keys().find(|f| !self.has_signal(f)) {
            return Err(SirepoError::SchemaMismatch(format!(
                "{} has no '{}' signal for {}",
                self.name(),
                missing,
                update.kind.method()
            )));
        }
        let document = self.connection().document().clone();
        for (field, value) in &update.fields {
            self.sig_(field)?.write(&document, value.clone())?;
        }
        Ok(())
    }

    /// Re-reads every bound signal from the document.
    fn refresh(&mut self) -> SirepoResult<()> {
        let document = self.connection().document().clone();
        for sig in self.signals_().values_mut() {
            sig.refresh(&document)?;
        }
        Ok(())
    }

    fn read_signals(&self) -> IndexMap<String, Reading> {
        self.signals()
            .iter()
            .map(|(field, sig)| (self.signal_name(field), sig.read()))
            .collect()
    }

    fn describe_signals(&self) -> IndexMap<String, DataKey> {
        self.signals()
            .iter()
            .map(|(field, sig)| (self.signal_name(field), sig.describe()))
            .collect()
    }
}

/// A synthesized device. See the [module documentation](self).
pub struct Device {
    name: String,
    class_name: String,
    kind: DeviceKind,
    signals: IndexMap<String, Signal>,
    connection: Arc<SirepoClient>,
    report: Option<ReportState>,
}

impl Device {
    pub fn new(
        name: &str,
        class_name: &str,
        kind: DeviceKind,
        connection: Arc<SirepoClient>,
    ) -> Self {
        Self {
            name: name.to_string(),
            class_name: class_name.to_string(),
            kind,
            signals: IndexMap::new(),
            connection,
            report: None,
        }
    }

    /// Adds (or replaces) the signal of `field`.
    pub fn add_signal(
        &mut self,
        field: &str,
        kind: SignalKind,
        binding: Option<Binding>,
        value: Json,
    ) {
        let full_name = self.signal_name(field);
        let sig = match binding {
            Some(binding) => Signal::bound(&full_name, kind, binding, value),
            None => Signal::soft(&full_name, kind, value),
        };
        if self.signals.insert(field.to_string(), sig).is_some() {
            log::warn!("{}: signal '{}' was replaced", self.name, field);
        }
    }

    pub(crate) fn attach_report(&mut self, state: ReportState) {
        for (field, value) in ReportState::output_fields() {
            self.add_signal(field, SignalKind::ReadOnly, None, value);
        }
        self.report = Some(state);
    }

    pub(crate) fn report(&self) -> Option<&ReportState> {
        self.report.as_ref()
    }

    pub(crate) fn report_(&mut self) -> Option<&mut ReportState> {
        self.report.as_mut()
    }
}

impl BaseDevice for Device {
    fn name(&self) -> &str {
        &self.name
    }
    fn class_name(&self) -> &str {
        &self.class_name
    }
    fn kind(&self) -> DeviceKind {
        self.kind
    }
    fn connection(&self) -> &Arc<SirepoClient> {
        &self.connection
    }
    fn signals(&self) -> &IndexMap<String, Signal> {
        &self.signals
    }
    fn signals_(&mut self) -> &mut IndexMap<String, Signal> {
        &mut self.signals
    }
}

#[cfg(test)]
mod test {
    mod recompute_update {
        use crate::client::RecomputeKind;
        use crate::device::*;
        use serde_json::json;

        #[test]
        fn keeps_only_dependent_fields() {
            let response = json!({
                "state": "ok",
                "title": "CRL1",
                "focalDistance": 2.5,
                "absoluteFocusPosition": 31.5,
            });
            let update =
                RecomputeUpdate::from_response(RecomputeKind::CrlCharacteristics, &response).unwrap();
            assert_eq!(update.fields.len(), 2);
            assert_eq!(update.fields["focalDistance"], json!(2.5));
            assert!(!update.fields.contains_key("state"));
        }

        #[test]
        fn incomplete_response_is_a_mismatch() {
            let response = json!({"state": "ok", "normalVectorX": 1.0});
            assert!(matches!(
                RecomputeUpdate::from_response(RecomputeKind::GrazingOrientation, &response),
                Err(SirepoError::SchemaMismatch(_))
            ));
        }
    }
}
