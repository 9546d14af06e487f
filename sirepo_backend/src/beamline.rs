//! The beamline module is the top level of the crate: a name-addressed registry of the devices
//! synthesized for one simulation, and the single place the scheduler talks to.
//!
//! ## Overview
//!
//! A [`Beamline`] owns the client it was built from, the device classes produced by the
//! synthesis engine, and one [`Device`] per class. Its behavior is given by the [`BaseBeamline`]
//! trait, whose default methods address devices by object name and signals by
//! `(device, field)`:
//!
//! - device lookup: [`dev`](BaseBeamline::dev), [`dev_`](BaseBeamline::dev_),
//!   [`device_op`](BaseBeamline::device_op), [`watchpoints`](BaseBeamline::watchpoints);
//! - signals: [`signal_get`](BaseBeamline::signal_get),
//!   [`signal_set`](BaseBeamline::signal_set), [`signal_put`](BaseBeamline::signal_put);
//! - scheduler lifecycle: [`stage`](BaseBeamline::stage), [`trigger`](BaseBeamline::trigger),
//!   [`unstage`](BaseBeamline::unstage), [`read`](BaseBeamline::read),
//!   [`describe`](BaseBeamline::describe),
//!   [`collect_asset_docs`](BaseBeamline::collect_asset_docs).
//!
//! Other registries can reuse the behavior through the [`impl_beamline_boilerplate`] macro.
//!
//! [`impl_beamline_boilerplate`]: crate::impl_beamline_boilerplate

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{json, Value as Json};

use crate::asset::AssetDoc;
use crate::client::SirepoClient;
use crate::device::*;
use crate::document::*;
use crate::error::*;
use crate::report::ReportDevice;
use crate::signal::*;
use crate::synthesis::*;

pub trait BaseBeamline {
    // FIELD methods
    fn connection(&self) -> &Arc<SirepoClient>;
    fn devices(&self) -> &IndexMap<String, Device>;
    fn devices_(&mut self) -> &mut IndexMap<String, Device>;

    fn device_names(&self) -> Vec<String> {
        self.devices().keys().cloned().collect()
    }

    fn has_device(&self, name: &str) -> bool {
        self.devices().contains_key(name)
    }

    /// Shortcut to borrow a device by object name.
    ///
    /// # Example
    /// ```
    /// # use sirepo_backend::*;
    /// # use std::sync::Arc;
    /// let client = SirepoClient::new(Arc::new(SimServer::srw_basic()), "bluesky");
    /// client.authenticate("srw", "00000000").unwrap();
    /// let beamline = Beamline::new(Arc::new(client), &SynthesisOptions::default()).unwrap();
    /// assert_eq!(beamline.dev("w9").unwrap().kind(), DeviceKind::Watchpoint);
    /// assert!(beamline.dev("w10").is_err());
    /// ```
    fn dev(&self, name: &str) -> SirepoResult<&Device> {
        self.devices()
            .get(name)
            .ok_or_else(|| SirepoError::UnknownDevice {
                name: name.to_string(),
                registered: self.device_names(),
            })
    }

    /// Shortcut to mutably borrow a device by object name.
    fn dev_(&mut self, name: &str) -> SirepoResult<&mut Device> {
        let registered = self.device_names();
        self.devices_()
            .get_mut(name)
            .ok_or_else(|| SirepoError::UnknownDevice {
                name: name.to_string(),
                registered,
            })
    }

    /// Registers `device` under its own name.
    ///
    /// # Errors
    ///
    /// [`SirepoError::Precondition`] if a device of that name is already registered.
    fn add_device(&mut self, device: Device) -> SirepoResult<()> {
        let name = device.name().to_string();
        if self.has_device(&name) {
            return Err(SirepoError::Precondition(format!(
                "device {} already registered. Registered devices are {:?}",
                name,
                self.device_names()
            )));
        }
        self.devices_().insert(name, device);
        Ok(())
    }

    /// Executes `f` on the device named `name`.
    fn device_op<F, R>(&mut self, name: &str, mut f: F) -> SirepoResult<R>
    where
        F: FnMut(&mut Device) -> SirepoResult<R>,
    {
        f(self.dev_(name)?)
    }

    /// Object names of the watchpoint devices, in beamline order.
    fn watchpoints(&self) -> Vec<String> {
        self.devices()
            .iter()
            .filter(|(_, dev)| dev.kind() == DeviceKind::Watchpoint)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Cached value of `field` on device `name`.
    fn signal_get(&self, name: &str, field: &str) -> SirepoResult<Json> {
        self.dev(name)?.get(field)
    }

    /// Writes `value` into `field` of device `name`; see [`BaseDevice::set`].
    ///
    /// # Example
    /// ```
    /// # use sirepo_backend::*;
    /// # use std::sync::Arc;
    /// # use serde_json::json;
    /// let client = SirepoClient::new(Arc::new(SimServer::srw_basic()), "bluesky");
    /// client.authenticate("srw", "00000000").unwrap();
    /// let mut beamline = Beamline::new(Arc::new(client), &SynthesisOptions::default()).unwrap();
    /// beamline.signal_set("aperture", "horizontalSize", json!(0.5)).unwrap();
    /// assert_eq!(beamline.signal_get("aperture", "horizontalSize").unwrap(), json!(0.5));
    /// ```
    fn signal_set(&mut self, name: &str, field: &str, value: Json) -> SirepoResult<Status> {
        self.device_op(name, |dev| dev.set(field, value.clone()))
    }

    fn signal_put(&mut self, name: &str, field: &str, value: Json) -> SirepoResult<()> {
        self.device_op(name, |dev| dev.put(field, value.clone()))
    }

    fn stage(&mut self, name: &str) -> SirepoResult<()> {
        self.device_op(name, |dev| ReportDevice::stage(dev))
    }

    fn trigger(&mut self, name: &str) -> SirepoResult<Status> {
        self.device_op(name, |dev| ReportDevice::trigger(dev))
    }

    fn unstage(&mut self, name: &str) -> SirepoResult<()> {
        self.device_op(name, |dev| ReportDevice::unstage(dev))
    }

    fn read(&self, name: &str) -> SirepoResult<IndexMap<String, Reading>> {
        Ok(ReportDevice::read(self.dev(name)?))
    }

    fn describe(&self, name: &str) -> SirepoResult<IndexMap<String, DataKey>> {
        ReportDevice::describe(self.dev(name)?)
    }

    fn collect_asset_docs(&mut self, name: &str) -> SirepoResult<Vec<AssetDoc>> {
        self.device_op(name, |dev| Ok(ReportDevice::collect_asset_docs(dev)))
    }
}

/// Implements [`BaseBeamline`] for a struct holding `connection: Arc<SirepoClient>` and
/// `devices: IndexMap<String, Device>` fields.
///
/// Usage:
/// ```rust
/// use sirepo_backend::*;
/// use indexmap::IndexMap;
/// use std::sync::Arc;
///
/// struct Endstation {
///     connection: Arc<SirepoClient>,
///     devices: IndexMap<String, Device>,
///     detector_distance: f64,
/// }
/// impl_beamline_boilerplate!(Endstation);
/// ```
#[macro_export]
macro_rules! impl_beamline_boilerplate {
    ($beamline_type: ty) => {
        impl $crate::beamline::BaseBeamline for $beamline_type {
            fn connection(&self) -> &::std::sync::Arc<$crate::client::SirepoClient> {
                &self.connection
            }
            fn devices(&self) -> &$crate::indexmap::IndexMap<String, $crate::device::Device> {
                &self.devices
            }
            fn devices_(&mut self) -> &mut $crate::indexmap::IndexMap<String, $crate::device::Device> {
                &mut self.devices
            }
        }
    };
}

/// Devices of one simulation. See the [module documentation](self).
pub struct Beamline {
    connection: Arc<SirepoClient>,
    classes: IndexMap<String, DeviceClass>,
    devices: IndexMap<String, Device>,
}

impl_beamline_boilerplate!(Beamline);

impl Beamline {
    /// Synthesizes the classes and devices of `connection`'s document.
    ///
    /// Devices are always instantiated, whatever `options.create_objects` says.
    pub fn new(connection: Arc<SirepoClient>, options: &SynthesisOptions) -> SirepoResult<Self> {
        let options = SynthesisOptions {
            create_objects: true,
            ..options.clone()
        };
        let Synthesized { classes, objects } = create_classes(&connection, &options)?;
        log::info!(
            "beamline of {} with {} devices",
            connection.sim_id().unwrap_or_default(),
            objects.len()
        );
        Ok(Self {
            connection,
            classes,
            devices: objects,
        })
    }

    pub fn classes(&self) -> &IndexMap<String, DeviceClass> {
        &self.classes
    }
}

/// Elements to copy from one source simulation into a new beamline.
pub struct Splice<'a> {
    pub source: &'a SirepoClient,
    /// Positions of the elements in the source's element array.
    pub indices: Vec<usize>,
    /// Position along the new beamline of each copied element.
    pub positions: Vec<f64>,
}

/// Builds a new SRW beamline out of elements of existing simulations.
///
/// `empty` is cloned under `sim_name`; the selected elements of every source are appended in
/// order with fresh sequential ids and their new positions, each with a copy of its propagation
/// rows. The devices of the resulting document are then synthesized.
///
/// # Errors
///
/// [`SirepoError::Precondition`] if a splice has more or fewer indices than positions or if `empty` is
/// not an SRW simulation, [`SirepoError::NotFound`] for an index past the end of a source
/// beamline, and the errors of [`SirepoClient::clone_simulation`] and [`Beamline::new`].
pub fn populate_beamline(
    empty: &SirepoClient,
    sim_name: &str,
    splices: &[Splice],
    options: &SynthesisOptions,
) -> SirepoResult<Beamline> {
    if empty.sim_type()? != SimType::Srw {
        return Err(SirepoError::Precondition(
            "beamlines can only be populated from SRW simulations".to_string(),
        ));
    }
    let new_beam = empty.clone_simulation(sim_name)?;
    {
        let mut document = new_beam.document().write();
        let mut next_id = document.elements(SRW_DIALECT.element_group)?.len();
        for splice in splices {
            if splice.indices.len() != splice.positions.len() {
                return Err(SirepoError::Precondition(format!(
                    "{} indices for {} positions",
                    splice.indices.len(),
                    splice.positions.len()
                )));
            }
            let source = splice.source.document().read();
            let elements = source.elements(SRW_DIALECT.element_group)?;
            for (&index, &position) in splice.indices.iter().zip(&splice.positions) {
                let mut element = elements
                    .get(index)
                    .cloned()
                    .ok_or_else(|| SirepoError::not_found("index", index))?;
                let old_id = element.get("id").map(id_key).unwrap_or_default();
                let rows = source
                    .group("propagation")?
                    .get(old_id.as_str())
                    .cloned()
                    .ok_or_else(|| SirepoError::not_found("propagation id", &old_id))?;
                if let Some(element) = element.as_object_mut() {
                    element.insert("id".to_string(), json!(next_id));
                    element.insert("position".to_string(), json!(position));
                }
                document.elements_(SRW_DIALECT.element_group)?.push(element);
                let propagation_map = document.group_("propagation")?;
                let propagation_map = propagation_map.as_object_mut().ok_or_else(|| {
                    SirepoError::SchemaMismatch("propagation is not a mapping".to_string())
                })?;
                propagation_map.insert(next_id.to_string(), rows);
                next_id += 1;
            }
        }
    }
    Beamline::new(Arc::new(new_beam), options)
}
