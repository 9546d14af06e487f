//! Synthesis of device classes from a simulation document.
//!
//! ## Overview
//!
//! [`create_classes`] walks the element array of the client's document (plus any extra model
//! groups requested) and builds one [`DeviceClass`] per element:
//!
//! - the class name comes from the element's display name, camel-cased, and the object name is
//!   the class name underscored;
//! - every element field becomes a signal bound to that field of that element, with reserved
//!   keys exposed under their public names (see [`RESERVED_RENAMES`]);
//! - watch elements become watchpoints and the SRW intensity report becomes a spectrum device;
//! - fields whose writes need a server-side recompute become derived signals.
//!
//! SRW documents also get one propagation device per element, `<object>_propagation`, bound to
//! the element's row of `models.propagation`, and a `post_propagation` device bound to
//! `models.postPropagation`.
//!
//! The document itself is never modified: renames happen on a copy of each element and every
//! binding keeps the original document key.

use std::collections::HashSet;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map, Value as Json};

use crate::client::{RecomputeKind, SirepoClient};
use crate::device::*;
use crate::document::*;
use crate::error::*;
use crate::report::{ReportConfig, SPECTRUM_REPORT};
use crate::signal::SignalKind;
use crate::utils::*;

/// What to do when an element carries both a reserved key and its public name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RenamePolicy {
    /// The renamed reserved key wins; the literal public-name key becomes unaddressable.
    #[default]
    LastWriteWins,
    /// Fail with [`SirepoError::ReservedNameCollision`].
    Strict,
}

#[derive(Clone, Debug)]
pub struct SynthesisOptions {
    /// Model groups to synthesize in addition to the dialect's element array.
    pub extra_model_fields: Vec<String>,
    /// Instantiate one device per class against the client.
    pub create_objects: bool,
    pub rename_policy: RenamePolicy,
    /// Public field names whose signals reject writes.
    pub read_only_fields: HashSet<String>,
    pub report: ReportConfig,
}

impl Default for SynthesisOptions {
    fn default() -> Self {
        Self {
            extra_model_fields: Vec::new(),
            create_objects: true,
            rename_policy: RenamePolicy::default(),
            read_only_fields: HashSet::new(),
            report: ReportConfig::default(),
        }
    }
}

impl SynthesisOptions {
    pub fn with_extra_model_fields(mut self, groups: &[&str]) -> Self {
        self.extra_model_fields = groups.iter().map(|g| g.to_string()).collect();
        self
    }

    pub fn with_read_only(mut self, fields: &[&str]) -> Self {
        self.read_only_fields
            .extend(fields.iter().map(|f| f.to_string()));
        self
    }

    pub fn with_report(mut self, report: ReportConfig) -> Self {
        self.report = report;
        self
    }
}

/// Classes keyed by class name (propagation classes by object name), and the objects
/// instantiated from them keyed by object name.
pub struct Synthesized {
    pub classes: IndexMap<String, DeviceClass>,
    pub objects: IndexMap<String, Device>,
}

/// Fields of one element as exposed on its device: public name, document key, value.
type PublicFields = Vec<(String, String, Json)>;

/// Applies [`RESERVED_RENAMES`] to an element.
///
/// Plain keys keep their order; renamed keys follow in rename-table order. A renamed key whose
/// public name is already taken overwrites it in place under [`RenamePolicy::LastWriteWins`].
fn public_fields(element: &Map<String, Json>, policy: RenamePolicy) -> SirepoResult<PublicFields> {
    let mut fields: IndexMap<String, (String, Json)> = element
        .iter()
        .filter(|(key, _)| public_field_name(key) == key.as_str())
        .map(|(key, value)| (key.clone(), (key.clone(), value.clone())))
        .collect();
    for (from, to) in RESERVED_RENAMES {
        let Some(value) = element.get(from) else {
            continue;
        };
        if fields.contains_key(to) {
            match policy {
                RenamePolicy::Strict => {
                    return Err(SirepoError::ReservedNameCollision {
                        from: from.to_string(),
                        to: to.to_string(),
                    })
                }
                RenamePolicy::LastWriteWins => {
                    log::warn!("'{}' overrides the existing '{}' field", from, to);
                }
            }
        }
        fields.insert(to.to_string(), (from.to_string(), value.clone()));
    }
    Ok(fields
        .into_iter()
        .map(|(public, (key, value))| (public, key, value))
        .collect())
}

fn field_kind(
    options: &SynthesisOptions,
    element_type: Option<&str>,
    public: &str,
) -> SignalKind {
    if options.read_only_fields.contains(public) {
        return SignalKind::ReadOnly;
    }
    element_type
        .and_then(|t| RecomputeKind::for_field(t, public))
        .map(SignalKind::Derived)
        .unwrap_or(SignalKind::Plain)
}

fn base_kind(element_type: Option<&str>) -> DeviceKind {
    match element_type {
        Some("watch") => DeviceKind::Watchpoint,
        Some(SPECTRUM_REPORT) => DeviceKind::SingleElectronSpectrum,
        _ => DeviceKind::Generic,
    }
}

fn display_name(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Picks a unique object name; taken names get `_<index>` appended until they are free.
fn unique_object_name(
    mut object_name: String,
    index: usize,
    taken: &IndexMap<String, DeviceClass>,
) -> String {
    if taken.contains_key(&object_name) {
        let original = object_name.clone();
        while taken.contains_key(&object_name) {
            object_name = format!("{}_{}", object_name, index);
        }
        log::warn!(
            "object name '{}' is already taken, using '{}'",
            original,
            object_name
        );
    }
    object_name
}

/// How the elements of a group are named.
enum Naming {
    /// By the dialect's name field.
    ByField,
    /// By the element's `_type` and position.
    Indexed,
    /// A lone mapping, named by the given title.
    Singleton { title: String, element_type: String },
}

struct Builder<'a> {
    dialect: &'static Dialect,
    options: &'a SynthesisOptions,
    /// Classes keyed by object name while building.
    by_object: IndexMap<String, DeviceClass>,
}

impl<'a> Builder<'a> {
    fn element(
        &mut self,
        group: &str,
        index: usize,
        element: &Map<String, Json>,
        slot: Slot,
        naming: &Naming,
    ) -> SirepoResult<String> {
        let fields = public_fields(element, self.options.rename_policy)?;
        let lookup = |name: &str| {
            fields
                .iter()
                .find(|(public, _, _)| public == name)
                .map(|(_, _, value)| value)
        };

        let (element_type, class_name) = match naming {
            Naming::Singleton {
                title,
                element_type,
            } => (Some(element_type.clone()), class_name_from_title(title)),
            Naming::Indexed => {
                let command = lookup("_type").and_then(Json::as_str).ok_or_else(|| {
                    SirepoError::SchemaMismatch(format!("{}[{}] has no '_type'", group, index))
                })?;
                (
                    Some(command.to_string()),
                    camelize(&format!("{}{}", command, index)),
                )
            }
            Naming::ByField => {
                let name = lookup(self.dialect.name_field).ok_or_else(|| {
                    SirepoError::SchemaMismatch(format!(
                        "{}[{}] has no '{}'",
                        group, index, self.dialect.name_field
                    ))
                })?;
                (
                    lookup("type").and_then(Json::as_str).map(str::to_string),
                    class_name_from_title(&display_name(name)),
                )
            }
        };

        let mut specs: Vec<FieldSpec> = fields
            .iter()
            .map(|(public, key, value)| FieldSpec {
                field: public.clone(),
                kind: field_kind(self.options, element_type.as_deref(), public),
                binding: Some(Binding::field(slot.clone(), key)),
                value: coerce_numeric(value),
            })
            .collect();
        if let Naming::Singleton {
            title,
            element_type,
        } = naming
        {
            for (field, value) in [("title", title), ("type", element_type)] {
                if lookup(field).is_none() {
                    specs.push(FieldSpec {
                        field: field.to_string(),
                        kind: SignalKind::ReadOnly,
                        binding: None,
                        value: Json::String(value.clone()),
                    });
                }
            }
        }

        let object_name = unique_object_name(underscore(&class_name), index, &self.by_object);
        let class = DeviceClass::new(&class_name, base_kind(element_type.as_deref()), specs);
        self.by_object.insert(object_name.clone(), class);
        Ok(object_name)
    }

    fn propagation(&mut self, object_name: &str, slot: Slot, row: &Json) -> SirepoResult<()> {
        let row = row.as_array().ok_or_else(|| {
            SirepoError::SchemaMismatch(format!("propagation of {} is not an array", object_name))
        })?;
        let specs = PROPAGATION_FIELDS
            .iter()
            .enumerate()
            .map(|(i, field)| {
                let value = row.get(i).ok_or_else(|| {
                    SirepoError::SchemaMismatch(format!(
                        "propagation of {} has no '{}'",
                        object_name, field
                    ))
                })?;
                Ok(FieldSpec {
                    field: field.to_string(),
                    kind: SignalKind::Plain,
                    binding: Some(Binding::index(slot.clone(), i)),
                    value: coerce_numeric(value),
                })
            })
            .collect::<SirepoResult<Vec<_>>>()?;
        self.by_object.insert(
            object_name.to_string(),
            DeviceClass::new("PropagationConfig", DeviceKind::Propagation, specs),
        );
        Ok(())
    }
}

/// Builds the device classes (and, by default, the devices) for the client's document.
///
/// Classes are keyed by class name, except the propagation classes which share one class name
/// and are keyed by object name instead.
///
/// # Errors
///
/// [`SirepoError::Precondition`] if the client is not authenticated,
/// [`SirepoError::MissingModel`] if a requested group is absent, and
/// [`SirepoError::SchemaMismatch`] for elements without a display name.
pub fn create_classes(
    connection: &Arc<SirepoClient>,
    options: &SynthesisOptions,
) -> SirepoResult<Synthesized> {
    let mut timer = TickTimer::new();
    let dialect = connection.sim_type()?.dialect();
    let document = connection.document().read().clone();

    let mut groups = vec![dialect.element_group.to_string()];
    groups.extend(
        options
            .extra_model_fields
            .iter()
            .filter(|g| g.as_str() != dialect.element_group)
            .cloned(),
    );

    let mut builder = Builder {
        dialect,
        options,
        by_object: IndexMap::new(),
    };
    for group in &groups {
        match document.group(group)? {
            Json::Object(element) => {
                let naming = match dialect.group_shape(group) {
                    Some(GroupShape::Singleton {
                        title,
                        element_type,
                    }) => Naming::Singleton {
                        title: title.to_string(),
                        element_type: element_type.to_string(),
                    },
                    _ => Naming::Singleton {
                        title: group.clone(),
                        element_type: group.clone(),
                    },
                };
                let slot = Slot::Model {
                    group: group.clone(),
                };
                builder.element(group, 0, element, slot, &naming)?;
            }
            Json::Array(elements) => {
                let naming = match dialect.group_shape(group) {
                    Some(GroupShape::Indexed) => Naming::Indexed,
                    _ => Naming::ByField,
                };
                for (index, element) in elements.iter().enumerate() {
                    let element = element.as_object().ok_or_else(|| {
                        SirepoError::SchemaMismatch(format!(
                            "{}[{}] is not a mapping",
                            group, index
                        ))
                    })?;
                    let slot = Slot::Element {
                        group: group.clone(),
                        index,
                    };
                    let object_name = builder.element(group, index, element, slot, &naming)?;
                    if dialect.has_propagation && group == dialect.element_group {
                        let id = element.get("id").ok_or_else(|| {
                            SirepoError::SchemaMismatch(format!("{}[{}] has no 'id'", group, index))
                        })?;
                        let slot = Slot::Propagation {
                            element_id: id_key(id),
                        };
                        let row = document.slot(&slot)?.clone();
                        builder.propagation(&format!("{}_propagation", object_name), slot, &row)?;
                    }
                }
            }
            other => {
                return Err(SirepoError::SchemaMismatch(format!(
                    "model '{}' is neither an array nor a mapping: {}",
                    group, other
                )))
            }
        }
    }
    if dialect.has_propagation && groups.iter().any(|g| g == dialect.element_group) {
        let row = document.slot(&Slot::PostPropagation)?.clone();
        builder.propagation("post_propagation", Slot::PostPropagation, &row)?;
    }

    let mut classes = IndexMap::new();
    for (object_name, class) in &builder.by_object {
        let key = match class.kind() {
            DeviceKind::Propagation => object_name.clone(),
            _ => class.class_name().to_string(),
        };
        if classes.insert(key.clone(), class.clone()).is_some() {
            log::warn!("class '{}' was redefined by {}", key, object_name);
        }
    }
    let mut objects = IndexMap::new();
    if options.create_objects {
        for (object_name, class) in &builder.by_object {
            let device = class.instantiate(object_name, connection.clone(), &options.report)?;
            objects.insert(object_name.clone(), device);
        }
    }
    timer.tick_log(&format!(
        "synthesized {} classes and {} objects",
        classes.len(),
        objects.len()
    ));
    Ok(Synthesized { classes, objects })
}

#[cfg(test)]
mod test {
    mod create_classes {
        use crate::client::{RecomputeKind, SirepoClient};
        use crate::device::*;
        use crate::document::*;
        use crate::error::*;
        use crate::signal::SignalKind;
        use crate::sim::SimServer;
        use crate::synthesis::*;
        use serde_json::{json, Value as Json};
        use std::sync::Arc;

        fn connect(server: SimServer, sim_type: &str, sim_id: &str) -> Arc<SirepoClient> {
            let client = SirepoClient::new(Arc::new(server), "bluesky");
            client.authenticate(sim_type, sim_id).unwrap();
            Arc::new(client)
        }

        fn srw() -> Arc<SirepoClient> {
            connect(SimServer::srw_basic(), "srw", SimServer::SRW_SIM_ID)
        }

        fn kind_of(class: &DeviceClass, field: &str) -> SignalKind {
            class
                .fields()
                .iter()
                .find(|f| f.field == field)
                .map(|f| f.kind)
                .unwrap()
        }

        #[test]
        fn srw_elements() {
            let synth = create_classes(&srw(), &SynthesisOptions::default()).unwrap();
            let names: Vec<&str> = synth.objects.keys().map(String::as_str).collect();
            assert_eq!(
                names,
                vec![
                    "aperture",
                    "aperture_propagation",
                    "hfm",
                    "hfm_propagation",
                    "crl1",
                    "crl1_propagation",
                    "mono_crystal1",
                    "mono_crystal1_propagation",
                    "w9",
                    "w9_propagation",
                    "post_propagation",
                ]
            );
            assert_eq!(synth.classes["W9"].kind(), DeviceKind::Watchpoint);
            assert_eq!(synth.classes["MonoCrystal1"].kind(), DeviceKind::Generic);
            assert_eq!(synth.classes["w9_propagation"].kind(), DeviceKind::Propagation);
            assert_eq!(synth.classes["post_propagation"].class_name(), "PropagationConfig");
        }

        #[test]
        fn derived_kinds() {
            let synth = create_classes(&srw(), &SynthesisOptions::default()).unwrap();
            let hfm = &synth.classes["HFM"];
            assert_eq!(
                kind_of(hfm, "grazingAngle"),
                SignalKind::Derived(RecomputeKind::GrazingOrientation)
            );
            assert_eq!(kind_of(hfm, "normalVectorX"), SignalKind::Plain);
            let crl = &synth.classes["CRL1"];
            assert_eq!(
                kind_of(crl, "numberOfLenses"),
                SignalKind::Derived(RecomputeKind::CrlCharacteristics)
            );
            assert_eq!(kind_of(crl, "focalDistance"), SignalKind::Plain);
            let crystal = &synth.classes["MonoCrystal1"];
            assert_eq!(
                kind_of(crystal, "energy"),
                SignalKind::Derived(RecomputeKind::CrystalOrientation)
            );
            assert_eq!(kind_of(crystal, "nvx"), SignalKind::Plain);
            assert_eq!(kind_of(&synth.classes["Aperture"], "horizontalSize"), SignalKind::Plain);
        }

        #[test]
        fn reserved_keys_keep_their_document_binding() {
            let synth = create_classes(&srw(), &SynthesisOptions::default()).unwrap();
            let aperture = &synth.objects["aperture"];
            assert!(!aperture.has_signal("position"));
            let position = aperture.sig("element_position").unwrap();
            assert_eq!(
                position.binding(),
                Some(&Binding::field(
                    Slot::Element {
                        group: "beamline".to_string(),
                        index: 0
                    },
                    "position"
                ))
            );
            // integers are widened on ingestion
            assert_eq!(position.get(), &json!(20.0));
        }

        #[test]
        fn propagation_devices() {
            let synth = create_classes(&srw(), &SynthesisOptions::default()).unwrap();
            let prop = &synth.objects["w9_propagation"];
            assert_eq!(prop.component_names(), PROPAGATION_FIELDS.to_vec());
            let sig = prop.sig("fourier_resize").unwrap();
            assert_eq!(
                sig.binding(),
                Some(&Binding::index(
                    Slot::Propagation {
                        element_id: "9".to_string()
                    },
                    4
                ))
            );
            let post = &synth.objects["post_propagation"];
            assert_eq!(post.get("precision").unwrap(), json!(1.0));
        }

        #[test]
        fn singleton_groups() {
            let options = SynthesisOptions::default()
                .with_extra_model_fields(&["undulator", "intensityReport"]);
            let synth = create_classes(&srw(), &options).unwrap();
            let spectrum = &synth.objects["single_electron_spectrum"];
            assert_eq!(spectrum.kind(), DeviceKind::SingleElectronSpectrum);
            assert_eq!(spectrum.get("title").unwrap(), json!("SingleElectronSpectrum"));
            assert_eq!(spectrum.sig("type").unwrap().kind(), SignalKind::ReadOnly);
            assert!(!spectrum.sig("title").unwrap().is_bound());
            assert_eq!(
                spectrum.sig("photonEnergyPointCount").unwrap().binding(),
                Some(&Binding::field(
                    Slot::Model {
                        group: "intensityReport".to_string()
                    },
                    "photonEnergyPointCount"
                ))
            );
            assert!(synth.objects["undulator"].has_signal("period"));
        }

        #[test]
        fn madx_groups() {
            let client = connect(SimServer::madx_basic(), "madx", SimServer::MADX_SIM_ID);
            let options =
                SynthesisOptions::default().with_extra_model_fields(&["commands", "rpnVariables"]);
            let synth = create_classes(&client, &options).unwrap();
            let names: Vec<&str> = synth.objects.keys().map(String::as_str).collect();
            assert_eq!(names, vec!["qf", "d1", "qd", "bpm1", "beam0", "twiss1", "kq"]);
            let qf = &synth.objects["qf"];
            assert_eq!(qf.get("element_name").unwrap(), json!("QF"));
            assert_eq!(
                qf.sig("element_name").unwrap().binding().map(|b| b.param.clone()),
                Some(ParamKey::Field("name".to_string()))
            );
            assert!(synth.objects["twiss1"].has_signal("command_class"));
            assert_eq!(synth.classes["Beam0"].field_names()[0], "_id");
        }

        #[test]
        fn slug_collisions_get_the_array_index() {
            let mut doc = SimServer::srw_document();
            doc["models"]["beamline"][2]["title"] = json!("Aperture");
            let server = SimServer::new("bluesky").with_simulation("dup", doc);
            let synth =
                create_classes(&connect(server, "srw", "dup"), &SynthesisOptions::default())
                    .unwrap();
            assert!(synth.objects.contains_key("aperture"));
            assert!(synth.objects.contains_key("aperture_2"));
            assert!(synth.objects.contains_key("aperture_2_propagation"));
            assert_eq!(
                synth.objects["aperture_2"].get("type").unwrap(),
                json!("crl")
            );
        }

        #[test]
        fn rename_policies() {
            let mut doc = SimServer::madx_document();
            doc["models"]["elements"][0]["element_name"] = json!("shadowed");
            let server = SimServer::new("bluesky").with_simulation("clash", doc);
            let client = connect(server, "madx", "clash");

            let synth = create_classes(&client, &SynthesisOptions::default()).unwrap();
            assert_eq!(synth.objects["qf"].get("element_name").unwrap(), json!("QF"));

            let strict = SynthesisOptions {
                rename_policy: RenamePolicy::Strict,
                ..SynthesisOptions::default()
            };
            assert!(matches!(
                create_classes(&client, &strict),
                Err(SirepoError::ReservedNameCollision { .. })
            ));
        }

        #[test]
        fn read_only_fields() {
            let options = SynthesisOptions::default().with_read_only(&["horizontalSize"]);
            let mut synth = create_classes(&srw(), &options).unwrap();
            let aperture = synth.objects.get_mut("aperture").unwrap();
            assert!(matches!(
                aperture.set("horizontalSize", json!(2.)),
                Err(SirepoError::ReadOnly(_))
            ));
            assert_eq!(aperture.document_value("horizontalSize").unwrap(), json!(1));
        }

        #[test]
        fn classes_without_objects() {
            let options = SynthesisOptions {
                create_objects: false,
                ..SynthesisOptions::default()
            };
            let synth = create_classes(&srw(), &options).unwrap();
            assert!(synth.objects.is_empty());
            assert_eq!(synth.classes.len(), 11);
        }

        #[test]
        fn failures() {
            let options = SynthesisOptions::default().with_extra_model_fields(&["missing"]);
            assert!(matches!(
                create_classes(&srw(), &options),
                Err(SirepoError::MissingModel(_))
            ));

            let mut doc: Json = SimServer::srw_document();
            doc["models"]["beamline"][0]
                .as_object_mut()
                .unwrap()
                .remove("title");
            let server = SimServer::new("bluesky").with_simulation("untitled", doc);
            let client = connect(server, "srw", "untitled");
            assert!(matches!(
                create_classes(&client, &SynthesisOptions::default()),
                Err(SirepoError::SchemaMismatch(_))
            ));

            let unauthenticated = Arc::new(SirepoClient::new(
                Arc::new(SimServer::srw_basic()),
                "bluesky",
            ));
            assert!(matches!(
                create_classes(&unauthenticated, &SynthesisOptions::default()),
                Err(SirepoError::Precondition(_))
            ));
        }
    }
}
