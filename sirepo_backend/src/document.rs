//! The simulation document: one simulation's complete state as returned by the service.
//!
//! The document is held as a `serde_json::Value` behind a [`DocumentHandle`]
//! (`Arc<RwLock<SimDocument>>`). Signals never keep a private copy of the data they expose;
//! they carry a [`Binding`], an address of one leaf (model group, array slot, parameter) and
//! every read or write goes through the handle. Element identity is positional: a binding to
//! `models.beamline[3].horizontalSize` stays valid for as long as the array is not spliced.
//!
//! The per-dialect knowledge of where elements live and how they are named is collected in
//! [`Dialect`], one descriptor per [`SimType`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Map, Value as Json};
use sha2::{Digest, Sha256};

use crate::error::*;

pub type DocumentHandle = Arc<RwLock<SimDocument>>;

/// Simulation families the service runs and this crate knows how to expose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimType {
    Srw,
    Shadow,
    Madx,
}

impl SimType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimType::Srw => "srw",
            SimType::Shadow => "shadow",
            SimType::Madx => "madx",
        }
    }

    pub fn dialect(&self) -> &'static Dialect {
        match self {
            SimType::Srw => &SRW_DIALECT,
            SimType::Shadow => &SHADOW_DIALECT,
            SimType::Madx => &MADX_DIALECT,
        }
    }
}

impl fmt::Display for SimType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SimType {
    type Err = SirepoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "srw" => Ok(SimType::Srw),
            "shadow" => Ok(SimType::Shadow),
            "madx" => Ok(SimType::Madx),
            other => Err(SirepoError::UnknownSimType(other.to_string())),
        }
    }
}

/// Auxiliary model group that is not an element array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupShape {
    /// A single mapping exposed as a one-element list; the synthetic title and type are the
    /// values used for naming only and are never written into the document.
    Singleton {
        title: &'static str,
        element_type: &'static str,
    },
    /// An array of command-like elements without a natural unique title; class names are
    /// formed from the element's `_type` and its position.
    Indexed,
}

/// Where a dialect keeps its elements and how it names them.
#[derive(Debug)]
pub struct Dialect {
    pub sim_type: SimType,
    /// Model group holding the ordered element array.
    pub element_group: &'static str,
    /// Element field supplying the display name.
    pub name_field: &'static str,
    /// Auxiliary groups needing special handling when requested in addition to the element
    /// array. Other requested groups are treated by shape: arrays like the element array,
    /// mappings as singletons titled after the group.
    pub extra_groups: &'static [(&'static str, GroupShape)],
    /// Whether elements carry a parallel `propagation` map keyed by element id.
    pub has_propagation: bool,
}

impl Dialect {
    pub fn group_shape(&self, group: &str) -> Option<GroupShape> {
        self.extra_groups
            .iter()
            .find(|(name, _)| *name == group)
            .map(|(_, shape)| *shape)
    }
}

pub static SRW_DIALECT: Dialect = Dialect {
    sim_type: SimType::Srw,
    element_group: "beamline",
    name_field: "title",
    extra_groups: &[
        (
            "undulator",
            GroupShape::Singleton {
                title: "undulator",
                element_type: "undulator",
            },
        ),
        (
            "intensityReport",
            GroupShape::Singleton {
                title: "SingleElectronSpectrum",
                element_type: "intensityReport",
            },
        ),
    ],
    has_propagation: true,
};

pub static SHADOW_DIALECT: Dialect = Dialect {
    sim_type: SimType::Shadow,
    element_group: "beamline",
    name_field: "title",
    extra_groups: &[],
    has_propagation: false,
};

pub static MADX_DIALECT: Dialect = Dialect {
    sim_type: SimType::Madx,
    element_group: "elements",
    name_field: "element_name",
    extra_groups: &[("commands", GroupShape::Indexed)],
    has_propagation: false,
};

/// Field names that clash with identifiers of the device model, paired with their public names.
pub const RESERVED_RENAMES: [(&str, &str); 3] = [
    ("position", "element_position"),
    ("name", "element_name"),
    ("class", "command_class"),
];

/// Public field name for a document key.
pub fn public_field_name(doc_key: &str) -> &str {
    RESERVED_RENAMES
        .iter()
        .find(|(from, _)| *from == doc_key)
        .map(|(_, to)| *to)
        .unwrap_or(doc_key)
}

/// Document key for a public field name; inverse of [`public_field_name`].
pub fn document_key(public_name: &str) -> &str {
    RESERVED_RENAMES
        .iter()
        .find(|(_, to)| *to == public_name)
        .map(|(from, _)| *from)
        .unwrap_or(public_name)
}

/// Element id as used in report names and as key of the propagation map: `9`, `9.0` and `"9"`
/// all give `"9"`.
pub fn id_key(id: &Json) -> String {
    match id {
        Json::String(s) => s.clone(),
        Json::Number(n) => match n.as_f64() {
            Some(v) if v.fract() == 0. => format!("{}", v as i64),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// Names of the nine scalar SRW propagation parameters, in array order.
pub const PROPAGATION_FIELDS: [&str; 9] = [
    "resize_before",
    "resize_after",
    "precision",
    "propagator_type",
    "fourier_resize",
    "hrange_mod",
    "hres_mod",
    "vrange_mod",
    "vres_mod",
];

/// The mapping a binding addresses inside `models`.
#[derive(Clone, Debug, PartialEq)]
pub enum Slot {
    /// `models[group][index]`, one row of an element array.
    Element { group: String, index: usize },
    /// `models[group]`, a singleton mapping.
    Model { group: String },
    /// `models.propagation[element_id][0]`, the element's propagation row.
    Propagation { element_id: String },
    /// `models.postPropagation`.
    PostPropagation,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ParamKey {
    Field(String),
    Index(usize),
}

/// Address of one leaf of the document.
#[derive(Clone, Debug, PartialEq)]
pub struct Binding {
    pub slot: Slot,
    pub param: ParamKey,
}

impl Binding {
    pub fn field(slot: Slot, key: &str) -> Self {
        Self {
            slot,
            param: ParamKey::Field(key.to_string()),
        }
    }

    pub fn index(slot: Slot, index: usize) -> Self {
        Self {
            slot,
            param: ParamKey::Index(index),
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.slot {
            Slot::Element { group, index } => write!(f, "models.{}[{}]", group, index)?,
            Slot::Model { group } => write!(f, "models.{}", group)?,
            Slot::Propagation { element_id } => write!(f, "models.propagation.{}[0]", element_id)?,
            Slot::PostPropagation => write!(f, "models.postPropagation")?,
        }
        match &self.param {
            ParamKey::Field(key) => write!(f, ".{}", key),
            ParamKey::Index(i) => write!(f, "[{}]", i),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimDocument {
    root: Json,
}

impl SimDocument {
    pub fn new(root: Json) -> Self {
        Self { root }
    }

    pub fn empty() -> Self {
        Self::new(json!({ "models": {} }))
    }

    pub fn into_handle(self) -> DocumentHandle {
        Arc::new(RwLock::new(self))
    }

    pub fn as_json(&self) -> &Json {
        &self.root
    }

    pub fn as_json_(&mut self) -> &mut Json {
        &mut self.root
    }

    pub fn models(&self) -> SirepoResult<&Map<String, Json>> {
        self.root
            .get("models")
            .and_then(Json::as_object)
            .ok_or_else(|| SirepoError::MissingModel("models".to_string()))
    }

    fn models_(&mut self) -> SirepoResult<&mut Map<String, Json>> {
        self.root
            .get_mut("models")
            .and_then(Json::as_object_mut)
            .ok_or_else(|| SirepoError::MissingModel("models".to_string()))
    }

    /// The named model group, or [`SirepoError::MissingModel`].
    pub fn group(&self, name: &str) -> SirepoResult<&Json> {
        self.models()?
            .get(name)
            .ok_or_else(|| SirepoError::MissingModel(name.to_string()))
    }

    pub fn group_(&mut self, name: &str) -> SirepoResult<&mut Json> {
        self.models_()?
            .get_mut(name)
            .ok_or_else(|| SirepoError::MissingModel(name.to_string()))
    }

    /// The element array of `group`; a mapping-valued group is an error.
    pub fn elements(&self, group: &str) -> SirepoResult<&Vec<Json>> {
        self.group(group)?
            .as_array()
            .ok_or_else(|| SirepoError::SchemaMismatch(format!("models.{} is not an array", group)))
    }

    pub fn elements_(&mut self, group: &str) -> SirepoResult<&mut Vec<Json>> {
        self.group_(group)?
            .as_array_mut()
            .ok_or_else(|| SirepoError::SchemaMismatch(format!("models.{} is not an array", group)))
    }

    pub fn slot(&self, slot: &Slot) -> SirepoResult<&Json> {
        let missing = || SirepoError::SchemaMismatch(format!("slot {:?} does not exist", slot));
        match slot {
            Slot::Element { group, index } => self.elements(group)?.get(*index).ok_or_else(missing),
            Slot::Model { group } => self.group(group),
            Slot::Propagation { element_id } => self
                .group("propagation")?
                .get(element_id.as_str())
                .and_then(|rows| rows.get(0))
                .ok_or_else(missing),
            Slot::PostPropagation => self.group("postPropagation"),
        }
    }

    pub fn slot_(&mut self, slot: &Slot) -> SirepoResult<&mut Json> {
        let missing = || SirepoError::SchemaMismatch(format!("slot {:?} does not exist", slot));
        match slot {
            Slot::Element { group, index } => {
                self.elements_(group)?.get_mut(*index).ok_or_else(missing)
            }
            Slot::Model { group } => self.group_(group),
            Slot::Propagation { element_id } => self
                .group_("propagation")?
                .get_mut(element_id.as_str())
                .and_then(|rows| rows.get_mut(0))
                .ok_or_else(missing),
            Slot::PostPropagation => self.group_("postPropagation"),
        }
    }

    /// Current value at `binding`.
    pub fn read(&self, binding: &Binding) -> SirepoResult<Json> {
        let slot = self.slot(&binding.slot)?;
        let value = match &binding.param {
            ParamKey::Field(key) => slot.get(key.as_str()),
            ParamKey::Index(i) => slot.get(*i),
        };
        value
            .cloned()
            .ok_or_else(|| SirepoError::SchemaMismatch(format!("{} does not exist", binding)))
    }

    /// Writes `value` at `binding`. Mapping slots accept new keys; array slots only accept an
    /// existing index.
    pub fn write(&mut self, binding: &Binding, value: Json) -> SirepoResult<()> {
        let slot = self.slot_(&binding.slot)?;
        match &binding.param {
            ParamKey::Field(key) => {
                let map = slot.as_object_mut().ok_or_else(|| {
                    SirepoError::SchemaMismatch(format!("{} is not a mapping", binding))
                })?;
                map.insert(key.clone(), value);
            }
            ParamKey::Index(i) => {
                let cell = slot.get_mut(*i).ok_or_else(|| {
                    SirepoError::SchemaMismatch(format!("{} does not exist", binding))
                })?;
                *cell = value;
            }
        }
        Ok(())
    }

    /// Mapping at `slot` as an owned JSON object, e.g. the payload of a recompute call.
    pub fn slot_object(&self, slot: &Slot) -> SirepoResult<Map<String, Json>> {
        self.slot(slot)?
            .as_object()
            .cloned()
            .ok_or_else(|| SirepoError::SchemaMismatch(format!("slot {:?} is not a mapping", slot)))
    }

    pub fn simulation_type(&self) -> Option<&str> {
        self.root.get("simulationType").and_then(Json::as_str)
    }

    /// Name of the currently selected report, if any.
    pub fn report(&self) -> Option<&str> {
        self.root.get("report").and_then(Json::as_str)
    }

    pub fn set_report(&mut self, report: &str) {
        if let Some(root) = self.root.as_object_mut() {
            root.insert("report".to_string(), json!(report));
        }
    }

    /// Position of the first element of `group` whose `field` equals `value`.
    pub fn element_index(&self, group: &str, field: &str, value: &Json) -> SirepoResult<usize> {
        self.elements(group)?
            .iter()
            .position(|e| e.get(field) == Some(value))
            .ok_or_else(|| SirepoError::not_found(field, value))
    }

    /// Compact JSON rendering of the whole document.
    pub fn to_json_string(&self) -> SirepoResult<String> {
        Ok(serde_json::to_string(&self.root)?)
    }

    /// JSON snapshot together with its lowercase hex SHA-256.
    pub fn snapshot(&self) -> SirepoResult<(String, String)> {
        let json = self.to_json_string()?;
        let hash = hex::encode(Sha256::digest(json.as_bytes()));
        Ok((json, hash))
    }
}

#[cfg(test)]
mod test {
    mod document {
        use crate::document::*;
        use serde_json::json;

        fn doc() -> SimDocument {
            SimDocument::new(json!({
                "simulationType": "srw",
                "models": {
                    "beamline": [
                        {"id": 1, "title": "Aperture", "type": "aperture", "horizontalSize": 1},
                        {"id": 2, "title": "W9", "type": "watch"}
                    ],
                    "propagation": {"1": [[0, 0, 1, 0, 0, 1.0, 1.0, 1.0, 1.0], []]},
                    "postPropagation": [0, 0, 1, 0, 0, 1.0, 1.0, 1.0, 1.0],
                    "undulator": {"period": 20}
                }
            }))
        }

        #[test]
        fn read_and_write_through_bindings() {
            let mut doc = doc();
            let size = Binding::field(
                Slot::Element {
                    group: "beamline".to_string(),
                    index: 0,
                },
                "horizontalSize",
            );
            assert_eq!(doc.read(&size).unwrap(), json!(1));
            doc.write(&size, json!(2.5)).unwrap();
            assert_eq!(doc.as_json()["models"]["beamline"][0]["horizontalSize"], json!(2.5));

            let precision = Binding::index(
                Slot::Propagation {
                    element_id: "1".to_string(),
                },
                2,
            );
            doc.write(&precision, json!(3.0)).unwrap();
            assert_eq!(doc.as_json()["models"]["propagation"]["1"][0][2], json!(3.0));

            let period = Binding::field(
                Slot::Model {
                    group: "undulator".to_string(),
                },
                "period",
            );
            assert_eq!(doc.read(&period).unwrap(), json!(20));
        }

        #[test]
        fn array_slots_reject_new_indices() {
            let mut doc = doc();
            let out_of_range = Binding::index(Slot::PostPropagation, 12);
            assert!(matches!(
                doc.write(&out_of_range, json!(1.0)),
                Err(crate::error::SirepoError::SchemaMismatch(_))
            ));
        }

        #[test]
        fn missing_group_is_reported() {
            let doc = doc();
            assert!(matches!(
                doc.group("elements"),
                Err(crate::error::SirepoError::MissingModel(name)) if name == "elements"
            ));
        }

        #[test]
        fn element_lookup_and_snapshot() {
            let mut doc = doc();
            assert_eq!(doc.element_index("beamline", "title", &json!("W9")).unwrap(), 1);
            assert!(doc.element_index("beamline", "title", &json!("W10")).is_err());

            let (_, before) = doc.snapshot().unwrap();
            doc.set_report("watchpointReport2");
            let (json, after) = doc.snapshot().unwrap();
            assert_ne!(before, after);
            assert_eq!(after.len(), 64);
            assert!(json.contains("watchpointReport2"));
        }

        #[test]
        fn reserved_names_round_trip() {
            for (doc_key, public) in RESERVED_RENAMES {
                assert_eq!(public_field_name(doc_key), public);
                assert_eq!(document_key(public), doc_key);
            }
            assert_eq!(public_field_name("horizontalSize"), "horizontalSize");
        }

        #[test]
        fn ids_format_as_integers() {
            assert_eq!(id_key(&json!(9)), "9");
            assert_eq!(id_key(&json!(9.0)), "9");
            assert_eq!(id_key(&json!("12")), "12");
            assert_eq!(id_key(&json!(2.5)), "2.5");
        }

        #[test]
        fn dialects() {
            assert_eq!("madx".parse::<SimType>().unwrap().dialect().element_group, "elements");
            assert!("warp".parse::<SimType>().is_err());
            assert!(SimType::Srw.dialect().group_shape("undulator").is_some());
        }
    }
}
