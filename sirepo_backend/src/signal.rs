//! Signals: named read/write endpoints of a device.
//!
//! A signal is either *bound* to one leaf of the simulation document through a [`Binding`], or
//! *soft* (unbound) and holds its own value, as the report outputs of a watchpoint do. Bound
//! signals keep a cached readback that is refreshed on every write, but the document stays the
//! source of truth: [`Signal::refresh`] re-reads it.
//!
//! The [`SignalKind`] decides what a write does:
//!
//! - `Plain` writes through to the document.
//! - `ReadOnly` rejects writes from callers; the owning device may still update it internally.
//! - `Derived(kind)` writes through and then asks the owning device to apply the
//!   `kind` recomputation to its sibling signals (see
//!   [`BaseDevice::apply_recompute`](crate::device::BaseDevice::apply_recompute)).

use serde::Serialize;
use serde_json::Value as Json;

use crate::client::RecomputeKind;
use crate::document::*;
use crate::error::*;
use crate::utils::now_timestamp;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalKind {
    Plain,
    ReadOnly,
    Derived(RecomputeKind),
}

/// Completion marker returned by `set` and `trigger`; all operations here complete synchronously.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status {
    success: bool,
}

impl Status {
    pub fn done() -> Self {
        Self { success: true }
    }

    pub fn is_done(&self) -> bool {
        true
    }

    pub fn success(&self) -> bool {
        self.success
    }
}

/// One entry of a `read()` mapping.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Reading {
    pub value: Json,
    pub timestamp: f64,
}

/// One entry of a `describe()` mapping.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DataKey {
    pub source: String,
    pub dtype: String,
    pub shape: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtype_str: Option<String>,
}

impl DataKey {
    pub fn for_value(source: &str, value: &Json) -> Self {
        let (dtype, shape) = match value {
            Json::Number(_) => ("number", vec![]),
            Json::Bool(_) => ("boolean", vec![]),
            Json::String(_) => ("string", vec![]),
            Json::Array(items) => ("array", vec![items.len()]),
            Json::Object(_) => ("object", vec![]),
            Json::Null => ("number", vec![]),
        };
        Self {
            source: source.to_string(),
            dtype: dtype.to_string(),
            shape,
            external: None,
            dtype_str: None,
        }
    }

    /// Key of a value stored outside the event stream under a datum reference.
    pub fn external(source: &str, store: &str, shape: Vec<usize>, dtype_str: &str) -> Self {
        Self {
            source: source.to_string(),
            dtype: "array".to_string(),
            shape,
            external: Some(store.to_string()),
            dtype_str: Some(dtype_str.to_string()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Signal {
    name: String,
    kind: SignalKind,
    binding: Option<Binding>,
    readback: Json,
    timestamp: f64,
}

impl Signal {
    /// Signal holding its own value.
    pub fn soft(name: &str, kind: SignalKind, value: Json) -> Self {
        Self {
            name: name.to_string(),
            kind,
            binding: None,
            readback: value,
            timestamp: now_timestamp(),
        }
    }

    /// Signal bound to `binding`; `value` is the readback at binding time.
    pub fn bound(name: &str, kind: SignalKind, binding: Binding, value: Json) -> Self {
        Self {
            name: name.to_string(),
            kind,
            binding: Some(binding),
            readback: value,
            timestamp: now_timestamp(),
        }
    }

    // FIELD methods
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn kind(&self) -> SignalKind {
        self.kind
    }
    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }
    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn get(&self) -> &Json {
        &self.readback
    }

    pub fn read(&self) -> Reading {
        Reading {
            value: self.readback.clone(),
            timestamp: self.timestamp,
        }
    }

    pub fn describe(&self) -> DataKey {
        let source = match &self.binding {
            Some(binding) => format!("SIM:{}", binding),
            None => "SIM:soft".to_string(),
        };
        DataKey::for_value(&source, &self.readback)
    }

    /// Caller-facing write. Read-only signals fail without touching the document.
    pub fn set(&mut self, document: &DocumentHandle, value: Json) -> SirepoResult<Status> {
        if self.kind == SignalKind::ReadOnly {
            return Err(SirepoError::ReadOnly(self.name.clone()));
        }
        self.write(document, value)?;
        Ok(Status::done())
    }

    /// Writes through the binding (if any) and updates the readback, regardless of kind.
    pub(crate) fn write(&mut self, document: &DocumentHandle, value: Json) -> SirepoResult<()> {
        if let Some(binding) = &self.binding {
            document.write().write(binding, value.clone())?;
            log::debug!("{} <- {} ({})", self.name, value, binding);
        }
        self.readback = value;
        self.timestamp = now_timestamp();
        Ok(())
    }

    /// Re-reads the bound leaf into the readback.
    pub fn refresh(&mut self, document: &DocumentHandle) -> SirepoResult<&Json> {
        if let Some(binding) = &self.binding {
            self.readback = document.read().read(binding)?;
        }
        Ok(&self.readback)
    }
}

#[cfg(test)]
mod test {
    mod signal {
        use crate::document::*;
        use crate::error::SirepoError;
        use crate::signal::*;
        use serde_json::json;

        fn handle() -> DocumentHandle {
            SimDocument::new(json!({"models": {"beamline": [{"title": "S1", "horizontalSize": 1.0}]}}))
                .into_handle()
        }

        fn binding() -> Binding {
            Binding::field(
                Slot::Element {
                    group: "beamline".to_string(),
                    index: 0,
                },
                "horizontalSize",
            )
        }

        #[test]
        fn plain_writes_through() {
            let doc = handle();
            let mut sig = Signal::bound("s1_horizontalSize", SignalKind::Plain, binding(), json!(1.0));
            assert!(sig.set(&doc, json!(4.0)).unwrap().success());
            assert_eq!(sig.get(), &json!(4.0));
            assert_eq!(doc.read().as_json()["models"]["beamline"][0]["horizontalSize"], json!(4.0));
        }

        #[test]
        fn read_only_rejects_and_keeps_document() {
            let doc = handle();
            let mut sig = Signal::bound("s1_horizontalSize", SignalKind::ReadOnly, binding(), json!(1.0));
            assert!(matches!(sig.set(&doc, json!(4.0)), Err(SirepoError::ReadOnly(_))));
            assert_eq!(sig.get(), &json!(1.0));
            assert_eq!(doc.read().as_json()["models"]["beamline"][0]["horizontalSize"], json!(1.0));
            assert_eq!(sig.read().value, json!(1.0));
        }

        #[test]
        fn refresh_sees_document_edits() {
            let doc = handle();
            let mut sig = Signal::bound("s1_horizontalSize", SignalKind::Plain, binding(), json!(1.0));
            doc.write().write(&binding(), json!(7.5)).unwrap();
            assert_eq!(sig.refresh(&doc).unwrap(), &json!(7.5));
        }

        #[test]
        fn soft_signals_hold_their_value() {
            let doc = handle();
            let mut sig = Signal::soft("w9_mean", SignalKind::Plain, json!(0.0));
            sig.set(&doc, json!(2.0)).unwrap();
            assert_eq!(sig.get(), &json!(2.0));
            assert!(!sig.is_bound());
            assert_eq!(sig.describe().dtype, "number");
        }
    }
}
