//! The flyer lifecycle: `kickoff`, `complete`, `collect`.
//!
//! A flyer runs outside the per-point scheduler loop. `kickoff` starts the remote work,
//! `complete` is the join point after which every datum reference exists, and `collect` yields
//! the events. Result files are referenced through resource and datum documents, drained with
//! `collect_asset_docs`.

use std::collections::VecDeque;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value as Json;
use sirepo_backend::*;

/// One event yielded by `collect`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FlyerEvent {
    pub data: IndexMap<String, Json>,
    pub timestamps: IndexMap<String, f64>,
    pub time: f64,
    pub filled: IndexMap<String, bool>,
}

impl FlyerEvent {
    /// Event stamped `time`; nothing in it is filled.
    pub fn new(data: IndexMap<String, Json>, time: f64) -> Self {
        let timestamps = data.keys().map(|k| (k.clone(), time)).collect();
        let filled = data.keys().map(|k| (k.clone(), false)).collect();
        Self {
            data,
            timestamps,
            time,
            filled,
        }
    }
}

pub trait BlueskyFlyer {
    // FIELD methods
    fn name(&self) -> &str;
    fn asset_docs(&self) -> &VecDeque<AssetDoc>;
    fn asset_docs_(&mut self) -> &mut VecDeque<AssetDoc>;

    fn kickoff(&mut self) -> SirepoResult<Status>;
    fn complete(&mut self) -> SirepoResult<Status>;
    fn collect(&mut self) -> SirepoResult<Vec<FlyerEvent>>;

    /// `{flyer name: {data key: metadata}}`
    fn describe_collect(&self) -> SirepoResult<IndexMap<String, IndexMap<String, DataKey>>>;

    /// Drains the resource and datum documents produced so far.
    fn collect_asset_docs(&mut self) -> Vec<AssetDoc> {
        self.asset_docs_().drain(..).collect()
    }

    /// Key of one collected column, `<flyer>_<suffix>`.
    fn data_key(&self, suffix: &str) -> String {
        format!("{}_{}", self.name(), suffix)
    }
}

/// Metadata of a scalar or small-array column named `source`.
pub(crate) fn column_key(source: &str, dtype: &str, shape: Vec<usize>) -> DataKey {
    DataKey {
        source: source.to_string(),
        dtype: dtype.to_string(),
        shape,
        external: None,
        dtype_str: None,
    }
}
