//! Single-job flyer for tabular results.
//!
//! [`MadxFlyer`] runs one report of its simulation on `kickoff`, stores the returned table under
//! `<root>/<%Y/%m/%d>/<uuid>.tfs` and parses it. `complete` mints one datum per (row, column)
//! and `collect` yields one event per row mapping `<flyer>_<column>` to the datum of that cell.

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{json, Map};
use sirepo_backend::*;

use crate::flyer::*;

pub struct MadxFlyer {
    name: String,
    connection: Arc<SirepoClient>,
    root_dir: PathBuf,
    report: String,
    reader: Arc<dyn TableReader>,
    datum_factory: Option<DatumFactory>,
    table: Option<Table>,
    /// Datum ids by row, then by column.
    datum_ids: Vec<IndexMap<String, String>>,
    asset_docs: VecDeque<AssetDoc>,
}

impl MadxFlyer {
    pub fn new(connection: Arc<SirepoClient>, root_dir: PathBuf, report: &str) -> Self {
        Self {
            name: "madx_flyer".to_string(),
            connection,
            root_dir,
            report: report.to_string(),
            reader: Arc::new(TfsTableReader),
            datum_factory: None,
            table: None,
            datum_ids: Vec::new(),
            asset_docs: VecDeque::new(),
        }
    }

    pub fn with_reader(mut self, reader: Arc<dyn TableReader>) -> Self {
        self.reader = reader;
        self
    }

    pub fn report(&self) -> &str {
        &self.report
    }

    /// Table parsed by the last `kickoff`.
    pub fn table(&self) -> Option<&Table> {
        self.table.as_ref()
    }

    fn require_table(&self) -> SirepoResult<&Table> {
        self.table.as_ref().ok_or_else(|| {
            SirepoError::Precondition(format!("kick off {} first", self.name))
        })
    }
}

impl BlueskyFlyer for MadxFlyer {
    fn name(&self) -> &str {
        &self.name
    }
    fn asset_docs(&self) -> &VecDeque<AssetDoc> {
        &self.asset_docs
    }
    fn asset_docs_(&mut self) -> &mut VecDeque<AssetDoc> {
        &mut self.asset_docs
    }

    fn kickoff(&mut self) -> SirepoResult<Status> {
        let sim_type = self.connection.sim_type()?;
        self.connection.document().write().set_report(&self.report);
        self.connection.run_default()?;
        let raw = self.connection.fetch_result(0)?;

        let (relative, absolute) = new_result_stem(&self.root_dir)?;
        let (resource, factory) = compose_resource(
            sim_type.as_str(),
            &self.root_dir,
            &with_suffix(&relative, ".tfs"),
            Map::new(),
        );
        fs::write(with_suffix(&absolute, ".tfs"), &raw)?;
        let table = self.reader.read_table(&raw)?;
        log::info!(
            "{}: {} rows of {} columns from {}",
            self.name,
            table.nrows(),
            table.columns.len(),
            self.report
        );

        self.asset_docs.push_back(AssetDoc::Resource(resource));
        self.datum_factory = Some(factory);
        self.table = Some(table);
        self.datum_ids.clear();
        Ok(Status::done())
    }

    fn complete(&mut self) -> SirepoResult<Status> {
        let table = self.require_table()?.clone();
        let factory = self.datum_factory.as_mut().ok_or_else(|| {
            SirepoError::Precondition("no resource to mint datums for".to_string())
        })?;
        self.datum_ids.clear();
        for row_num in 0..table.nrows() {
            let mut row = IndexMap::new();
            for col_name in table.columns.keys() {
                let mut kwargs = Map::new();
                kwargs.insert("row_num".to_string(), json!(row_num));
                kwargs.insert("col_name".to_string(), json!(col_name));
                let datum = factory.mint(kwargs);
                row.insert(col_name.clone(), datum.datum_id.clone());
                self.asset_docs.push_back(AssetDoc::Datum(datum));
            }
            self.datum_ids.push(row);
        }
        Ok(Status::done())
    }

    fn describe_collect(&self) -> SirepoResult<IndexMap<String, IndexMap<String, DataKey>>> {
        let table = self.require_table()?;
        let keys = table
            .columns
            .keys()
            .map(|column| {
                let source = self.data_key(column);
                let dtype = if table.is_text_column(column) {
                    "string"
                } else {
                    "number"
                };
                let mut key = column_key(&source, dtype, Vec::new());
                key.external = Some("MADXFILE:".to_string());
                (source, key)
            })
            .collect();
        let mut described = IndexMap::new();
        described.insert(self.name.clone(), keys);
        Ok(described)
    }

    fn collect(&mut self) -> SirepoResult<Vec<FlyerEvent>> {
        let now = now_timestamp();
        Ok(self
            .datum_ids
            .iter()
            .map(|row| {
                let data = row
                    .iter()
                    .map(|(column, datum_id)| (self.data_key(column), json!(datum_id)))
                    .collect();
                FlyerEvent::new(data, now)
            })
            .collect())
    }
}
