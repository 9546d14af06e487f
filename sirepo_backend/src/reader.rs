//! Readers turning downloaded result artifacts into arrays and summary values.
//!
//! Report devices and flyers only depend on the [`ResultReader`] and [`TableReader`] traits; the
//! reference implementations below cover SRW ASCII intensity files and TFS tables. Other formats
//! plug in through [`ReportConfig::reader`](crate::report::ReportConfig).

use indexmap::IndexMap;
use ndarray::{Array1, ArrayD, Ix2, IxDyn};
use serde_json::{json, Value as Json};

use crate::error::*;
use crate::utils::*;

/// What a report device asks of a reader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadOptions {
    pub ndim: usize,
    pub histogram_bins: Option<usize>,
}

impl ReadOptions {
    pub fn image() -> Self {
        Self {
            ndim: 2,
            histogram_bins: None,
        }
    }

    pub fn spectrum() -> Self {
        Self {
            ndim: 1,
            histogram_bins: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ParsedResult {
    pub data: ArrayD<f64>,
    pub shape: Vec<usize>,
    pub mean: f64,
    /// Total intensity, when the format carries it.
    pub flux: Option<f64>,
    /// Scalar photon energy of an image, or the energy axis of a spectrum.
    pub photon_energy: Json,
    pub horizontal_extent: [f64; 2],
    pub vertical_extent: [f64; 2],
    pub moments: Option<BeamStats>,
    pub units: Vec<String>,
}

impl ParsedResult {
    /// Beam moments, computed from the image when the reader did not supply them.
    pub fn beam_stats(&self) -> SirepoResult<BeamStats> {
        if let Some(moments) = self.moments {
            return Ok(moments);
        }
        let image = self
            .data
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| SirepoError::Parse(format!("beam moments need 2-D data, got {:?}", self.shape)))?;
        let mut stats = beam_stats(image, self.horizontal_extent, self.vertical_extent);
        if let Some(flux) = self.flux {
            stats.flux = flux;
        }
        Ok(stats)
    }
}

pub trait ResultReader: Send + Sync {
    fn read(&self, raw: &[u8], options: &ReadOptions) -> SirepoResult<ParsedResult>;
}

/// Reader for SRW ASCII intensity files.
///
/// The header is a run of `#`-prefixed lines. After the first (free-text) line, each carries one
/// value followed by its label; the first nine values are the ranges
/// `[e_start, e_fin, ne, x_start, x_fin, nx, y_start, y_fin, ny]`. The body holds one value
/// per line in C order.
#[derive(Clone, Copy, Debug, Default)]
pub struct SrwAsciiReader;

impl SrwAsciiReader {
    fn parse(raw: &[u8]) -> SirepoResult<([f64; 9], Vec<String>, Vec<f64>)> {
        let text = String::from_utf8_lossy(raw);
        let mut ranges = Vec::with_capacity(9);
        let mut units = Vec::new();
        let mut values = Vec::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(header) = line.strip_prefix('#') {
                if lineno == 0 {
                    continue;
                }
                let (value, label) = header.split_once('#').unwrap_or((header, ""));
                if ranges.len() < 9 {
                    if let Ok(v) = value.trim().parse::<f64>() {
                        ranges.push(v);
                        if let (Some(start), Some(end)) = (label.find('['), label.find(']')) {
                            units.push(label[start + 1..end].to_string());
                        }
                    }
                }
                continue;
            }
            let value = line
                .parse::<f64>()
                .map_err(|_| SirepoError::Parse(format!("line {}: '{}' is not a number", lineno + 1, line)))?;
            values.push(value);
        }

        let ranges: [f64; 9] = ranges
            .try_into()
            .map_err(|r: Vec<f64>| SirepoError::Parse(format!("expected 9 header ranges, found {}", r.len())))?;
        Ok((ranges, units, values))
    }
}

impl ResultReader for SrwAsciiReader {
    fn read(&self, raw: &[u8], options: &ReadOptions) -> SirepoResult<ParsedResult> {
        let (ranges, units, values) = Self::parse(raw)?;
        let count = |v: f64| v.round().max(0.) as usize;
        let horizontal_extent = [ranges[3], ranges[4]];
        let vertical_extent = [ranges[6], ranges[7]];

        let (shape, photon_energy) = match options.ndim {
            2 => (vec![count(ranges[8]), count(ranges[5])], f64_json(ranges[0])),
            1 => {
                let ne = count(ranges[2]);
                let energies = Array1::linspace(ranges[0], ranges[1], ne);
                (vec![ne], json!(energies.to_vec()))
            }
            ndim => {
                return Err(SirepoError::Parse(format!("ndim={} is not supported", ndim)));
            }
        };
        let expected: usize = shape.iter().product();
        if values.len() != expected {
            return Err(SirepoError::Parse(format!(
                "header announces {:?} = {} values, body has {}",
                shape,
                expected,
                values.len()
            )));
        }
        let data = ArrayD::from_shape_vec(IxDyn(&shape), values)
            .map_err(|e| SirepoError::Parse(e.to_string()))?;
        let mean = data.mean().unwrap_or(f64::NAN);
        let moments = match data.view().into_dimensionality::<Ix2>() {
            Ok(image) => Some(beam_stats(image, horizontal_extent, vertical_extent)),
            Err(_) => None,
        };

        Ok(ParsedResult {
            flux: moments.map(|m| m.flux),
            data,
            shape,
            mean,
            photon_energy,
            horizontal_extent,
            vertical_extent,
            moments,
            units,
        })
    }
}

/// Named columns of equal length, in file order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Table {
    pub headers: IndexMap<String, Json>,
    pub columns: IndexMap<String, Vec<Json>>,
}

impl Table {
    pub fn nrows(&self) -> usize {
        self.columns.values().next().map(Vec::len).unwrap_or(0)
    }

    pub fn row(&self, index: usize) -> Option<IndexMap<&str, &Json>> {
        (index < self.nrows()).then(|| {
            self.columns
                .iter()
                .map(|(name, column)| (name.as_str(), &column[index]))
                .collect()
        })
    }

    /// True when every value of the column is a string.
    pub fn is_text_column(&self, name: &str) -> bool {
        self.columns
            .get(name)
            .map(|c| !c.is_empty() && c.iter().all(Json::is_string))
            .unwrap_or(false)
    }
}

pub trait TableReader: Send + Sync {
    fn read_table(&self, raw: &[u8]) -> SirepoResult<Table>;
}

/// Reader for TFS tables: `@ NAME %type value` headers, a `*` line of column names, a `$` line
/// of column types, then whitespace-separated rows with double-quoted strings.
#[derive(Clone, Copy, Debug, Default)]
pub struct TfsTableReader;

fn tfs_tokens(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '"' => {
                if quoted {
                    tokens.push(std::mem::take(&mut current));
                }
                quoted = !quoted;
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn tfs_value(token: &str, type_tag: &str) -> SirepoResult<Json> {
    if type_tag.ends_with('s') {
        return Ok(json!(token));
    }
    token
        .parse::<f64>()
        .map(f64_json)
        .map_err(|_| SirepoError::Parse(format!("'{}' is not a {} value", token, type_tag)))
}

impl TableReader for TfsTableReader {
    fn read_table(&self, raw: &[u8]) -> SirepoResult<Table> {
        let text = String::from_utf8_lossy(raw);
        let mut table = Table::default();
        let mut names: Vec<String> = Vec::new();
        let mut types: Vec<String> = Vec::new();

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let tokens = tfs_tokens(line);
            match line.chars().next() {
                Some('@') => {
                    if tokens.len() >= 4 {
                        let value = tfs_value(&tokens[3..].join(" "), &tokens[2])
                            .unwrap_or_else(|_| json!(tokens[3..].join(" ")));
                        table.headers.insert(tokens[1].clone(), value);
                    }
                }
                Some('*') => {
                    names = tokens[1..].to_vec();
                    for name in &names {
                        table.columns.insert(name.clone(), Vec::new());
                    }
                }
                Some('$') => types = tokens[1..].to_vec(),
                Some('#') => {}
                _ => {
                    if names.is_empty() || tokens.len() != names.len() {
                        return Err(SirepoError::Parse(format!(
                            "row '{}' does not match the {} declared columns",
                            line,
                            names.len()
                        )));
                    }
                    for (i, token) in tokens.iter().enumerate() {
                        let type_tag = types.get(i).map(String::as_str).unwrap_or("%le");
                        let value = tfs_value(token, type_tag)?;
                        if let Some(column) = table.columns.get_mut(&names[i]) {
                            column.push(value);
                        }
                    }
                }
            }
        }
        if names.is_empty() {
            return Err(SirepoError::Parse("table has no column header line".to_string()));
        }
        Ok(table)
    }
}
