//! Resource and datum documents for result data stored outside the event stream.
//!
//! A report device writes each fetched artifact to a file under a date-organized directory and
//! publishes, instead of the data, an opaque datum id. The resource document names the file
//! (or file stem) and how to read it; each datum document names one piece of it.

use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{Array2, Array3, ArrayView2, Axis};
use serde::Serialize;
use serde_json::{Map, Value as Json};
use uuid::Uuid;

use crate::error::*;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResourceDoc {
    pub uid: String,
    pub spec: String,
    pub root: String,
    pub resource_path: String,
    pub resource_kwargs: Map<String, Json>,
    pub path_semantics: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DatumDoc {
    pub datum_id: String,
    pub resource: String,
    pub datum_kwargs: Map<String, Json>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "name", content = "doc", rename_all = "lowercase")]
pub enum AssetDoc {
    Resource(ResourceDoc),
    Datum(DatumDoc),
}

/// Mints datum documents for one resource; ids are `<resource uid>/<counter>`.
#[derive(Clone, Debug)]
pub struct DatumFactory {
    resource_uid: String,
    counter: usize,
}

impl DatumFactory {
    pub fn mint(&mut self, datum_kwargs: Map<String, Json>) -> DatumDoc {
        let datum = DatumDoc {
            datum_id: format!("{}/{}", self.resource_uid, self.counter),
            resource: self.resource_uid.clone(),
            datum_kwargs,
        };
        self.counter += 1;
        datum
    }

    pub fn resource_uid(&self) -> &str {
        &self.resource_uid
    }
}

pub fn compose_resource(
    spec: &str,
    root: &Path,
    resource_path: &Path,
    resource_kwargs: Map<String, Json>,
) -> (ResourceDoc, DatumFactory) {
    let uid = Uuid::new_v4().to_string();
    let resource = ResourceDoc {
        uid: uid.clone(),
        spec: spec.to_string(),
        root: root.display().to_string(),
        resource_path: resource_path.display().to_string(),
        resource_kwargs,
        path_semantics: "posix".to_string(),
    };
    let factory = DatumFactory {
        resource_uid: uid,
        counter: 0,
    };
    (resource, factory)
}

/// A fresh result location: `<root>/<%Y/%m/%d>/` is created and a new uuid stem is chosen.
///
/// Returns the relative path of the stem (`<%Y/%m/%d>/<uuid>`) and its absolute form.
pub fn new_result_stem(root: &Path) -> SirepoResult<(PathBuf, PathBuf)> {
    let date_dir = PathBuf::from(chrono::Local::now().format("%Y/%m/%d").to_string());
    fs::create_dir_all(root.join(&date_dir))?;
    let relative = date_dir.join(Uuid::new_v4().to_string());
    let absolute = root.join(&relative);
    Ok((relative, absolute))
}

/// Appends `suffix` to the file name of `stem`, e.g. `_srw_0003.dat`.
pub fn with_suffix(stem: &Path, suffix: &str) -> PathBuf {
    let mut name = stem.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Stack of equally shaped 2-D frames, grown one frame at a time.
///
/// Slots that were never stored hold NaN.
#[derive(Clone, Debug)]
pub struct FrameBuffer {
    frames: Array3<f64>,
}

impl FrameBuffer {
    pub fn new(shape: (usize, usize)) -> Self {
        Self {
            frames: Array3::from_elem((1, shape.0, shape.1), f64::NAN),
        }
    }

    pub fn frame_shape(&self) -> (usize, usize) {
        let (_, rows, cols) = self.frames.dim();
        (rows, cols)
    }

    pub fn len(&self) -> usize {
        self.frames.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn store(&mut self, index: usize, frame: ArrayView2<f64>) -> SirepoResult<()> {
        if frame.dim() != self.frame_shape() {
            return Err(SirepoError::Parse(format!(
                "frame of shape {:?} does not fit a buffer of {:?} frames",
                frame.dim(),
                self.frame_shape()
            )));
        }
        let blank = Array2::from_elem(self.frame_shape(), f64::NAN);
        while self.len() <= index {
            self.frames
                .push(Axis(0), blank.view())
                .map_err(|e| SirepoError::InternalConsistency(e.to_string()))?;
        }
        self.frames.index_axis_mut(Axis(0), index).assign(&frame);
        Ok(())
    }

    pub fn frame(&self, index: usize) -> Option<ArrayView2<f64>> {
        (index < self.len()).then(|| self.frames.index_axis(Axis(0), index))
    }
}
