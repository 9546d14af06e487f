// The "utils" module collects naming helpers, small numeric kernels and timing utilities
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use ndarray::{Array1, Array2, ArrayView2, Axis};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value as Json};

use crate::error::*;

// Utility class for time-tracking
pub struct TickTimer {
    last: Instant,
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Seconds elapsed since construction or the previous tick.
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64();
        self.last = now;
        diff
    }

    pub fn tick_log(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        log::debug!("{}: {:.6}s", msg, diff);
        diff
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock seconds since the unix epoch, as used for reading timestamps.
pub fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.)
}

static CAMEL_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|_)(.)").unwrap());
static ACRONYM_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"([A-Z]+)([A-Z][a-z])").unwrap());
static WORD_BOUNDARY: Lazy<Regex> = Lazy::new(|| Regex::new(r"([a-z\d])([A-Z])").unwrap());

/// Upper-camel-cases an underscored word: `"mono_crystal1"` becomes `"MonoCrystal1"`.
///
/// The first character and every character following an underscore are upper-cased and the
/// underscores are dropped. Other characters are left untouched, so `"CRL1"` stays `"CRL1"`.
pub fn camelize(word: &str) -> String {
    CAMEL_START.replace_all(word, |caps: &regex::Captures| caps[1].to_uppercase())
        .into_owned()
}

/// Inverse of [`camelize`]: `"MonoCrystal1"` becomes `"mono_crystal1"`, `"CRL1"` becomes `"crl1"`.
pub fn underscore(word: &str) -> String {
    let word = ACRONYM_END.replace_all(word, "${1}_${2}");
    let word = WORD_BOUNDARY.replace_all(&word, "${1}_${2}");
    word.replace('-', "_").to_lowercase()
}

/// Class name derived from an element's display title.
///
/// Spaces and dashes become word boundaries and dots are stripped before camel-casing, so
/// `"Mono Crystal 1"` maps to `"MonoCrystal1"` and `"S0.5"` to `"S05"`.
pub fn class_name_from_title(title: &str) -> String {
    camelize(&title.replace(' ', "_").replace('.', "").replace('-', "_"))
}

/// Integers are widened to floats; every other value passes through unchanged.
pub fn coerce_numeric(value: &Json) -> Json {
    match value {
        Json::Number(n) if n.is_i64() || n.is_u64() => n
            .as_f64()
            .and_then(serde_json::Number::from_f64)
            .map(Json::Number)
            .unwrap_or_else(|| value.clone()),
        _ => value.clone(),
    }
}

/// Numeric view of a document value; numeric strings are accepted as well.
pub fn json_f64(value: &Json) -> Option<f64> {
    match value {
        Json::Number(n) => n.as_f64(),
        Json::String(s) => s.trim().parse().ok(),
        Json::Bool(b) => Some(if *b { 1. } else { 0. }),
        _ => None,
    }
}

/// Value equality that treats `1` and `1.0` as the same number.
pub fn json_eq(a: &Json, b: &Json) -> bool {
    match (a, b) {
        (Json::Number(x), Json::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

pub fn f64_json(value: f64) -> Json {
    serde_json::Number::from_f64(value)
        .map(Json::Number)
        .unwrap_or(Json::Null)
}

/// Recomputes the grazing-orientation vectors of a mirror element in place.
///
/// `grazing_angle` is in milliradians. `autocompute_type` is `"horizontal"` or `"vertical"`:
/// the first zeroes the Y components, the second the X components. Any other value leaves both
/// planes populated.
pub fn update_grazing_vectors(
    element: &mut Map<String, Json>,
    grazing_angle: f64,
    autocompute_type: &str,
) {
    let angle = grazing_angle / 1000.;
    let normal = (1. - angle.sin().powi(2)).sqrt();
    let tangential = (1. - angle.cos().powi(2)).sqrt();

    let mut vectors = [
        ("normalVectorX", normal),
        ("normalVectorY", normal),
        ("tangentialVectorX", tangential),
        ("tangentialVectorY", tangential),
        ("normalVectorZ", -tangential),
    ];
    for (key, value) in vectors.iter_mut() {
        let zeroed = match autocompute_type {
            "horizontal" => key.ends_with('Y'),
            "vertical" => key.ends_with('X'),
            _ => false,
        };
        if zeroed {
            *value = 0.;
        }
    }
    for (key, value) in vectors {
        element.insert(key.to_string(), f64_json(value));
    }
}

/// Intensity-weighted moments of a 2-D beam image.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BeamStats {
    pub x: f64,
    pub y: f64,
    pub fwhm_x: f64,
    pub fwhm_y: f64,
    pub flux: f64,
    pub mean: f64,
}

/// Computes centroid, FWHM, flux and mean of `image` laid out over the given extents.
///
/// Rows run along the vertical extent and columns along the horizontal one. An all-zero image
/// has no centroid, so its moments are NaN while flux and mean stay well-defined.
pub fn beam_stats(
    image: ArrayView2<f64>,
    horizontal_extent: [f64; 2],
    vertical_extent: [f64; 2],
) -> BeamStats {
    let (ny, nx) = image.dim();
    let flux = image.sum();
    let mean = image.mean().unwrap_or(f64::NAN);
    if flux == 0. || nx == 0 || ny == 0 {
        return BeamStats {
            x: f64::NAN,
            y: f64::NAN,
            fwhm_x: f64::NAN,
            fwhm_y: f64::NAN,
            flux,
            mean,
        };
    }

    let xs = Array1::linspace(horizontal_extent[0], horizontal_extent[1], nx);
    let ys = Array1::linspace(vertical_extent[0], vertical_extent[1], ny);
    let col_profile = image.sum_axis(Axis(0));
    let row_profile = image.sum_axis(Axis(1));

    let x = (&xs * &col_profile).sum() / flux;
    let y = (&ys * &row_profile).sum() / flux;
    let var_x = (xs.mapv(|v| (v - x).powi(2)) * &col_profile).sum() / flux;
    let var_y = (ys.mapv(|v| (v - y).powi(2)) * &row_profile).sum() / flux;
    let fwhm_factor = 2. * (2. * 2f64.ln()).sqrt();

    BeamStats {
        x,
        y,
        fwhm_x: fwhm_factor * var_x.sqrt(),
        fwhm_y: fwhm_factor * var_y.sqrt(),
        flux,
        mean,
    }
}

/// Bilinear resampling of `image` onto `shape = (rows, cols)`, corners aligned.
pub fn resize_bilinear(image: ArrayView2<f64>, shape: (usize, usize)) -> Array2<f64> {
    let (in_rows, in_cols) = image.dim();
    let (rows, cols) = shape;
    if (in_rows, in_cols) == shape {
        return image.to_owned();
    }
    if in_rows == 0 || in_cols == 0 {
        return Array2::from_elem(shape, f64::NAN);
    }
    let scale = |n_in: usize, n_out: usize, i: usize| -> f64 {
        if n_out <= 1 || n_in <= 1 {
            0.
        } else {
            i as f64 * (n_in - 1) as f64 / (n_out - 1) as f64
        }
    };

    Array2::from_shape_fn(shape, |(r, c)| {
        let fr = scale(in_rows, rows, r);
        let fc = scale(in_cols, cols, c);
        let (r0, c0) = (fr.floor() as usize, fc.floor() as usize);
        let (r1, c1) = ((r0 + 1).min(in_rows - 1), (c0 + 1).min(in_cols - 1));
        let (dr, dc) = (fr - r0 as f64, fc - c0 as f64);
        let top = image[[r0, c0]] * (1. - dc) + image[[r0, c1]] * dc;
        let bottom = image[[r1, c0]] * (1. - dc) + image[[r1, c1]] * dc;
        top * (1. - dr) + bottom * dr
    })
}

/// Looks up `key` in a JSON object, mapping absence to a protocol error naming `context`.
pub fn require<'a>(value: &'a Json, key: &str, context: &str) -> SirepoResult<&'a Json> {
    value
        .get(key)
        .ok_or_else(|| SirepoError::Protocol(format!("{} is missing '{}'", context, key)))
}

#[cfg(test)]
mod test {
    mod naming {
        use crate::utils::*;

        #[test]
        fn naming_patterns_are_shared_across_threads() {
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    std::thread::spawn(move || {
                        let title = format!("Mono Crystal {}", i);
                        underscore(&class_name_from_title(&title))
                    })
                })
                .collect();
            let names: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(
                names,
                vec!["mono_crystal0", "mono_crystal1", "mono_crystal2", "mono_crystal3"]
            );
        }

        #[test]
        fn camelize_and_underscore() {
            assert_eq!(camelize("mono_crystal1"), "MonoCrystal1");
            assert_eq!(underscore("MonoCrystal1"), "mono_crystal1");
            assert_eq!(underscore("CRL1"), "crl1");
            assert_eq!(underscore("HTTPServer"), "http_server");
        }

        #[test]
        fn titles_to_class_names() {
            assert_eq!(class_name_from_title("Mono Crystal 1"), "MonoCrystal1");
            assert_eq!(class_name_from_title("CRL1"), "CRL1");
            assert_eq!(class_name_from_title("S0.5-slit"), "S05Slit");
            assert_eq!(underscore(&class_name_from_title("Watchpoint")), "watchpoint");
            assert_eq!(underscore(&class_name_from_title("W9")), "w9");
        }

        #[test]
        fn integers_become_floats() {
            let coerced = coerce_numeric(&serde_json::json!(3));
            assert!(coerced.is_f64());
            assert_eq!(coerced.as_f64(), Some(3.));
            assert_eq!(coerce_numeric(&serde_json::json!("x")), serde_json::json!("x"));
            assert!(json_eq(&coerced, &serde_json::json!(3)));
        }
    }

    mod numerics {
        use crate::utils::*;
        use ndarray::Array2;
        use serde_json::{json, Map};

        fn assert_close(value: &serde_json::Value, expected: f64) {
            let value = value.as_f64().unwrap();
            assert!((value - expected).abs() < 1e-12, "{} != {}", value, expected);
        }

        #[test]
        fn vertical_grazing_vectors() {
            let mut element = Map::new();
            update_grazing_vectors(&mut element, 10., "vertical");
            assert_eq!(element["normalVectorX"], json!(0.0));
            assert_close(&element["normalVectorY"], 0.9999500004166653);
            assert_close(&element["normalVectorZ"], -0.009999833334166664);
            assert_eq!(element["tangentialVectorX"], json!(0.0));
            assert_close(&element["tangentialVectorY"], 0.009999833334166664);
        }

        #[test]
        fn horizontal_grazing_vectors() {
            let mut element = Map::new();
            update_grazing_vectors(&mut element, 10., "horizontal");
            assert_eq!(element["normalVectorY"], json!(0.0));
            assert_eq!(element["tangentialVectorY"], json!(0.0));
            assert_close(&element["normalVectorX"], 0.9999500004166653);
        }

        #[test]
        fn symmetric_beam_is_centered() {
            let image = Array2::from_shape_fn((5, 5), |(r, c)| {
                let (dr, dc) = (r as f64 - 2., c as f64 - 2.);
                (-(dr * dr + dc * dc) / 2.).exp()
            });
            let stats = beam_stats(image.view(), [-1., 1.], [-1., 1.]);
            assert!(stats.x.abs() < 1e-12);
            assert!(stats.y.abs() < 1e-12);
            assert!(stats.fwhm_x > 0.);
            assert!((stats.flux - image.sum()).abs() < 1e-12);
        }

        #[test]
        fn empty_beam_has_no_centroid() {
            let stats = beam_stats(Array2::zeros((3, 4)).view(), [0., 1.], [0., 1.]);
            assert!(stats.x.is_nan() && stats.fwhm_y.is_nan());
            assert_eq!(stats.flux, 0.);
            assert_eq!(stats.mean, 0.);
        }

        #[test]
        fn resize_keeps_corners() {
            let image = Array2::from_shape_vec((2, 2), vec![0., 1., 2., 3.]).unwrap();
            let resized = resize_bilinear(image.view(), (3, 3));
            assert_eq!(resized[[0, 0]], 0.);
            assert_eq!(resized[[2, 2]], 3.);
            assert_eq!(resized[[1, 1]], 1.5);
        }
    }
}
