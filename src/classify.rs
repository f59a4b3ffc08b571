//! Background classification: pixels → obstacle mask.
//!
//! A pixel is background when it is perceptually close to the active
//! reference colour or to any colour of the character's own palette.
//! Everything else is an obstacle. Closeness is judged in HSL space with a
//! separate tolerance per axis; near-grey pixels are compared without hue.
//!
//! The reference colour is either fixed by configuration or detected from
//! the desktop by [`detect_background`], a cheap RGB clustering pass that
//! runs on its own slow cadence (see `workers`).

use bevy::color::{Hsla, Srgba};
use bevy::math::{IRect, IVec2};
use serde::Deserialize;

use crate::capture::PixelBuffer;
use crate::collision::CollisionMap;
use crate::error::ClassifyError;

/// Lightness below/above which a pixel counts as black/white regardless of saturation.
const NEAR_BLACK: f32 = 0.06;
const NEAR_WHITE: f32 = 0.94;

/// Upper bound on clusters tracked by the adaptive pass.
const MAX_CLUSTERS: usize = 64;

pub type Rgb = [u8; 3];

/// Per-axis tolerances for perceptual closeness.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct PerceptualThresholds {
    /// Degrees on the hue wheel.
    pub hue: f32,
    pub lightness: f32,
    pub saturation: f32,
    /// Saturation under which hue is ignored.
    pub gray_saturation: f32,
}

impl Default for PerceptualThresholds {
    fn default() -> Self {
        Self {
            hue: 12.0,
            lightness: 0.08,
            saturation: 0.15,
            gray_saturation: 0.12,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceSetting {
    /// Detect the background from the desktop.
    Adaptive,
    /// Always treat this colour as background.
    Fixed(Rgb),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub reference: ReferenceSetting,
    /// The character's own palette; never an obstacle.
    pub always_background: Vec<Rgb>,
    pub thresholds: PerceptualThresholds,
    /// Euclidean RGB distance under which samples join a cluster.
    pub cluster_distance: f32,
    /// Sample every Nth pixel per axis during detection.
    pub sample_stride: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            reference: ReferenceSetting::Adaptive,
            always_background: vec![[0, 0, 0]],
            thresholds: PerceptualThresholds::default(),
            cluster_distance: 40.0,
            sample_stride: 8,
        }
    }
}

/// Reference colour plus the always-background palette, pre-converted to HSL.
///
/// A model is immutable once built. Refreshing the adaptive reference means
/// building a new model and publishing it in place of the old one.
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundModel {
    reference: Option<(Rgb, Hsla)>,
    palette: Vec<Hsla>,
    thresholds: PerceptualThresholds,
    cluster_distance: f32,
    sample_stride: usize,
}

impl BackgroundModel {
    /// Model as configured. An adaptive model starts without a reference.
    pub fn from_config(config: &ClassifierConfig) -> Self {
        let reference = match config.reference {
            ReferenceSetting::Fixed(rgb) => Some(rgb),
            ReferenceSetting::Adaptive => None,
        };
        Self {
            reference: reference.map(|rgb| (rgb, to_hsla(rgb))),
            palette: config.always_background.iter().map(|c| to_hsla(*c)).collect(),
            thresholds: config.thresholds,
            cluster_distance: config.cluster_distance,
            sample_stride: config.sample_stride,
        }
    }

    /// Copy of this model with a newly detected reference colour.
    pub fn with_reference(&self, rgb: Rgb) -> Self {
        Self {
            reference: Some((rgb, to_hsla(rgb))),
            ..self.clone()
        }
    }

    pub fn reference(&self) -> Option<Rgb> {
        self.reference.map(|(rgb, _)| rgb)
    }

    pub fn cluster_distance(&self) -> f32 {
        self.cluster_distance
    }

    pub fn sample_stride(&self) -> usize {
        self.sample_stride
    }

    pub fn is_background(&self, rgb: Rgb) -> bool {
        let px = to_hsla(rgb);
        self.reference
            .iter()
            .map(|(_, hsla)| hsla)
            .chain(self.palette.iter())
            .any(|bg| similar(&px, bg, &self.thresholds))
    }
}

/// HSL of an sRGB colour. Pure black comes out of the conversion with NaN
/// saturation and lightness; non-finite components are zeroed.
fn to_hsla(rgb: Rgb) -> Hsla {
    let hsla = Hsla::from(Srgba::rgb_u8(rgb[0], rgb[1], rgb[2]));
    let finite = |v: f32| if v.is_finite() { v } else { 0.0 };
    Hsla::new(
        finite(hsla.hue),
        finite(hsla.saturation),
        finite(hsla.lightness),
        hsla.alpha,
    )
}

fn is_achromatic(c: &Hsla, th: &PerceptualThresholds) -> bool {
    c.saturation < th.gray_saturation || c.lightness < NEAR_BLACK || c.lightness > NEAR_WHITE
}

fn hue_distance(a: f32, b: f32) -> f32 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}

/// Perceptual closeness of two colours.
pub fn similar(a: &Hsla, b: &Hsla, th: &PerceptualThresholds) -> bool {
    if (a.lightness - b.lightness).abs() > th.lightness {
        return false;
    }
    match (is_achromatic(a, th), is_achromatic(b, th)) {
        (true, true) => true,
        // one grey, one coloured: hue is meaningless, saturation still differs
        (true, false) | (false, true) => (a.saturation - b.saturation).abs() <= th.saturation,
        (false, false) => {
            (a.saturation - b.saturation).abs() <= th.saturation
                && hue_distance(a.hue, b.hue) <= th.hue
        }
    }
}

fn check_shape(buffer: &PixelBuffer) -> Result<(), ClassifyError> {
    if buffer.channels != 3 && buffer.channels != 4 {
        return Err(ClassifyError::Channels(buffer.channels));
    }
    if buffer.data.len() != buffer.expected_len() {
        return Err(ClassifyError::Format {
            expected: buffer.expected_len(),
            actual: buffer.data.len(),
        });
    }
    Ok(())
}

/// Classify `buffer` into a collision map positioned at the buffer's origin.
///
/// Cells inside `exclude` (the character's own AABB, in world coordinates)
/// are always background. A model without a reference colour detects one
/// from the buffer itself.
pub fn classify(
    buffer: &PixelBuffer,
    model: &BackgroundModel,
    exclude: Option<IRect>,
) -> Result<CollisionMap, ClassifyError> {
    check_shape(buffer)?;

    let resolved;
    let model = if model.reference.is_none() {
        match detect_background(buffer, model.sample_stride, model.cluster_distance)? {
            Some(rgb) => {
                resolved = model.with_reference(rgb);
                &resolved
            }
            None => model,
        }
    } else {
        model
    };

    let (w, h) = (buffer.width as usize, buffer.height as usize);
    let mut cells = Vec::with_capacity(w * h);
    for y in 0..buffer.height {
        for x in 0..buffer.width {
            cells.push(!model.is_background(buffer.rgb(x, y)));
        }
    }

    let mut map = CollisionMap::new(w, h, buffer.origin, cells);
    if let Some(rect) = exclude {
        map.clear_rect(rect);
    }
    Ok(map)
}

#[derive(Debug, Clone, Copy)]
struct Cluster {
    mean: [f32; 3],
    count: u32,
}

impl Cluster {
    fn distance_sq(&self, px: [f32; 3]) -> f32 {
        (0..3).map(|i| (self.mean[i] - px[i]).powi(2)).sum()
    }

    fn absorb(&mut self, px: [f32; 3]) {
        self.count += 1;
        let n = self.count as f32;
        for i in 0..3 {
            self.mean[i] += (px[i] - self.mean[i]) / n;
        }
    }
}

/// Most common colour group among strided samples of `buffer`.
///
/// Samples join the nearest running-average cluster within `distance`
/// (plain RGB distance, not perceptual) or start a new one. Returns `None`
/// for an empty buffer.
pub fn detect_background(
    buffer: &PixelBuffer,
    stride: usize,
    distance: f32,
) -> Result<Option<Rgb>, ClassifyError> {
    check_shape(buffer)?;
    let stride = stride.max(1);
    let limit = distance * distance;
    let mut clusters: Vec<Cluster> = Vec::new();

    for y in (0..buffer.height).step_by(stride) {
        for x in (0..buffer.width).step_by(stride) {
            let [r, g, b] = buffer.rgb(x, y);
            let px = [r as f32, g as f32, b as f32];

            let nearest = clusters
                .iter()
                .enumerate()
                .map(|(i, c)| (c.distance_sq(px), i))
                .min_by(|a, b| a.0.total_cmp(&b.0));
            match nearest {
                Some((d, i)) if d <= limit => clusters[i].absorb(px),
                // a full table drops unmatched samples instead of growing
                _ if clusters.len() < MAX_CLUSTERS => clusters.push(Cluster { mean: px, count: 1 }),
                _ => {}
            }
        }
    }

    Ok(clusters
        .iter()
        .max_by_key(|c| c.count)
        .map(|c| c.mean.map(|v| v.round().clamp(0.0, 255.0) as u8)))
}

/// Render a collision map as RGBA: obstacle white, background black.
pub fn mask_to_rgba(map: &CollisionMap) -> PixelBuffer {
    let (w, h) = (map.width(), map.height());
    let mut data = Vec::with_capacity(w * h * 4);
    for y in 0..h {
        for x in 0..w {
            let v = if map.get(x, y) { 255 } else { 0 };
            data.extend_from_slice(&[v, v, v, 255]);
        }
    }
    PixelBuffer::new(w as u32, h as u32, 4, map.offset(), data)
}

/// All-background map for a buffer that could not be classified.
pub fn permissive_for(buffer: &PixelBuffer) -> CollisionMap {
    CollisionMap::permissive(IRect::from_corners(
        buffer.origin,
        buffer.origin + IVec2::new(buffer.width as i32, buffer.height as i32),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESK_BLUE: Rgb = [40, 90, 160];
    const WINDOW_WHITE: Rgb = [235, 235, 235];

    fn fixed(rgb: Rgb) -> BackgroundModel {
        BackgroundModel::from_config(&ClassifierConfig {
            reference: ReferenceSetting::Fixed(rgb),
            always_background: vec![],
            ..ClassifierConfig::default()
        })
    }

    #[test]
    fn uniform_background_yields_empty_mask() {
        for rgb in [DESK_BLUE, WINDOW_WHITE, [0, 0, 0], [128, 128, 128]] {
            let buf = PixelBuffer::filled(32, 24, IVec2::new(7, 9), rgb);
            let map = classify(&buf, &fixed(rgb), None).unwrap();
            assert_eq!(map.count_solid(), 0, "{rgb:?}");
            assert_eq!(map.offset(), IVec2::new(7, 9));
        }
    }

    #[test]
    fn black_converts_to_finite_hsl() {
        let black = to_hsla([0, 0, 0]);
        assert!(black.hue.is_finite() && black.saturation.is_finite());
        assert_eq!(black.lightness, 0.0);
        assert!(similar(&black, &black, &PerceptualThresholds::default()));
    }

    #[test]
    fn default_palette_keeps_black_lines_open() {
        let mut config = ClassifierConfig {
            reference: ReferenceSetting::Fixed(DESK_BLUE),
            ..ClassifierConfig::default()
        };
        let mut buf = PixelBuffer::filled(4, 4, IVec2::ZERO, DESK_BLUE);
        buf.set_rgb(1, 2, [0, 0, 0]);
        let map = classify(&buf, &BackgroundModel::from_config(&config), None).unwrap();
        assert_eq!(map.count_solid(), 0);

        config.always_background.clear();
        let map = classify(&buf, &BackgroundModel::from_config(&config), None).unwrap();
        assert!(map.get(1, 2));
    }

    #[test]
    fn distinct_colours_are_obstacles() {
        let mut buf = PixelBuffer::filled(10, 10, IVec2::ZERO, DESK_BLUE);
        buf.set_rgb(3, 4, WINDOW_WHITE);
        buf.set_rgb(5, 5, [200, 40, 40]);
        let map = classify(&buf, &fixed(DESK_BLUE), None).unwrap();
        assert!(map.get(3, 4));
        assert!(map.get(5, 5));
        assert_eq!(map.count_solid(), 2);
    }

    #[test]
    fn slight_drift_stays_background() {
        let mut buf = PixelBuffer::filled(4, 4, IVec2::ZERO, DESK_BLUE);
        buf.set_rgb(0, 0, [44, 94, 166]);
        let map = classify(&buf, &fixed(DESK_BLUE), None).unwrap();
        assert_eq!(map.count_solid(), 0);
    }

    #[test]
    fn grays_compare_on_lightness_only() {
        let th = PerceptualThresholds::default();
        let dark_red = to_hsla([22, 20, 20]);
        let dark_blue = to_hsla([20, 20, 23]);
        assert!(similar(&dark_red, &dark_blue, &th));
        assert!(!similar(&to_hsla([20, 20, 20]), &to_hsla([120, 120, 120]), &th));
    }

    #[test]
    fn palette_colours_never_collide() {
        let mut config = ClassifierConfig {
            reference: ReferenceSetting::Fixed(DESK_BLUE),
            ..ClassifierConfig::default()
        };
        config.always_background = vec![[250, 200, 30]];
        let model = BackgroundModel::from_config(&config);
        let mut buf = PixelBuffer::filled(4, 4, IVec2::ZERO, DESK_BLUE);
        buf.set_rgb(1, 1, [250, 200, 30]);
        buf.set_rgb(2, 2, [0, 0, 0]);
        let map = classify(&buf, &model, None).unwrap();
        assert!(!map.get(1, 1));
        assert!(map.get(2, 2));
    }

    #[test]
    fn own_aabb_is_forced_to_background() {
        let buf = PixelBuffer::filled(20, 20, IVec2::new(100, 100), WINDOW_WHITE);
        let map = classify(&buf, &fixed(DESK_BLUE), Some(IRect::new(105, 105, 110, 115))).unwrap();
        assert_eq!(map.count_solid(), 400 - 5 * 10);
        assert!(!map.get(5, 5));
        assert!(map.get(4, 5));
    }

    #[test]
    fn malformed_buffers_are_rejected() {
        let mut buf = PixelBuffer::filled(4, 4, IVec2::ZERO, DESK_BLUE);
        buf.data.pop();
        assert!(matches!(
            classify(&buf, &fixed(DESK_BLUE), None),
            Err(ClassifyError::Format { expected: 64, actual: 63 })
        ));

        let two = PixelBuffer::new(2, 2, 2, IVec2::ZERO, vec![0; 8]);
        assert_eq!(
            classify(&two, &fixed(DESK_BLUE), None).unwrap_err(),
            ClassifyError::Channels(2)
        );
    }

    #[test]
    fn rgb_buffers_are_accepted() {
        let buf = PixelBuffer::new(2, 1, 3, IVec2::ZERO, vec![40, 90, 160, 255, 255, 255]);
        let map = classify(&buf, &fixed(DESK_BLUE), None).unwrap();
        assert!(!map.get(0, 0));
        assert!(map.get(1, 0));
    }

    #[test]
    fn detection_picks_majority_colour() {
        let a = [30, 30, 200];
        let b = [220, 220, 40];
        let mut buf = PixelBuffer::filled(100, 10, IVec2::ZERO, a);
        for y in 0..10 {
            for x in 70..100 {
                buf.set_rgb(x, y, b);
            }
        }
        assert_eq!(detect_background(&buf, 5, 40.0).unwrap(), Some(a));

        // flip the proportions
        let mut flipped = PixelBuffer::filled(100, 10, IVec2::ZERO, b);
        for y in 0..10 {
            for x in 70..100 {
                flipped.set_rgb(x, y, a);
            }
        }
        assert_eq!(detect_background(&flipped, 5, 40.0).unwrap(), Some(b));
    }

    #[test]
    fn detection_merges_noisy_samples() {
        let mut buf = PixelBuffer::filled(10, 10, IVec2::ZERO, [100, 100, 100]);
        for x in 0..10 {
            buf.set_rgb(x, 0, [104, 98, 101]);
        }
        let rgb = detect_background(&buf, 1, 40.0).unwrap().unwrap();
        assert!(rgb.iter().all(|c| (98..=104).contains(c)));
    }

    #[test]
    fn adaptive_model_resolves_inline() {
        let model = BackgroundModel::from_config(&ClassifierConfig {
            always_background: vec![],
            ..ClassifierConfig::default()
        });
        assert_eq!(model.reference(), None);
        let mut buf = PixelBuffer::filled(40, 40, IVec2::ZERO, DESK_BLUE);
        buf.set_rgb(10, 10, WINDOW_WHITE);
        let map = classify(&buf, &model, None).unwrap();
        assert_eq!(map.count_solid(), 1);
    }

    #[test]
    fn mask_renders_white_obstacles() {
        let mut map = CollisionMap::permissive(IRect::new(3, 4, 5, 5));
        map.set(1, 0, true);
        let rgba = mask_to_rgba(&map);
        assert_eq!(rgba.origin, IVec2::new(3, 4));
        assert_eq!(rgba.rgb(0, 0), [0, 0, 0]);
        assert_eq!(rgba.rgb(1, 0), [255, 255, 255]);
    }
}
