//! Template-matching OCR for simple text captchas.
//!
//! The image is binarized with Otsu's threshold, split into glyphs at blank
//! columns, and each glyph is cropped to its ink and sampled onto a fixed
//! grid. Glyphs are matched against per-character templates by Hamming
//! distance.

use std::path::Path;
use std::sync::Arc;

use image::{DynamicImage, GrayImage};

use crate::error::{BrisaError, BrisaResult};

/// Glyph grid width.
const GLYPH_WIDTH: u32 = 12;

/// Glyph grid height.
const GLYPH_HEIGHT: u32 = 16;

/// Mean similarity below which a guess is reported as low-confidence.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.75;

#[derive(Debug, Clone, PartialEq)]
struct Template {
    ch: char,
    bits: Vec<bool>,
}

/// OCR output for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub text: String,
    /// Mean glyph similarity, in `0.0..=1.0`.
    pub confidence: f64,
}

impl Recognition {
    pub fn is_confident(&self, threshold: f64) -> bool {
        !self.text.is_empty() && self.confidence >= threshold
    }
}

#[derive(Debug, Clone)]
pub struct OcrSolver {
    templates: Arc<Vec<Template>>,
    threshold: f64,
}

impl Default for OcrSolver {
    fn default() -> Self {
        Self {
            templates: Arc::new(Vec::new()),
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

impl OcrSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    /// Load templates from `<char>.png` or `<char>_<n>.png` files in `dir`.
    pub fn from_dir(dir: &Path) -> BrisaResult<Self> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("png"))
            })
            .collect();
        entries.sort();

        let mut solver = Self::default();
        for path in entries {
            let Some(ch) = template_char(&path) else {
                continue;
            };
            let img = image::open(&path).map_err(|e| {
                BrisaError::Config(format!("cannot read template {}: {e}", path.display()))
            })?;
            solver.add_template(ch, &img)?;
        }

        if solver.templates.is_empty() {
            return Err(BrisaError::Config(format!(
                "no <char>.png templates found in {}",
                dir.display()
            )));
        }
        tracing::info!(count = solver.templates.len(), dir = %dir.display(), "loaded ocr templates");
        Ok(solver)
    }

    /// Register `img` as the template for `ch`. The whole ink area is one glyph.
    pub fn add_template(&mut self, ch: char, img: &DynamicImage) -> BrisaResult<()> {
        let ink = binarize(&img.to_luma8());
        let (width, _) = ink.dimensions();
        let bits = bounding_box(&ink, 0, width)
            .map(|(x0, x1, y0, y1)| sample(&ink, x0, x1, y0, y1))
            .ok_or_else(|| BrisaError::Config(format!("template for '{ch}' has no ink")))?;
        Arc::make_mut(&mut self.templates).push(Template { ch, bits });
        Ok(())
    }

    /// Read the text in an encoded image.
    pub fn recognize(&self, bytes: &[u8]) -> BrisaResult<Recognition> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| BrisaError::solve_failed("captcha image could not be decoded", Some(Box::new(e))))?;
        let ink = binarize(&img.to_luma8());

        if self.templates.is_empty() {
            return Err(BrisaError::solve_failed("no ocr templates loaded", None));
        }

        let mut text = String::new();
        let mut total = 0.0;
        for (x0, x1) in column_runs(&ink) {
            let Some((x0, x1, y0, y1)) = bounding_box(&ink, x0, x1) else {
                continue;
            };
            let glyph = sample(&ink, x0, x1, y0, y1);
            let (ch, score) = self.best_match(&glyph);
            text.push(ch);
            total += score;
        }

        let glyphs = text.chars().count();
        let confidence = if glyphs == 0 { 0.0 } else { total / glyphs as f64 };
        Ok(Recognition { text, confidence })
    }

    fn best_match(&self, glyph: &[bool]) -> (char, f64) {
        let cells = (GLYPH_WIDTH * GLYPH_HEIGHT) as f64;
        self.templates
            .iter()
            .map(|t| {
                let distance = t.bits.iter().zip(glyph).filter(|(a, b)| a != b).count();
                (t.ch, 1.0 - distance as f64 / cells)
            })
            .fold(('?', 0.0), |best, cur| if cur.1 > best.1 { cur } else { best })
    }
}

fn template_char(path: &Path) -> Option<char> {
    let stem = path.file_stem()?.to_str()?;
    let label = match stem.split_once('_') {
        Some((label, n)) if !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()) => label,
        _ => stem,
    };
    let mut chars = label.chars();
    let ch = chars.next()?;
    chars.next().is_none().then_some(ch)
}

/// Otsu threshold over the grey-level histogram.
fn otsu_threshold(gray: &GrayImage) -> u8 {
    let mut hist = [0u64; 256];
    for p in gray.pixels() {
        hist[p.0[0] as usize] += 1;
    }
    let total: u64 = hist.iter().sum();
    let sum: f64 = hist.iter().enumerate().map(|(i, &n)| i as f64 * n as f64).sum();

    let mut sum_b = 0.0;
    let mut w_b = 0u64;
    let mut best = 0.0;
    let mut threshold = 0u8;
    for (i, &n) in hist.iter().enumerate() {
        w_b += n;
        if w_b == 0 {
            continue;
        }
        let w_f = total - w_b;
        if w_f == 0 {
            break;
        }
        sum_b += i as f64 * n as f64;
        let m_b = sum_b / w_b as f64;
        let m_f = (sum - sum_b) / w_f as f64;
        let between = w_b as f64 * w_f as f64 * (m_b - m_f).powi(2);
        if between > best {
            best = between;
            threshold = i as u8;
        }
    }
    threshold
}

/// Ink mask, assuming ink covers less than half the image.
fn binarize(gray: &GrayImage) -> Ink {
    let t = otsu_threshold(gray);
    let (width, height) = gray.dimensions();
    let mut bits: Vec<bool> = gray.pixels().map(|p| p.0[0] <= t).collect();
    let inked = bits.iter().filter(|b| **b).count();
    if inked * 2 > bits.len() {
        bits.iter_mut().for_each(|b| *b = !*b);
    }
    Ink { width, height, bits }
}

struct Ink {
    width: u32,
    height: u32,
    bits: Vec<bool>,
}

impl Ink {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn at(&self, x: u32, y: u32) -> bool {
        self.bits[(y * self.width + x) as usize]
    }

    fn column_has_ink(&self, x: u32) -> bool {
        (0..self.height).any(|y| self.at(x, y))
    }
}

/// Half-open `[start, end)` ranges of consecutive inked columns.
fn column_runs(ink: &Ink) -> Vec<(u32, u32)> {
    let mut runs = Vec::new();
    let mut start = None;
    for x in 0..ink.width {
        match (ink.column_has_ink(x), start) {
            (true, None) => start = Some(x),
            (false, Some(s)) => {
                runs.push((s, x));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push((s, ink.width));
    }
    runs
}

/// Tight `(x0, x1, y0, y1)` box, half-open, of the ink within columns `[x0, x1)`.
fn bounding_box(ink: &Ink, x0: u32, x1: u32) -> Option<(u32, u32, u32, u32)> {
    let cols: Vec<u32> = (x0..x1).filter(|&x| ink.column_has_ink(x)).collect();
    let (&left, &right) = (cols.first()?, cols.last()?);
    let rows: Vec<u32> = (0..ink.height)
        .filter(|&y| (left..=right).any(|x| ink.at(x, y)))
        .collect();
    let (&top, &bottom) = (rows.first()?, rows.last()?);
    Some((left, right + 1, top, bottom + 1))
}

/// Nearest-neighbour sample of a box onto the glyph grid.
fn sample(ink: &Ink, x0: u32, x1: u32, y0: u32, y1: u32) -> Vec<bool> {
    let (w, h) = (x1 - x0, y1 - y0);
    let mut bits = Vec::with_capacity((GLYPH_WIDTH * GLYPH_HEIGHT) as usize);
    for gy in 0..GLYPH_HEIGHT {
        let sy = y0 + ((2 * gy + 1) * h) / (2 * GLYPH_HEIGHT);
        for gx in 0..GLYPH_WIDTH {
            let sx = x0 + ((2 * gx + 1) * w) / (2 * GLYPH_WIDTH);
            bits.push(ink.at(sx, sy));
        }
    }
    bits
}
