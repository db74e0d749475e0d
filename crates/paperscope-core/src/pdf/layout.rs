//! Positioned-text pass over a page's content stream.
//!
//! Annotation quad points select text geometrically, so the extractor
//! needs per-character bounding boxes in page coordinates. This walks the
//! content stream tracking the text and transformation matrices, using
//! each font's `/Widths` table for advances (glyph-space fallback 500
//! units). It is a best-effort layout pass, not a full renderer: Type0
//! fonts are decoded as UTF-16BE code units and CID widths are
//! approximated by the em square.

use std::collections::BTreeMap;

use lopdf::content::Content;
use lopdf::{Dictionary, Document, Object, ObjectId};

use crate::error::Result;

/// Approximate glyph extents relative to the baseline, in em units.
const ASCENT: f64 = 0.75;
const DESCENT: f64 = -0.25;

const DEFAULT_GLYPH_WIDTH: f64 = 500.0;

/// A single positioned character, bbox in page coordinates (origin
/// bottom-left, y up).
#[derive(Debug, Clone)]
pub struct CharBox {
    pub text: char,
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

/// A cluster of characters sharing a baseline, ordered left to right.
#[derive(Debug, Clone)]
pub struct TextLine {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
    pub chars: Vec<CharBox>,
}

type Matrix = [f64; 6];

const IDENTITY: Matrix = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];

fn multiply(a: Matrix, b: Matrix) -> Matrix {
    [
        a[0] * b[0] + a[1] * b[2],
        a[0] * b[1] + a[1] * b[3],
        a[2] * b[0] + a[3] * b[2],
        a[2] * b[1] + a[3] * b[3],
        a[4] * b[0] + a[5] * b[2] + b[4],
        a[4] * b[1] + a[5] * b[3] + b[5],
    ]
}

fn translation(tx: f64, ty: f64) -> Matrix {
    [1.0, 0.0, 0.0, 1.0, tx, ty]
}

fn apply(m: Matrix, x: f64, y: f64) -> (f64, f64) {
    (m[0] * x + m[2] * y + m[4], m[1] * x + m[3] * y + m[5])
}

struct FontInfo {
    first_char: i64,
    widths: Vec<f64>,
    default_width: f64,
    two_byte: bool,
}

impl FontInfo {
    fn fallback() -> Self {
        Self {
            first_char: 0,
            widths: Vec::new(),
            default_width: DEFAULT_GLYPH_WIDTH,
            two_byte: false,
        }
    }

    /// Glyph advance in em units (glyph space / 1000).
    fn width(&self, code: u32) -> f64 {
        let index = code as i64 - self.first_char;
        let raw = if index >= 0 {
            self.widths
                .get(index as usize)
                .copied()
                .unwrap_or(self.default_width)
        } else {
            self.default_width
        };
        raw / 1000.0
    }
}

pub(super) fn resolve<'a>(doc: &'a Document, mut object: &'a Object) -> &'a Object {
    while let Object::Reference(id) = object {
        match doc.get_object(*id) {
            Ok(inner) => object = inner,
            Err(_) => break,
        }
    }
    object
}

pub(super) fn number(object: &Object) -> Option<f64> {
    match object {
        Object::Integer(value) => Some(*value as f64),
        Object::Real(value) => Some(f64::from(*value)),
        _ => None,
    }
}

/// Find the page's resource dictionary, following the `Parent` chain for
/// inherited resources.
fn page_resources<'a>(doc: &'a Document, page_id: ObjectId) -> Option<&'a Dictionary> {
    let mut dict = doc.get_object(page_id).ok()?.as_dict().ok()?;
    loop {
        if let Ok(resources) = dict.get(b"Resources") {
            return resolve(doc, resources).as_dict().ok();
        }
        let parent = dict.get(b"Parent").ok()?;
        dict = resolve(doc, parent).as_dict().ok()?;
    }
}

fn load_fonts(doc: &Document, page_id: ObjectId) -> BTreeMap<Vec<u8>, FontInfo> {
    let mut fonts = BTreeMap::new();
    let Some(resources) = page_resources(doc, page_id) else {
        return fonts;
    };
    let Some(font_dict) = resources
        .get(b"Font")
        .ok()
        .map(|o| resolve(doc, o))
        .and_then(|o| o.as_dict().ok())
    else {
        return fonts;
    };

    for (name, font_ref) in font_dict.iter() {
        let Ok(font) = resolve(doc, font_ref).as_dict() else {
            continue;
        };
        let two_byte = matches!(
            font.get(b"Subtype").map(|o| resolve(doc, o)),
            Ok(Object::Name(subtype)) if subtype.as_slice() == b"Type0".as_slice()
        );
        let first_char = font
            .get(b"FirstChar")
            .ok()
            .and_then(|o| number(resolve(doc, o)))
            .map(|n| n as i64)
            .unwrap_or(0);
        let widths = font
            .get(b"Widths")
            .ok()
            .map(|o| resolve(doc, o))
            .and_then(|o| o.as_array().ok())
            .map(|array| {
                array
                    .iter()
                    .filter_map(|w| number(resolve(doc, w)))
                    .collect()
            })
            .unwrap_or_default();
        let default_width = font
            .get(b"FontDescriptor")
            .ok()
            .map(|o| resolve(doc, o))
            .and_then(|o| o.as_dict().ok())
            .and_then(|descriptor| descriptor.get(b"MissingWidth").ok())
            .and_then(number)
            .unwrap_or(if two_byte { 1000.0 } else { DEFAULT_GLYPH_WIDTH });

        fonts.insert(
            name.to_vec(),
            FontInfo {
                first_char,
                widths,
                default_width,
                two_byte,
            },
        );
    }
    fonts
}

struct Interpreter<'a> {
    fonts: &'a BTreeMap<Vec<u8>, FontInfo>,
    ctm: Matrix,
    ctm_stack: Vec<Matrix>,
    text_matrix: Matrix,
    line_matrix: Matrix,
    font: Option<Vec<u8>>,
    size: f64,
    char_spacing: f64,
    word_spacing: f64,
    hscale: f64,
    leading: f64,
    rise: f64,
    chars: Vec<CharBox>,
}

impl<'a> Interpreter<'a> {
    fn new(fonts: &'a BTreeMap<Vec<u8>, FontInfo>) -> Self {
        Self {
            fonts,
            ctm: IDENTITY,
            ctm_stack: Vec::new(),
            text_matrix: IDENTITY,
            line_matrix: IDENTITY,
            font: None,
            size: 0.0,
            char_spacing: 0.0,
            word_spacing: 0.0,
            hscale: 1.0,
            leading: 0.0,
            rise: 0.0,
            chars: Vec::new(),
        }
    }

    fn font_info(&self) -> FontInfo {
        self.font
            .as_ref()
            .and_then(|name| self.fonts.get(name))
            .map(|font| FontInfo {
                first_char: font.first_char,
                widths: font.widths.clone(),
                default_width: font.default_width,
                two_byte: font.two_byte,
            })
            .unwrap_or_else(FontInfo::fallback)
    }

    fn next_line(&mut self, tx: f64, ty: f64) {
        self.line_matrix = multiply(translation(tx, ty), self.line_matrix);
        self.text_matrix = self.line_matrix;
    }

    fn show_text(&mut self, bytes: &[u8]) {
        let font = self.font_info();
        if font.two_byte {
            for pair in bytes.chunks_exact(2) {
                let code = u32::from(u16::from_be_bytes([pair[0], pair[1]]));
                let text = char::from_u32(code).unwrap_or('\u{fffd}');
                self.show_glyph(&font, code, text, false);
            }
        } else {
            for byte in bytes {
                let code = u32::from(*byte);
                // Single-byte encodings map onto Latin-1 closely enough
                // for geometric selection.
                let text = char::from(*byte);
                self.show_glyph(&font, code, text, code == 32);
            }
        }
    }

    fn show_glyph(&mut self, font: &FontInfo, code: u32, text: char, is_space: bool) {
        let trm = multiply(
            multiply(
                [
                    self.size * self.hscale,
                    0.0,
                    0.0,
                    self.size,
                    0.0,
                    self.rise,
                ],
                self.text_matrix,
            ),
            self.ctm,
        );

        let glyph_width = font.width(code);
        let (ax0, ay0) = apply(trm, 0.0, DESCENT);
        let (ax1, ay1) = apply(trm, glyph_width, ASCENT);
        self.chars.push(CharBox {
            text,
            x0: ax0.min(ax1),
            y0: ay0.min(ay1),
            x1: ax0.max(ax1),
            y1: ay0.max(ay1),
        });

        let mut advance = glyph_width * self.size + self.char_spacing;
        if is_space {
            advance += self.word_spacing;
        }
        self.text_matrix = multiply(translation(advance * self.hscale, 0.0), self.text_matrix);
    }

    fn run(&mut self, content: &Content) {
        for op in &content.operations {
            let operands = &op.operands;
            match op.operator.as_str() {
                "BT" => {
                    self.text_matrix = IDENTITY;
                    self.line_matrix = IDENTITY;
                }
                "ET" => {}
                "Tf" => {
                    if let (Some(Object::Name(name)), Some(size)) =
                        (operands.first(), operands.get(1).and_then(number))
                    {
                        self.font = Some(name.clone());
                        self.size = size;
                    }
                }
                "Td" => {
                    if let (Some(tx), Some(ty)) = (
                        operands.first().and_then(number),
                        operands.get(1).and_then(number),
                    ) {
                        self.next_line(tx, ty);
                    }
                }
                "TD" => {
                    if let (Some(tx), Some(ty)) = (
                        operands.first().and_then(number),
                        operands.get(1).and_then(number),
                    ) {
                        self.leading = -ty;
                        self.next_line(tx, ty);
                    }
                }
                "TL" => {
                    if let Some(leading) = operands.first().and_then(number) {
                        self.leading = leading;
                    }
                }
                "T*" => {
                    let leading = self.leading;
                    self.next_line(0.0, -leading);
                }
                "Tm" => {
                    let values: Vec<f64> = operands.iter().filter_map(number).collect();
                    if values.len() == 6 {
                        let m = [
                            values[0], values[1], values[2], values[3], values[4], values[5],
                        ];
                        self.text_matrix = m;
                        self.line_matrix = m;
                    }
                }
                "Tc" => {
                    if let Some(value) = operands.first().and_then(number) {
                        self.char_spacing = value;
                    }
                }
                "Tw" => {
                    if let Some(value) = operands.first().and_then(number) {
                        self.word_spacing = value;
                    }
                }
                "Tz" => {
                    if let Some(value) = operands.first().and_then(number) {
                        self.hscale = value / 100.0;
                    }
                }
                "Ts" => {
                    if let Some(value) = operands.first().and_then(number) {
                        self.rise = value;
                    }
                }
                "Tj" => {
                    if let Some(Object::String(bytes, _)) = operands.first() {
                        self.show_text(bytes);
                    }
                }
                "'" => {
                    if let Some(Object::String(bytes, _)) = operands.first() {
                        let leading = self.leading;
                        self.next_line(0.0, -leading);
                        self.show_text(bytes);
                    }
                }
                "\"" => {
                    if let (Some(aw), Some(ac), Some(Object::String(bytes, _))) = (
                        operands.first().and_then(number),
                        operands.get(1).and_then(number),
                        operands.get(2),
                    ) {
                        self.word_spacing = aw;
                        self.char_spacing = ac;
                        let leading = self.leading;
                        self.next_line(0.0, -leading);
                        self.show_text(&bytes.clone());
                    }
                }
                "TJ" => {
                    if let Some(Object::Array(items)) = operands.first() {
                        for item in items {
                            match item {
                                Object::String(bytes, _) => self.show_text(bytes),
                                other => {
                                    if let Some(adjust) = number(other) {
                                        let tx =
                                            -adjust / 1000.0 * self.size * self.hscale;
                                        self.text_matrix =
                                            multiply(translation(tx, 0.0), self.text_matrix);
                                    }
                                }
                            }
                        }
                    }
                }
                "q" => self.ctm_stack.push(self.ctm),
                "Q" => {
                    if let Some(ctm) = self.ctm_stack.pop() {
                        self.ctm = ctm;
                    }
                }
                "cm" => {
                    let values: Vec<f64> = operands.iter().filter_map(number).collect();
                    if values.len() == 6 {
                        let m = [
                            values[0], values[1], values[2], values[3], values[4], values[5],
                        ];
                        self.ctm = multiply(m, self.ctm);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Extract positioned text lines from a page, top to bottom.
pub fn page_lines(doc: &Document, page_id: ObjectId) -> Result<Vec<TextLine>> {
    let data = doc.get_page_content(page_id)?;
    let content = Content::decode(&data)?;
    let fonts = load_fonts(doc, page_id);

    let mut interpreter = Interpreter::new(&fonts);
    interpreter.run(&content);

    Ok(group_lines(interpreter.chars))
}

/// Cluster characters into lines by their bottom edge, then order lines
/// top to bottom and characters left to right.
fn group_lines(mut chars: Vec<CharBox>) -> Vec<TextLine> {
    chars.sort_by(|a, b| b.y0.total_cmp(&a.y0));

    let mut lines: Vec<Vec<CharBox>> = Vec::new();
    let mut current_y = f64::INFINITY;

    for c in chars {
        let tolerance = ((c.y1 - c.y0) * 0.5).max(1.0);
        if lines.is_empty() || (current_y - c.y0).abs() > tolerance {
            current_y = c.y0;
            lines.push(Vec::new());
        }
        lines.last_mut().expect("just pushed").push(c);
    }

    lines
        .into_iter()
        .map(|mut chars| {
            chars.sort_by(|a, b| a.x0.total_cmp(&b.x0));
            let x0 = chars.iter().map(|c| c.x0).fold(f64::INFINITY, f64::min);
            let y0 = chars.iter().map(|c| c.y0).fold(f64::INFINITY, f64::min);
            let x1 = chars.iter().map(|c| c.x1).fold(f64::NEG_INFINITY, f64::max);
            let y1 = chars.iter().map(|c| c.y1).fold(f64::NEG_INFINITY, f64::max);
            TextLine {
                x0,
                y0,
                x1,
                y1,
                chars,
            }
        })
        .collect()
}

/// The rectangles described by an annotation's `QuadPoints`, one per
/// consecutive 8-tuple.
pub struct QuadRegions {
    rects: Vec<[f64; 4]>,
}

impl QuadRegions {
    pub fn new(quad_points: &[f64]) -> Self {
        let rects = quad_points
            .chunks_exact(8)
            .filter_map(|quad| {
                let xs = [quad[0], quad[2], quad[4], quad[6]];
                let ys = [quad[1], quad[3], quad[5], quad[7]];
                let x0 = xs.iter().copied().fold(f64::INFINITY, f64::min);
                let x1 = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let y0 = ys.iter().copied().fold(f64::INFINITY, f64::min);
                let y1 = ys.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                (x1 > x0 && y1 > y0).then_some([x0, y0, x1, y1])
            })
            .collect();
        Self { rects }
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    /// Non-degenerate intersection with any region.
    pub fn intersects(&self, x0: f64, y0: f64, x1: f64, y1: f64) -> bool {
        self.rects.iter().any(|r| {
            let ix0 = r[0].max(x0);
            let iy0 = r[1].max(y0);
            let ix1 = r[2].min(x1);
            let iy1 = r[3].min(y1);
            ix1 > ix0 && iy1 > iy0
        })
    }

    /// Full containment of the target, after shrinking it 1% toward its
    /// center as tolerance for boundary-touching glyphs.
    pub fn contains(&self, x0: f64, y0: f64, x1: f64, y1: f64) -> bool {
        let rate = 0.01;
        let cx = (x0 + x1) / 2.0;
        let cy = (y0 + y1) / 2.0;
        let sx0 = x0 + (cx - x0) * rate;
        let sy0 = y0 + (cy - y0) * rate;
        let sx1 = x1 + (cx - x1) * rate;
        let sy1 = y1 + (cy - y1) * rate;
        self.rects
            .iter()
            .any(|r| r[0] <= sx0 && sx1 <= r[2] && r[1] <= sy0 && sy1 <= r[3])
    }
}

/// Resolve the text selected by an annotation's quad points: characters
/// contained in a region, per line, lines ordered top to bottom.
pub fn selected_text(lines: &[TextLine], quad_points: &[f64]) -> Option<String> {
    let regions = QuadRegions::new(quad_points);
    if regions.is_empty() {
        return None;
    }

    let mut ordered: Vec<&TextLine> = lines.iter().collect();
    ordered.sort_by(|a, b| b.y1.total_cmp(&a.y1));

    let mut selected: Vec<String> = Vec::new();
    for line in ordered {
        if !regions.intersects(line.x0, line.y0, line.x1, line.y1) {
            continue;
        }
        let text: String = line
            .chars
            .iter()
            .filter(|c| regions.contains(c.x0, c.y0, c.x1, c.y1))
            .map(|c| c.text)
            .collect();
        selected.push(text);
    }

    if selected.is_empty() {
        None
    } else {
        Some(selected.join("\n"))
    }
}
