use crate::error::RigPlotError;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Metrics extracted from the binary font tables (`head`, `hhea`, `maxp`,
/// `hmtx`, `cmap`, `OS/2`), rescaled to a 1000-unit em as PDF font objects
/// expect.
#[derive(Debug)]
pub struct FontMetrics {
    pub first_char: u8,
    pub last_char: u8,
    pub widths: Vec<u16>,
    pub glyph_ids: Vec<u16>,
    pub ascent: i16,
    pub descent: i16,
    pub line_gap: i16,
    pub cap_height: i16,
    pub italic_angle: i16,
    pub stem_v: i16,
    pub bbox: (i16, i16, i16, i16),
    pub missing_width: u16,
    pub is_fixed_pitch: bool,
    symbolic: bool,
}

#[derive(Debug)]
pub struct RegisteredFont {
    pub name: String,
    pub data: Vec<u8>,
    pub metrics: FontMetrics,
}

/// Fonts available for embedding, looked up by any of the face's names.
/// Unresolvable families degrade to a base-14 standard font at export time;
/// registration failures are reported here and logged, never fatal.
#[derive(Debug, Default)]
pub struct FontRegistry {
    fonts: Vec<RegisteredFont>,
    lookup: HashMap<String, usize>,
}

impl FontRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_dir(&mut self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let Ok(entries) = fs::read_dir(path) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_font = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| {
                    let ext = ext.to_ascii_lowercase();
                    ext == "ttf" || ext == "otf"
                })
                .unwrap_or(false);
            if path.is_file() && is_font {
                if let Err(err) = self.register_file(&path) {
                    warn!(path = %path.display(), %err, "skipping font");
                }
            }
        }
    }

    pub fn register_file(&mut self, path: impl AsRef<Path>) -> Result<String, RigPlotError> {
        let path = path.as_ref();
        let data = fs::read(path)
            .map_err(|err| RigPlotError::Font(format!("{}: {err}", path.display())))?;
        let source = path
            .file_stem()
            .and_then(|v| v.to_str())
            .unwrap_or("EmbeddedFont");
        self.register_bytes(data, Some(source))
    }

    pub fn register_bytes(
        &mut self,
        data: Vec<u8>,
        source_name: Option<&str>,
    ) -> Result<String, RigPlotError> {
        let source = source_name.unwrap_or("EmbeddedFont");
        let Ok(face) = ttf_parser::Face::parse(&data, 0) else {
            return Err(RigPlotError::Font(format!(
                "invalid or truncated font data for {source}"
            )));
        };
        if face.tables().cff.is_some() {
            // CFF outlines would need a FontFile3 program; the plan exporter
            // embeds TrueType only and substitutes otherwise.
            return Err(RigPlotError::Font(format!(
                "{source} carries CFF outlines; only TrueType programs are embedded"
            )));
        }

        let (name, aliases) = font_names(&face, source);
        let metrics = FontMetrics::from_face(&face);
        let index = self.fonts.len();
        self.fonts.push(RegisteredFont {
            name: name.clone(),
            data,
            metrics,
        });

        let mut all_aliases = vec![name.clone()];
        all_aliases.extend(aliases);
        for alias in all_aliases {
            let key = normalize_name(&alias);
            if key.is_empty() || self.lookup.contains_key(&key) {
                continue;
            }
            self.lookup.insert(key, index);
        }

        Ok(name)
    }

    pub fn resolve(&self, name: &str) -> Option<&RegisteredFont> {
        let key = normalize_name(name);
        self.lookup
            .get(&key)
            .and_then(|index| self.fonts.get(*index))
    }

    pub fn len(&self) -> usize {
        self.fonts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fonts.is_empty()
    }

    /// Text advance in points. Unresolved families use the classic 0.6 em
    /// per character estimate, which matches what the screen canvas assumes
    /// before a face is loaded.
    pub fn measure_text_width(&self, name: &str, font_size: f32, text: &str) -> f32 {
        match self.resolve(name) {
            Some(font) => font.metrics.measure_text_width(font_size, text),
            None => font_size * 0.6 * text.chars().count() as f32,
        }
    }

    pub fn line_height(&self, name: &str, font_size: f32, fallback: f32) -> f32 {
        let Some(font) = self.resolve(name) else {
            return fallback;
        };
        font.metrics.line_height(font_size).max(fallback)
    }
}

impl FontMetrics {
    fn from_face(face: &ttf_parser::Face<'_>) -> Self {
        let units_per_em = face.units_per_em().max(1);
        let scale = 1000.0 / units_per_em as f32;
        let first_char = 32u8;
        let last_char = 255u8;
        let (symbolic, symbol_subtable) = select_symbol_subtable(face);
        let glyph_ids = build_glyph_ids(face, first_char, last_char, symbol_subtable);
        let widths = build_widths(face, scale, first_char, last_char, symbol_subtable);
        let missing_width = widths
            .get((b' ' - first_char) as usize)
            .copied()
            .unwrap_or(0);

        let ascent = scale_i16(face.ascender(), scale);
        let descent = scale_i16(face.descender(), scale);
        let line_gap = scale_i16(face.line_gap(), scale);
        let cap_height = face
            .capital_height()
            .map(|value| scale_i16(value, scale))
            .unwrap_or(ascent);
        let bbox = face.global_bounding_box();
        let bbox = (
            scale_i16(bbox.x_min, scale),
            scale_i16(bbox.y_min, scale),
            scale_i16(bbox.x_max, scale),
            scale_i16(bbox.y_max, scale),
        );
        let italic_angle = face
            .italic_angle()
            .map(|value| value.round() as i16)
            .unwrap_or(0);

        Self {
            first_char,
            last_char,
            widths,
            glyph_ids,
            ascent,
            descent,
            line_gap,
            cap_height,
            italic_angle,
            stem_v: 80,
            bbox,
            missing_width,
            is_fixed_pitch: face.is_monospaced(),
            symbolic,
        }
    }

    pub fn is_symbolic(&self) -> bool {
        self.symbolic
    }

    fn advance_for_char(&self, ch: char) -> u16 {
        let code = ch as u32;
        let first = self.first_char as u32;
        let last = self.last_char as u32;
        if code < first || code > last {
            return self.missing_width;
        }
        let idx = (code - first) as usize;
        self.widths.get(idx).copied().unwrap_or(self.missing_width)
    }

    pub fn measure_text_width(&self, font_size: f32, text: &str) -> f32 {
        let mut total_units: i64 = 0;
        for ch in text.chars() {
            total_units += self.advance_for_char(ch) as i64;
        }
        if total_units <= 0 {
            return 0.0;
        }
        font_size * total_units as f32 / 1000.0
    }

    pub fn line_height(&self, font_size: f32) -> f32 {
        let height_1000 = self.ascent as i32 - self.descent as i32 + self.line_gap as i32;
        if height_1000 <= 0 {
            return 0.0;
        }
        font_size * height_1000 as f32 / 1000.0
    }
}

fn select_symbol_subtable<'a>(
    face: &'a ttf_parser::Face<'a>,
) -> (bool, Option<ttf_parser::cmap::Subtable<'a>>) {
    let Some(cmap) = face.tables().cmap else {
        return (false, None);
    };
    let mut first = None;
    let mut symbol = None;
    let mut has_unicode = false;
    for subtable in cmap.subtables {
        if first.is_none() {
            first = Some(subtable);
        }
        if subtable.platform_id == ttf_parser::name::PlatformId::Windows
            && subtable.encoding_id == 0
        {
            symbol = Some(subtable);
        }
        if subtable.is_unicode() {
            has_unicode = true;
        }
    }
    if has_unicode {
        (false, None)
    } else {
        (symbol.is_some(), symbol.or(first))
    }
}

fn build_glyph_ids(
    face: &ttf_parser::Face<'_>,
    first: u8,
    last: u8,
    fallback: Option<ttf_parser::cmap::Subtable<'_>>,
) -> Vec<u16> {
    let mut glyphs = Vec::with_capacity((last - first + 1) as usize);
    for code in first..=last {
        let gid = glyph_index_for_codepoint(face, code as u32, fallback)
            .map(|g| g.0)
            .unwrap_or(0);
        glyphs.push(gid);
    }
    glyphs
}

fn glyph_index_for_codepoint<'a>(
    face: &'a ttf_parser::Face<'a>,
    codepoint: u32,
    fallback: Option<ttf_parser::cmap::Subtable<'a>>,
) -> Option<ttf_parser::GlyphId> {
    if let Some(ch) = char::from_u32(codepoint) {
        if let Some(id) = face.glyph_index(ch) {
            return Some(id);
        }
    }
    if let Some(subtable) = fallback {
        if let Some(id) = subtable.glyph_index(codepoint) {
            return Some(id);
        }
        // Symbol fonts map their glyphs into the F000 private use block.
        let symbol_codepoint = codepoint + 0xF000;
        return subtable.glyph_index(symbol_codepoint);
    }
    None
}

fn build_widths(
    face: &ttf_parser::Face<'_>,
    scale: f32,
    first: u8,
    last: u8,
    fallback: Option<ttf_parser::cmap::Subtable<'_>>,
) -> Vec<u16> {
    let mut widths = Vec::with_capacity((last - first + 1) as usize);
    for code in first..=last {
        let width = glyph_index_for_codepoint(face, code as u32, fallback)
            .and_then(|id| face.glyph_hor_advance(id))
            .unwrap_or(0);
        let scaled = (width as f32 * scale).round() as i32;
        widths.push(scaled.clamp(0, u16::MAX as i32) as u16);
    }
    widths
}

fn scale_i16(value: i16, scale: f32) -> i16 {
    let scaled = (value as f32 * scale).round() as i32;
    scaled.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

fn font_names(face: &ttf_parser::Face<'_>, source: &str) -> (String, Vec<String>) {
    use ttf_parser::name::name_id;

    let mut family = None;
    let mut full = None;
    let mut post = None;

    for entry in face.names() {
        let Some(name) = entry.to_string() else {
            continue;
        };
        match entry.name_id {
            name_id::TYPOGRAPHIC_FAMILY | name_id::FAMILY => {
                if family.is_none() {
                    family = Some(name);
                }
            }
            name_id::FULL_NAME => {
                if full.is_none() {
                    full = Some(name);
                }
            }
            name_id::POST_SCRIPT_NAME => {
                if post.is_none() {
                    post = Some(name);
                }
            }
            _ => {}
        }
    }

    let primary = post
        .clone()
        .or_else(|| full.clone())
        .or_else(|| family.clone())
        .unwrap_or_else(|| source.to_string());

    let mut aliases = Vec::new();
    for candidate in [family, full, post, Some(source.to_string())]
        .into_iter()
        .flatten()
    {
        if candidate != primary {
            aliases.push(candidate);
        }
    }

    (primary, aliases)
}

pub(crate) fn normalize_name(name: &str) -> String {
    name.trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_bytes_are_rejected_not_panicked() {
        let mut registry = FontRegistry::new();
        let result = registry.register_bytes(vec![0xDE, 0xAD, 0xBE, 0xEF], Some("bogus"));
        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn truncated_font_is_rejected() {
        // A plausible sfnt header with the table directory cut off mid-way.
        let mut data = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x09, 0x00, 0x80];
        data.extend_from_slice(&[0x00; 10]);
        let mut registry = FontRegistry::new();
        assert!(registry.register_bytes(data, Some("chopped")).is_err());
    }

    #[test]
    fn unresolved_family_uses_heuristic_width() {
        let registry = FontRegistry::new();
        let width = registry.measure_text_width("NoSuchFamily", 10.0, "plan");
        assert!((width - 4.0 * 6.0).abs() < 1e-3);
    }

    #[test]
    fn name_normalization_strips_quotes_and_case() {
        assert_eq!(normalize_name(" \"Helvetica Neue\" "), "helvetica neue");
        assert_eq!(normalize_name("'Roboto'"), "roboto");
    }
}
