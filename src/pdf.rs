use crate::command::{Command, CommandBuffer, StrokeStyle, TextAlign, GRID_SOURCE_KEY};
use crate::error::RigPlotError;
use crate::flate::zlib_compress;
use crate::font::FontRegistry;
use crate::layout::{
    paint_order, ElementContent, EventTable, Legend, PageElement, PlanViewElement, TextBox,
};
use crate::symbol::SymbolSnapshot;
use crate::types::{
    Affine, Bounds, Color, Margins, Orientation, Point, Pt, Rect, Size, Transform, ViewState,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

const PDF_CATALOG_ID: usize = 1;
const PDF_PAGES_ID: usize = 2;
const PDF_RESOURCES_ID: usize = 3;

/// Cubic Bezier circle approximation constant.
const BEZIER_K: f32 = 0.552_284_75;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageSetup {
    pub size: Size,
    pub orientation: Orientation,
    pub margins: Margins,
}

impl Default for PageSetup {
    fn default() -> Self {
        Self {
            size: Size::a4(),
            orientation: Orientation::Portrait,
            margins: Margins::all(36.0),
        }
    }
}

impl PageSetup {
    /// Physical page size with orientation applied.
    pub fn page_size(&self) -> Size {
        match self.orientation {
            Orientation::Portrait => self.size,
            Orientation::Landscape => self.size.rotated(),
        }
    }

    /// The printable frame inside the margins, top-left origin.
    pub fn content_frame(&self) -> Rect {
        let size = self.page_size();
        Rect {
            x: self.margins.left,
            y: self.margins.top,
            width: size.width - self.margins.left - self.margins.right,
            height: size.height - self.margins.top - self.margins.bottom,
        }
    }
}

/// Host-facing configuration surface of the exporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportOptions {
    pub page: PageSetup,
    /// Decimal places used when formatting content-stream coordinates.
    pub precision: u8,
    /// Consumed by the recording canvas; carried here so the host persists
    /// one options block for the whole pipeline.
    pub simplify_footprints: bool,
    pub include_grid: bool,
    pub compress_streams: bool,
    /// Scale recorded stroke widths by the page mapping so wireframes keep
    /// their on-screen weight ratio on paper.
    pub scale_stroke_widths: bool,
    pub title: Option<String>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            page: PageSetup::default(),
            precision: 3,
            simplify_footprints: true,
            include_grid: true,
            compress_streams: true,
            scale_stroke_widths: true,
            title: None,
        }
    }
}

/// Outcome handed back to the caller. A library call: no partial results, no
/// exit codes.
#[derive(Debug, Clone)]
pub struct ExportResult {
    pub success: bool,
    pub message: String,
}

/// Uniform mapping from recorded coordinates (top-left origin, y down) into
/// PDF user space (bottom-left origin, y up).
#[derive(Debug, Clone, Copy)]
struct PageMap {
    scale: f32,
    tx: f32,
    ty: f32,
    page_height: f32,
    flip_y: bool,
}

impl PageMap {
    fn for_view(frame: &Rect, view: &ViewState, page_height: f32) -> Self {
        let frame_w = frame.width.to_f32();
        let frame_h = frame.height.to_f32();
        let fit = (frame_w / view.viewport_width).min(frame_h / view.viewport_height);
        let scale = fit * view.zoom;
        Self {
            scale,
            tx: frame.x.to_f32() - view.pan_x * scale,
            ty: frame.y.to_f32() - view.pan_y * scale,
            page_height,
            flip_y: true,
        }
    }

    fn for_frame(frame: &Rect, page_height: f32) -> Self {
        Self {
            scale: 1.0,
            tx: frame.x.to_f32(),
            ty: frame.y.to_f32(),
            page_height,
            flip_y: true,
        }
    }

    /// Identity map used inside Form XObject content; the placement matrix
    /// carries scale and flip.
    fn local() -> Self {
        Self {
            scale: 1.0,
            tx: 0.0,
            ty: 0.0,
            page_height: 0.0,
            flip_y: false,
        }
    }

    fn map(&self, p: Point) -> (f32, f32) {
        let x = self.tx + p.x * self.scale;
        let y = self.ty + p.y * self.scale;
        if self.flip_y {
            (x, self.page_height - y)
        } else {
            (x, y)
        }
    }

    fn as_affine(&self) -> Affine {
        if self.flip_y {
            Affine {
                a: self.scale,
                b: 0.0,
                c: 0.0,
                d: -self.scale,
                e: self.tx,
                f: self.page_height - self.ty,
            }
        } else {
            Affine {
                a: self.scale,
                b: 0.0,
                c: 0.0,
                d: self.scale,
                e: self.tx,
                f: self.ty,
            }
        }
    }
}

/// Flat, append-only object store. Bodies are only ever appended (or filled
/// into a slot reserved up front), never mutated, so object numbers are
/// stable once assigned.
struct ObjectTable {
    slots: Vec<Option<Vec<u8>>>,
}

impl ObjectTable {
    fn with_reserved(count: usize) -> Self {
        Self {
            slots: vec![None; count],
        }
    }

    fn push(&mut self, body: Vec<u8>) -> usize {
        self.slots.push(Some(body));
        self.slots.len()
    }

    fn set(&mut self, id: usize, body: Vec<u8>) {
        self.slots[id - 1] = Some(body);
    }

    fn finish(self) -> Result<Vec<Vec<u8>>, RigPlotError> {
        let mut bodies = Vec::with_capacity(self.slots.len());
        for (index, slot) in self.slots.into_iter().enumerate() {
            match slot {
                Some(body) => bodies.push(body),
                None => {
                    return Err(RigPlotError::Internal(format!(
                        "object {} was reserved but never written",
                        index + 1
                    )));
                }
            }
        }
        Ok(bodies)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamFontKind {
    Base14,
    TrueTypeWinAnsi,
}

struct StreamFont {
    logical_name: String,
    base_font: String,
    resource: String,
    kind: StreamFontKind,
}

/// Fonts actually used by the streams of one export, in first-use order of
/// their `/F{n}` resources.
struct FontTable<'a> {
    registry: Option<&'a FontRegistry>,
    fonts: BTreeMap<String, StreamFont>,
    next_resource: usize,
    fallbacks_logged: HashSet<String>,
}

impl<'a> FontTable<'a> {
    fn new(registry: Option<&'a FontRegistry>) -> Self {
        Self {
            registry,
            fonts: BTreeMap::new(),
            next_resource: 1,
            fallbacks_logged: HashSet::new(),
        }
    }

    fn ensure(&mut self, family: &str) -> String {
        let key = crate::font::normalize_name(family);
        if let Some(font) = self.fonts.get(&key) {
            return font.resource.clone();
        }

        let resource = format!("F{}", self.next_resource);
        self.next_resource += 1;

        let (kind, base_font) = if self
            .registry
            .map(|registry| registry.resolve(family).is_some())
            .unwrap_or(false)
        {
            (StreamFontKind::TrueTypeWinAnsi, sanitize_font_name(family))
        } else {
            let base = base14_substitute(family);
            if !is_base14_font(family) && self.fallbacks_logged.insert(key.clone()) {
                warn!(family, substitute = %base, "font not embeddable, substituting standard font");
            }
            (StreamFontKind::Base14, base)
        };

        self.fonts.insert(
            key,
            StreamFont {
                logical_name: family.to_string(),
                base_font,
                resource: resource.clone(),
                kind,
            },
        );
        resource
    }

    fn measure(&self, family: &str, size: f32, text: &str) -> f32 {
        match self.registry {
            Some(registry) => registry.measure_text_width(family, size, text),
            None => size * 0.6 * text.chars().count() as f32,
        }
    }
}

/// Where the content of a referenced symbol comes from.
enum FormSource {
    Inline(CommandBuffer),
    Snapshot(u32),
}

struct FormEntry {
    resource: String,
    source: FormSource,
    bounds: Bounds,
    object_id: usize,
}

/// Referenced symbols of one export, keyed both ways.
struct SymbolPlan {
    forms: Vec<FormEntry>,
    by_key: HashMap<String, usize>,
    by_id: HashMap<u32, usize>,
}

/// Exports recorded plan buffers to PDF. Pure and synchronous: the whole
/// file is assembled in memory and written with one sequential write at the
/// end; a failure leaves at most a truncated file and is reported, not
/// retried.
pub struct PlanExporter<'a> {
    options: ExportOptions,
    fonts: Option<&'a FontRegistry>,
}

impl<'a> PlanExporter<'a> {
    pub fn new(options: ExportOptions) -> Self {
        Self {
            options,
            fonts: None,
        }
    }

    pub fn with_fonts(mut self, registry: &'a FontRegistry) -> Self {
        self.fonts = Some(registry);
        self
    }

    pub fn options(&self) -> &ExportOptions {
        &self.options
    }

    /// Single-view export: the buffer fills the printable frame.
    pub fn export(
        &self,
        buffer: &CommandBuffer,
        symbols: &SymbolSnapshot,
        view: &ViewState,
        path: impl AsRef<Path>,
    ) -> ExportResult {
        let element = PageElement::new(
            self.options.page.content_frame(),
            0,
            ElementContent::PlanView(PlanViewElement {
                buffer: buffer.clone(),
                view: *view,
                framed: false,
            }),
        );
        self.export_composition(std::slice::from_ref(&element), symbols, path)
    }

    /// Multi-element export: plan views, legends, event tables and text
    /// boxes composited onto one page.
    pub fn export_composition(
        &self,
        elements: &[PageElement],
        symbols: &SymbolSnapshot,
        path: impl AsRef<Path>,
    ) -> ExportResult {
        let path = path.as_ref();
        match self.run(elements, symbols, path) {
            Ok((objects, bytes)) => {
                let message = format!(
                    "exported {} ({objects} objects, {bytes} bytes)",
                    path.display()
                );
                info!(%message);
                ExportResult {
                    success: true,
                    message,
                }
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "export failed");
                ExportResult {
                    success: false,
                    message: err.to_string(),
                }
            }
        }
    }

    fn run(
        &self,
        elements: &[PageElement],
        symbols: &SymbolSnapshot,
        path: &Path,
    ) -> Result<(usize, usize), RigPlotError> {
        validate(elements, symbols, path, &self.options)?;

        let page_size = self.options.page.page_size();
        let page_height = page_size.height.to_f32();
        let mut objects = ObjectTable::with_reserved(PDF_RESOURCES_ID);
        let mut fonts = FontTable::new(self.fonts);
        let mut plan = collect_symbols(elements, symbols)?;

        // Symbol definitions become self-contained Form XObject streams.
        for index in 0..plan.forms.len() {
            let content = {
                let entry = &plan.forms[index];
                let items: Vec<(Command, String)> = match &entry.source {
                    FormSource::Inline(buffer) => buffer
                        .iter()
                        .map(|(command, source, _)| (command.clone(), source.to_string()))
                        .collect(),
                    FormSource::Snapshot(id) => {
                        let definition = symbols
                            .get_by_id(*id)
                            .ok_or(RigPlotError::UnknownSymbol(*id))?;
                        definition
                            .buffer
                            .iter()
                            .map(|(command, source, _)| (command.clone(), source.to_string()))
                            .collect()
                    }
                };
                let mut out = String::new();
                render_commands(
                    &mut out,
                    &items,
                    PageMap::local(),
                    &mut fonts,
                    Some(&plan),
                    &self.options,
                    true,
                )?;
                out
            };
            let entry = &plan.forms[index];
            let body = form_xobject_object(
                content.as_bytes(),
                entry.bounds,
                self.options.compress_streams,
            );
            let id = objects.push(body);
            plan.forms[index].object_id = id;
        }

        // Main page content: elements clipped to their frames, painted in
        // z order.
        let mut content = String::new();
        for element in paint_order(elements) {
            content.push_str("q\n");
            push_clip_rect(&mut content, &element.frame, page_height, &self.options);
            match &element.content {
                ElementContent::PlanView(plan_view) => {
                    let map = PageMap::for_view(&element.frame, &plan_view.view, page_height);
                    let items: Vec<(Command, String)> = plan_view
                        .buffer
                        .iter()
                        .map(|(command, source, _)| (command.clone(), source.to_string()))
                        .collect();
                    render_commands(
                        &mut content,
                        &items,
                        map,
                        &mut fonts,
                        Some(&plan),
                        &self.options,
                        false,
                    )?;
                    if plan_view.framed {
                        push_frame_border(&mut content, &element.frame, page_height, &self.options);
                    }
                }
                ElementContent::Legend(legend) => {
                    let commands = legend_commands(legend, &element.frame, symbols, &plan);
                    let map = PageMap::for_frame(&element.frame, page_height);
                    render_commands(
                        &mut content,
                        &commands,
                        map,
                        &mut fonts,
                        Some(&plan),
                        &self.options,
                        true,
                    )?;
                }
                ElementContent::EventTable(table) => {
                    let commands = event_table_commands(table, &element.frame);
                    let map = PageMap::for_frame(&element.frame, page_height);
                    render_commands(
                        &mut content,
                        &commands,
                        map,
                        &mut fonts,
                        Some(&plan),
                        &self.options,
                        true,
                    )?;
                }
                ElementContent::TextBox(text_box) => {
                    let commands = text_box_commands(text_box, &element.frame, &fonts);
                    let map = PageMap::for_frame(&element.frame, page_height);
                    render_commands(
                        &mut content,
                        &commands,
                        map,
                        &mut fonts,
                        Some(&plan),
                        &self.options,
                        true,
                    )?;
                }
            }
            content.push_str("Q\n");
        }

        let content_id = objects.push(stream_object(
            content.as_bytes(),
            self.options.compress_streams,
        ));

        // Font objects, then the shared resources dictionary.
        let mut font_entries: Vec<(String, usize)> = Vec::new();
        for font in fonts.fonts.values() {
            let font_id = match font.kind {
                StreamFontKind::Base14 => objects.push(base14_font_object(&font.base_font)),
                StreamFontKind::TrueTypeWinAnsi => {
                    let resolved = fonts
                        .registry
                        .and_then(|registry| registry.resolve(&font.logical_name))
                        .ok_or_else(|| {
                            RigPlotError::Internal(format!(
                                "embedded font {} disappeared from the registry",
                                font.logical_name
                            ))
                        })?;
                    let font_file_id = objects.push(font_file_object(&resolved.data));
                    let descriptor_id =
                        objects.push(font_descriptor_object(resolved, font_file_id));
                    objects.push(truetype_font_object(resolved, descriptor_id))
                }
            };
            font_entries.push((font.resource.clone(), font_id));
        }

        let mut resources = vec![format!("/Font {}", resource_dict(&font_entries))];
        let form_entries: Vec<(String, usize)> = plan
            .forms
            .iter()
            .map(|entry| (entry.resource.clone(), entry.object_id))
            .collect();
        if !form_entries.is_empty() {
            resources.push(format!("/XObject {}", resource_dict(&form_entries)));
        }
        objects.set(
            PDF_RESOURCES_ID,
            format!("<< {} >>", resources.join(" ")).into_bytes(),
        );

        let page_id = objects.push(
            format!(
                "<< /Type /Page /Parent {} 0 R /MediaBox [0 0 {} {}] /Resources {} 0 R /Contents {} 0 R >>",
                PDF_PAGES_ID,
                fmt_pt(page_size.width),
                fmt_pt(page_size.height),
                PDF_RESOURCES_ID,
                content_id
            )
            .into_bytes(),
        );
        objects.set(
            PDF_PAGES_ID,
            format!("<< /Type /Pages /Count 1 /Kids [{} 0 R] >>", page_id).into_bytes(),
        );
        let info_id = objects.push(info_object(self.options.title.as_deref()));
        objects.set(
            PDF_CATALOG_ID,
            format!("<< /Type /Catalog /Pages {} 0 R >>", PDF_PAGES_ID).into_bytes(),
        );

        let bodies = objects.finish()?;
        let object_count = bodies.len();
        let bytes = serialize_file(bodies, PDF_CATALOG_ID, Some(info_id));
        let byte_count = bytes.len();
        std::fs::write(path, bytes)?;
        Ok((object_count, byte_count))
    }
}

fn validate(
    elements: &[PageElement],
    symbols: &SymbolSnapshot,
    path: &Path,
    options: &ExportOptions,
) -> Result<(), RigPlotError> {
    let frame = options.page.content_frame();
    if frame.width <= Pt::ZERO || frame.height <= Pt::ZERO {
        return Err(RigPlotError::InvalidPageSetup);
    }

    let mut has_content = false;
    for element in elements {
        match &element.content {
            ElementContent::PlanView(plan_view) => {
                if plan_view.view.viewport_width <= 0.0 || plan_view.view.viewport_height <= 0.0 {
                    return Err(RigPlotError::InvalidViewport {
                        width: plan_view.view.viewport_width,
                        height: plan_view.view.viewport_height,
                    });
                }
                if !plan_view.view.zoom.is_finite() || plan_view.view.zoom <= 0.0 {
                    return Err(RigPlotError::InvalidZoom(plan_view.view.zoom));
                }
                if !plan_view.buffer.is_empty() {
                    has_content = true;
                }
            }
            _ => has_content = true,
        }
    }
    if !has_content {
        return Err(RigPlotError::EmptyBuffer);
    }

    if path.as_os_str().is_empty() || path.file_name().is_none() {
        return Err(RigPlotError::InvalidOutputPath(
            path.display().to_string(),
        ));
    }
    let folder = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    if !folder.is_dir() {
        return Err(RigPlotError::MissingOutputFolder(
            folder.display().to_string(),
        ));
    }

    // Every referenced instance id must resolve before any work begins.
    for element in elements {
        if let ElementContent::PlanView(plan_view) = &element.content {
            let inline: HashSet<&str> = plan_view
                .buffer
                .commands()
                .iter()
                .filter_map(|command| match command {
                    Command::BeginSymbol { key } => Some(key.as_str()),
                    _ => None,
                })
                .collect();
            for command in plan_view.buffer.commands() {
                match command {
                    Command::PlaceSymbolInstance { id, .. } => {
                        if symbols.get_by_id(*id).is_none() {
                            return Err(RigPlotError::UnknownSymbol(*id));
                        }
                    }
                    Command::PlaceSymbol { key } => {
                        if !inline.contains(key.as_str()) {
                            warn!(key = %key, "placed symbol has no inline definition; it will be skipped");
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(())
}

/// Walks every plan-view buffer, extracts inline symbol definitions and
/// records which symbol keys/ids the main streams actually reference.
fn collect_symbols(
    elements: &[PageElement],
    symbols: &SymbolSnapshot,
) -> Result<SymbolPlan, RigPlotError> {
    let mut plan = SymbolPlan {
        forms: Vec::new(),
        by_key: HashMap::new(),
        by_id: HashMap::new(),
    };
    let mut inline: HashMap<String, (CommandBuffer, Bounds)> = HashMap::new();

    for element in elements {
        let ElementContent::PlanView(plan_view) = &element.content else {
            continue;
        };
        let mut capture: Option<(String, CommandBuffer)> = None;
        for (command, source, _meta) in plan_view.buffer.iter() {
            match command {
                Command::BeginSymbol { key } => {
                    if capture.is_none() {
                        capture = Some((key.clone(), CommandBuffer::new()));
                    }
                }
                Command::EndSymbol { key } => match capture.take() {
                    Some((open, buffer)) if open == *key => {
                        let bounds = buffer_bounds(&buffer);
                        inline.entry(open).or_insert((buffer, bounds));
                    }
                    other => capture = other,
                },
                _ => {
                    if let Some((_, buffer)) = capture.as_mut() {
                        buffer.push(command.clone(), source);
                    }
                }
            }
        }
    }

    // Referenced symbols get a form, in first-reference order.
    for element in elements {
        let ElementContent::PlanView(plan_view) = &element.content else {
            continue;
        };
        for command in plan_view.buffer.commands() {
            match command {
                Command::PlaceSymbol { key } => {
                    if plan.by_key.contains_key(key) {
                        continue;
                    }
                    if let Some((buffer, bounds)) = inline.get(key) {
                        let index = plan.forms.len();
                        plan.forms.push(FormEntry {
                            resource: format!("Sym{}", index + 1),
                            source: FormSource::Inline(buffer.clone()),
                            bounds: *bounds,
                            object_id: 0,
                        });
                        plan.by_key.insert(key.clone(), index);
                    }
                }
                Command::PlaceSymbolInstance { id, .. } => {
                    if plan.by_id.contains_key(id) {
                        continue;
                    }
                    let definition = symbols
                        .get_by_id(*id)
                        .ok_or(RigPlotError::UnknownSymbol(*id))?;
                    let index = plan.forms.len();
                    plan.forms.push(FormEntry {
                        resource: format!("Sym{}", index + 1),
                        source: FormSource::Snapshot(*id),
                        bounds: definition.bounds,
                        object_id: 0,
                    });
                    plan.by_id.insert(*id, index);
                }
                _ => {}
            }
        }
    }

    // Legend swatches may reference ids no plan view placed.
    for element in elements {
        if let ElementContent::Legend(legend) = &element.content {
            for entry in &legend.entries {
                let Some(id) = entry.symbol_id else { continue };
                if plan.by_id.contains_key(&id) {
                    continue;
                }
                let Some(definition) = symbols.get_by_id(id) else {
                    warn!(id, "legend references unknown symbol; swatch omitted");
                    continue;
                };
                let index = plan.forms.len();
                plan.forms.push(FormEntry {
                    resource: format!("Sym{}", index + 1),
                    source: FormSource::Snapshot(id),
                    bounds: definition.bounds,
                    object_id: 0,
                });
                plan.by_id.insert(id, index);
            }
        }
    }

    Ok(plan)
}

fn buffer_bounds(buffer: &CommandBuffer) -> Bounds {
    let mut bounds = Bounds::EMPTY;
    for command in buffer.commands() {
        match command {
            Command::Line { from, to, .. } => {
                bounds.expand(*from);
                bounds.expand(*to);
            }
            Command::Polyline { points, .. } | Command::Polygon { points, .. } => {
                for p in points {
                    bounds.expand(*p);
                }
            }
            Command::Rectangle {
                x,
                y,
                width,
                height,
                ..
            } => {
                bounds.expand(Point::new(*x, *y));
                bounds.expand(Point::new(*x + *width, *y + *height));
            }
            Command::Circle { center, radius, .. } => {
                bounds.expand(Point::new(center.x - radius, center.y - radius));
                bounds.expand(Point::new(center.x + radius, center.y + radius));
            }
            Command::Text { position, .. } => bounds.expand(*position),
            _ => {}
        }
    }
    if bounds.is_empty() {
        Bounds {
            min_x: 0.0,
            min_y: 0.0,
            max_x: 1.0,
            max_y: 1.0,
        }
    } else {
        bounds
    }
}

/// Replays a command list into content-stream operators. Contiguous
/// same-source groups render strokes first, then fills, replicating the
/// on-screen occlusion behavior; barriers flush the pending group before
/// being interpreted in original order.
#[allow(clippy::too_many_arguments)]
fn render_commands(
    out: &mut String,
    items: &[(Command, String)],
    map: PageMap,
    fonts: &mut FontTable<'_>,
    symbols: Option<&SymbolPlan>,
    options: &ExportOptions,
    raw_stroke_widths: bool,
) -> Result<(), RigPlotError> {
    let precision = options.precision as usize;
    let stroke_scale = if raw_stroke_widths || !options.scale_stroke_widths {
        1.0
    } else {
        map.scale
    };

    let mut transform = Transform::IDENTITY;
    let mut stack: Vec<Transform> = Vec::new();
    let mut group: Vec<&Command> = Vec::new();
    let mut group_source: &str = "";
    // Inline definition spans were turned into forms during partitioning;
    // their content must not repeat in this stream.
    let mut in_definition = false;

    let flush =
        |out: &mut String, group: &mut Vec<&Command>, transform: &Transform| {
            if group.is_empty() {
                return;
            }
            // Stroke pass.
            for command in group.iter() {
                if let Some(stroke) = command_stroke(command) {
                    push_path(out, command, transform, &map, precision);
                    push_stroke(out, stroke, stroke_scale, precision);
                }
            }
            // Fill pass, on top of the wireframe.
            for command in group.iter() {
                if let Some(fill) = command_fill(command) {
                    push_path(out, command, transform, &map, precision);
                    push_fill(out, fill, precision);
                }
            }
            group.clear();
        };

    for (command, source) in items {
        if in_definition {
            if matches!(command, Command::EndSymbol { .. }) {
                in_definition = false;
            }
            continue;
        }
        if let Command::BeginSymbol { .. } = command {
            flush(out, &mut group, &transform);
            in_definition = true;
            continue;
        }
        if !options.include_grid && source.as_str() == GRID_SOURCE_KEY {
            continue;
        }
        if command.is_barrier() {
            flush(out, &mut group, &transform);
            match command {
                Command::Save => stack.push(transform),
                Command::Restore => {
                    if let Some(previous) = stack.pop() {
                        transform = previous;
                    }
                }
                Command::SetTransform(next) => transform = *next,
                Command::Text {
                    position,
                    text,
                    style,
                } => {
                    push_text(out, position, text, style, &transform, &map, fonts, precision);
                }
                Command::PlaceSymbol { key } => {
                    if let Some(plan) = symbols {
                        if let Some(index) = plan.by_key.get(key) {
                            push_symbol_placement(
                                out,
                                &plan.forms[*index].resource,
                                &Affine::IDENTITY,
                                &transform,
                                &map,
                                precision,
                            );
                        }
                    }
                }
                Command::PlaceSymbolInstance {
                    id,
                    transform: instance,
                } => {
                    if let Some(plan) = symbols {
                        let index = plan
                            .by_id
                            .get(id)
                            .ok_or(RigPlotError::UnknownSymbol(*id))?;
                        push_symbol_placement(
                            out,
                            &plan.forms[*index].resource,
                            instance,
                            &transform,
                            &map,
                            precision,
                        );
                    }
                }
                // A stray end without a begin; nothing to close.
                Command::EndSymbol { .. } => {}
                _ => {}
            }
            continue;
        }

        if group.is_empty() {
            group_source = source.as_str();
        } else if group_source != source.as_str() {
            flush(out, &mut group, &transform);
            group_source = source.as_str();
        }
        group.push(command);
    }
    flush(out, &mut group, &transform);
    Ok(())
}

fn command_stroke(command: &Command) -> Option<StrokeStyle> {
    match command {
        Command::Line { stroke, .. }
        | Command::Polyline { stroke, .. }
        | Command::Polygon { stroke, .. }
        | Command::Rectangle { stroke, .. }
        | Command::Circle { stroke, .. } => Some(*stroke),
        _ => None,
    }
}

fn command_fill(command: &Command) -> Option<Color> {
    match command {
        Command::Polygon { fill, .. }
        | Command::Rectangle { fill, .. }
        | Command::Circle { fill, .. } => *fill,
        _ => None,
    }
}

fn push_path(
    out: &mut String,
    command: &Command,
    transform: &Transform,
    map: &PageMap,
    precision: usize,
) {
    let mp = |p: Point| map.map(transform.apply(p));
    match command {
        Command::Line { from, to, .. } => {
            let (x0, y0) = mp(*from);
            let (x1, y1) = mp(*to);
            out.push_str(&format!(
                "{} {} m\n{} {} l\n",
                fmt_coord(x0, precision),
                fmt_coord(y0, precision),
                fmt_coord(x1, precision),
                fmt_coord(y1, precision)
            ));
        }
        Command::Polyline { points, .. } => {
            push_poly_path(out, points, mp, precision, false);
        }
        Command::Polygon { points, .. } => {
            push_poly_path(out, points, mp, precision, true);
        }
        Command::Rectangle {
            x,
            y,
            width,
            height,
            ..
        } => {
            let (x0, y0) = mp(Point::new(*x, *y));
            let (x1, y1) = mp(Point::new(*x + *width, *y + *height));
            out.push_str(&format!(
                "{} {} {} {} re\n",
                fmt_coord(x0.min(x1), precision),
                fmt_coord(y0.min(y1), precision),
                fmt_coord((x1 - x0).abs(), precision),
                fmt_coord((y1 - y0).abs(), precision)
            ));
        }
        Command::Circle { center, radius, .. } => {
            push_circle_path(out, *center, *radius, mp, precision);
        }
        _ => {}
    }
}

fn push_poly_path(
    out: &mut String,
    points: &[Point],
    mp: impl Fn(Point) -> (f32, f32),
    precision: usize,
    close: bool,
) {
    let mut iter = points.iter();
    let Some(first) = iter.next() else { return };
    let (x, y) = mp(*first);
    out.push_str(&format!(
        "{} {} m\n",
        fmt_coord(x, precision),
        fmt_coord(y, precision)
    ));
    for p in iter {
        let (x, y) = mp(*p);
        out.push_str(&format!(
            "{} {} l\n",
            fmt_coord(x, precision),
            fmt_coord(y, precision)
        ));
    }
    if close {
        out.push_str("h\n");
    }
}

fn push_circle_path(
    out: &mut String,
    center: Point,
    radius: f32,
    mp: impl Fn(Point) -> (f32, f32),
    precision: usize,
) {
    let k = BEZIER_K * radius;
    // Four cubic arcs: control points generated in model space, each mapped
    // so canvas scaling and the page mapping apply uniformly.
    let segments = [
        [
            Point::new(center.x + radius, center.y + k),
            Point::new(center.x + k, center.y + radius),
            Point::new(center.x, center.y + radius),
        ],
        [
            Point::new(center.x - k, center.y + radius),
            Point::new(center.x - radius, center.y + k),
            Point::new(center.x - radius, center.y),
        ],
        [
            Point::new(center.x - radius, center.y - k),
            Point::new(center.x - k, center.y - radius),
            Point::new(center.x, center.y - radius),
        ],
        [
            Point::new(center.x + k, center.y - radius),
            Point::new(center.x + radius, center.y - k),
            Point::new(center.x + radius, center.y),
        ],
    ];
    let (x, y) = mp(Point::new(center.x + radius, center.y));
    out.push_str(&format!(
        "{} {} m\n",
        fmt_coord(x, precision),
        fmt_coord(y, precision)
    ));
    for segment in segments {
        let coords: Vec<String> = segment
            .iter()
            .flat_map(|p| {
                let (x, y) = mp(*p);
                [fmt_coord(x, precision), fmt_coord(y, precision)]
            })
            .collect();
        out.push_str(&format!("{} c\n", coords.join(" ")));
    }
    out.push_str("h\n");
}

fn push_stroke(out: &mut String, stroke: StrokeStyle, stroke_scale: f32, precision: usize) {
    let width = (stroke.width * stroke_scale).max(0.0);
    out.push_str(&format!(
        "{} {} {} RG\n{} w\nS\n",
        fmt_coord(stroke.color.r, 3),
        fmt_coord(stroke.color.g, 3),
        fmt_coord(stroke.color.b, 3),
        fmt_coord(width, precision)
    ));
}

fn push_fill(out: &mut String, fill: Color, _precision: usize) {
    out.push_str(&format!(
        "{} {} {} rg\nf\n",
        fmt_coord(fill.r, 3),
        fmt_coord(fill.g, 3),
        fmt_coord(fill.b, 3)
    ));
}

#[allow(clippy::too_many_arguments)]
fn push_text(
    out: &mut String,
    position: &Point,
    text: &str,
    style: &crate::command::TextStyle,
    transform: &Transform,
    map: &PageMap,
    fonts: &mut FontTable<'_>,
    precision: usize,
) {
    let resource = fonts.ensure(&style.family);
    let (anchor_x, anchor_y) = map.map(transform.apply(*position));

    let width = fonts.measure(&style.family, style.size, text);
    let x = match style.align {
        TextAlign::Left => anchor_x,
        TextAlign::Center => anchor_x - width * 0.5,
        TextAlign::Right => anchor_x - width,
    };
    // The recorded anchor is the top of the text box; captured renderer
    // metrics give the exact baseline drop when present.
    let ascent = style.metrics.map(|m| m.ascent).unwrap_or(style.size);
    let baseline = if map.flip_y {
        anchor_y - ascent
    } else {
        anchor_y + ascent
    };

    out.push_str("BT\n");
    out.push_str(&format!(
        "/{} {} Tf\n",
        resource,
        fmt_coord(style.size, precision)
    ));
    out.push_str(&format!(
        "{} {} {} rg\n",
        fmt_coord(style.color.r, 3),
        fmt_coord(style.color.g, 3),
        fmt_coord(style.color.b, 3)
    ));
    if let Some(outline) = style.outline {
        out.push_str(&format!(
            "{} {} {} RG\n{} w\n2 Tr\n",
            fmt_coord(outline.r, 3),
            fmt_coord(outline.g, 3),
            fmt_coord(outline.b, 3),
            fmt_coord((style.size / 24.0).max(0.1), precision)
        ));
    }
    out.push_str(&format!(
        "{} {} Td\n",
        fmt_coord(x, precision),
        fmt_coord(baseline, precision)
    ));
    out.push_str(&format!("({}) Tj\n", encode_winansi_pdf_string(text)));
    if style.outline.is_some() {
        out.push_str("0 Tr\n");
    }
    out.push_str("ET\n");
}

fn push_symbol_placement(
    out: &mut String,
    resource: &str,
    instance: &Affine,
    transform: &Transform,
    map: &PageMap,
    precision: usize,
) {
    let matrix = map
        .as_affine()
        .then(&transform.to_affine())
        .then(instance);
    out.push_str(&format!(
        "q\n{} {} {} {} {} {} cm\n/{} Do\nQ\n",
        fmt_coord(matrix.a, precision.max(4)),
        fmt_coord(matrix.b, precision.max(4)),
        fmt_coord(matrix.c, precision.max(4)),
        fmt_coord(matrix.d, precision.max(4)),
        fmt_coord(matrix.e, precision),
        fmt_coord(matrix.f, precision),
        resource
    ));
}

fn push_clip_rect(out: &mut String, frame: &Rect, page_height: f32, options: &ExportOptions) {
    let precision = options.precision as usize;
    let x = frame.x.to_f32();
    let y = page_height - frame.y.to_f32() - frame.height.to_f32();
    out.push_str(&format!(
        "{} {} {} {} re\nW\nn\n",
        fmt_coord(x, precision),
        fmt_coord(y, precision),
        fmt_coord(frame.width.to_f32(), precision),
        fmt_coord(frame.height.to_f32(), precision)
    ));
}

fn push_frame_border(out: &mut String, frame: &Rect, page_height: f32, options: &ExportOptions) {
    let precision = options.precision as usize;
    let x = frame.x.to_f32();
    let y = page_height - frame.y.to_f32() - frame.height.to_f32();
    out.push_str(&format!(
        "{} {} {} {} re\n0 0 0 RG\n0.75 w\nS\n",
        fmt_coord(x, precision),
        fmt_coord(y, precision),
        fmt_coord(frame.width.to_f32(), precision),
        fmt_coord(frame.height.to_f32(), precision)
    ));
}

const LEGEND_TITLE_SIZE: f32 = 11.0;
const LEGEND_ROW_SIZE: f32 = 8.0;
const LEGEND_ROW_HEIGHT: f32 = 12.0;
const LEGEND_SWATCH: f32 = 9.0;

/// Legend content as plain commands in frame-local coordinates, so it runs
/// through the same renderer as recorded geometry.
fn legend_commands(
    legend: &Legend,
    frame: &Rect,
    symbols: &SymbolSnapshot,
    plan: &SymbolPlan,
) -> Vec<(Command, String)> {
    let mut commands: Vec<(Command, String)> = Vec::new();
    let source = "legend".to_string();
    let mut cursor = 4.0f32;

    let mut title_style = crate::command::TextStyle::new("Helvetica", LEGEND_TITLE_SIZE);
    title_style.color = Color::BLACK;
    commands.push((
        Command::Text {
            position: Point::new(4.0, cursor),
            text: legend.title.clone(),
            style: title_style,
        },
        source.clone(),
    ));
    cursor += LEGEND_ROW_HEIGHT + 4.0;

    let max_y = frame.height.to_f32() - LEGEND_ROW_HEIGHT;
    for entry in &legend.entries {
        if cursor > max_y {
            break;
        }
        if let Some(id) = entry.symbol_id {
            if plan.by_id.contains_key(&id) {
                if let Some(definition) = symbols.get_by_id(id) {
                    let extent = definition
                        .bounds
                        .width()
                        .max(definition.bounds.height())
                        .max(1e-6);
                    let scale = LEGEND_SWATCH / extent;
                    let cx = (definition.bounds.min_x + definition.bounds.max_x) * 0.5;
                    let cy = (definition.bounds.min_y + definition.bounds.max_y) * 0.5;
                    let place = Affine::translate(
                        4.0 + LEGEND_SWATCH * 0.5,
                        cursor + LEGEND_SWATCH * 0.5,
                    )
                    .then(&Affine::scale(scale, scale))
                    .then(&Affine::translate(-cx, -cy));
                    commands.push((
                        Command::PlaceSymbolInstance {
                            id,
                            transform: place,
                        },
                        source.clone(),
                    ));
                }
            }
        }
        let label = if entry.count > 1 {
            format!("{}x {}", entry.count, entry.label)
        } else {
            entry.label.clone()
        };
        commands.push((
            Command::Text {
                position: Point::new(4.0 + LEGEND_SWATCH + 5.0, cursor),
                text: label,
                style: crate::command::TextStyle::new("Helvetica", LEGEND_ROW_SIZE),
            },
            source.clone(),
        ));
        cursor += LEGEND_ROW_HEIGHT;
    }

    commands
}

const TABLE_TITLE_SIZE: f32 = 11.0;
const TABLE_CELL_SIZE: f32 = 8.0;
const TABLE_ROW_HEIGHT: f32 = 13.0;

fn event_table_commands(table: &EventTable, frame: &Rect) -> Vec<(Command, String)> {
    let mut commands: Vec<(Command, String)> = Vec::new();
    let source = "event-table".to_string();
    let width = frame.width.to_f32();
    let mut cursor = 4.0f32;

    if !table.title.is_empty() {
        commands.push((
            Command::Text {
                position: Point::new(4.0, cursor),
                text: table.title.clone(),
                style: crate::command::TextStyle::new("Helvetica", TABLE_TITLE_SIZE),
            },
            source.clone(),
        ));
        cursor += TABLE_ROW_HEIGHT + 2.0;
    }

    let columns = table.columns.len().max(1);
    let column_width = (width - 8.0) / columns as f32;
    let hairline = StrokeStyle::new(Color::BLACK, 0.5);

    for (index, column) in table.columns.iter().enumerate() {
        commands.push((
            Command::Text {
                position: Point::new(4.0 + column_width * index as f32, cursor),
                text: column.clone(),
                style: crate::command::TextStyle::new("Helvetica", TABLE_CELL_SIZE),
            },
            source.clone(),
        ));
    }
    cursor += TABLE_ROW_HEIGHT;
    commands.push((
        Command::Line {
            from: Point::new(4.0, cursor - 3.0),
            to: Point::new(width - 4.0, cursor - 3.0),
            stroke: hairline,
        },
        source.clone(),
    ));

    let max_y = frame.height.to_f32() - TABLE_ROW_HEIGHT;
    for row in &table.rows {
        if cursor > max_y {
            break;
        }
        for (index, cell) in row.iter().take(columns).enumerate() {
            commands.push((
                Command::Text {
                    position: Point::new(4.0 + column_width * index as f32, cursor),
                    text: cell.clone(),
                    style: crate::command::TextStyle::new("Helvetica", TABLE_CELL_SIZE),
                },
                source.clone(),
            ));
        }
        cursor += TABLE_ROW_HEIGHT;
    }

    commands
}

fn text_box_commands(
    text_box: &TextBox,
    _frame: &Rect,
    fonts: &FontTable<'_>,
) -> Vec<(Command, String)> {
    let source = "text-box".to_string();
    let line_height = text_box
        .style
        .metrics
        .map(|m| m.line_height)
        .unwrap_or_else(|| {
            fonts
                .registry
                .map(|registry| {
                    registry.line_height(
                        &text_box.style.family,
                        text_box.style.size,
                        text_box.style.size * 1.25,
                    )
                })
                .unwrap_or(text_box.style.size * 1.25)
        });

    text_box
        .text
        .lines()
        .enumerate()
        .map(|(index, line)| {
            (
                Command::Text {
                    position: Point::new(2.0, 2.0 + line_height * index as f32),
                    text: line.to_string(),
                    style: text_box.style.clone(),
                },
                source.clone(),
            )
        })
        .collect()
}

// --- object body builders -------------------------------------------------

fn stream_object(content: &[u8], compress: bool) -> Vec<u8> {
    let mut out = Vec::new();
    if compress {
        let data = zlib_compress(content);
        out.extend_from_slice(
            format!("<< /Length {} /Filter /FlateDecode >>\nstream\n", data.len()).as_bytes(),
        );
        out.extend_from_slice(&data);
    } else {
        out.extend_from_slice(format!("<< /Length {} >>\nstream\n", content.len()).as_bytes());
        out.extend_from_slice(content);
    }
    out.extend_from_slice(b"\nendstream");
    out
}

fn form_xobject_object(content: &[u8], bounds: Bounds, compress: bool) -> Vec<u8> {
    let bbox = format!(
        "[{} {} {} {}]",
        fmt_coord(bounds.min_x, 3),
        fmt_coord(bounds.min_y, 3),
        fmt_coord(bounds.max_x, 3),
        fmt_coord(bounds.max_y, 3)
    );
    let mut out = Vec::new();
    if compress {
        let data = zlib_compress(content);
        out.extend_from_slice(
            format!(
                "<< /Type /XObject /Subtype /Form /BBox {} /Resources {} 0 R /Length {} /Filter /FlateDecode >>\nstream\n",
                bbox,
                PDF_RESOURCES_ID,
                data.len()
            )
            .as_bytes(),
        );
        out.extend_from_slice(&data);
    } else {
        out.extend_from_slice(
            format!(
                "<< /Type /XObject /Subtype /Form /BBox {} /Resources {} 0 R /Length {} >>\nstream\n",
                bbox,
                PDF_RESOURCES_ID,
                content.len()
            )
            .as_bytes(),
        );
        out.extend_from_slice(content);
    }
    out.extend_from_slice(b"\nendstream");
    out
}

fn base14_font_object(base_font: &str) -> Vec<u8> {
    format!(
        "<< /Type /Font /Subtype /Type1 /BaseFont /{} /Encoding /WinAnsiEncoding >>",
        base_font
    )
    .into_bytes()
}

fn truetype_font_object(font: &crate::font::RegisteredFont, descriptor_id: usize) -> Vec<u8> {
    let base = sanitize_font_name(&font.name);
    let metrics = &font.metrics;
    let widths = metrics
        .widths
        .iter()
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    let encoding = if metrics.is_symbolic() {
        String::new()
    } else {
        " /Encoding /WinAnsiEncoding".to_string()
    };
    format!(
        "<< /Type /Font /Subtype /TrueType /BaseFont /{} /FirstChar {} /LastChar {} /Widths [{}] /FontDescriptor {} 0 R{} >>",
        base, metrics.first_char, metrics.last_char, widths, descriptor_id, encoding
    )
    .into_bytes()
}

fn font_descriptor_object(font: &crate::font::RegisteredFont, font_file_id: usize) -> Vec<u8> {
    let base = sanitize_font_name(&font.name);
    let metrics = &font.metrics;
    let mut flags = if metrics.is_symbolic() { 4 } else { 32 };
    if metrics.is_fixed_pitch {
        flags |= 1;
    }
    format!(
        "<< /Type /FontDescriptor /FontName /{} /Flags {} /FontBBox [{} {} {} {}] /ItalicAngle {} /Ascent {} /Descent {} /CapHeight {} /StemV {} /MissingWidth {} /FontFile2 {} 0 R >>",
        base,
        flags,
        metrics.bbox.0,
        metrics.bbox.1,
        metrics.bbox.2,
        metrics.bbox.3,
        metrics.italic_angle,
        metrics.ascent,
        metrics.descent,
        metrics.cap_height,
        metrics.stem_v,
        metrics.missing_width,
        font_file_id
    )
    .into_bytes()
}

fn font_file_object(data: &[u8]) -> Vec<u8> {
    let mut stream_data = ascii_hex_encode(data);
    stream_data.push('>');
    stream_data.push('\n');
    let mut out = format!(
        "<< /Length {} /Length1 {} /Filter /ASCIIHexDecode >>\nstream\n",
        stream_data.len(),
        data.len()
    )
    .into_bytes();
    out.extend_from_slice(stream_data.as_bytes());
    out.extend_from_slice(b"endstream");
    out
}

fn info_object(title: Option<&str>) -> Vec<u8> {
    let mut entries = vec!["/Producer (rigplot)".to_string()];
    if let Some(title) = title {
        entries.push(format!("/Title ({})", escape_pdf_string(title)));
    }
    format!("<< {} >>", entries.join(" ")).into_bytes()
}

fn resource_dict(entries: &[(String, usize)]) -> String {
    let body = entries
        .iter()
        .map(|(resource, id)| format!("/{} {} 0 R", resource, id))
        .collect::<Vec<_>>()
        .join(" ");
    format!("<< {} >>", body)
}

fn serialize_file(objects: Vec<Vec<u8>>, catalog_id: usize, info_id: Option<usize>) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    out.extend_from_slice(b"%\xE2\xE3\xCF\xD3\n");

    let mut offsets = Vec::with_capacity(objects.len());
    for (index, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n", index + 1).as_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(b"\nendobj\n");
    }

    let xref_start = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
    out.extend_from_slice(b"0000000000 65535 f \n");
    for offset in offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }

    let mut trailer = format!(
        "trailer\n<< /Size {} /Root {} 0 R",
        objects.len() + 1,
        catalog_id
    );
    if let Some(info_id) = info_id {
        trailer.push_str(&format!(" /Info {} 0 R", info_id));
    }
    trailer.push_str(&format!(" >>\nstartxref\n{}\n%%EOF", xref_start));
    out.extend_from_slice(trailer.as_bytes());

    out
}

// --- string encoding ------------------------------------------------------

fn ascii_hex_encode(data: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(data.len() * 2);
    for (index, byte) in data.iter().enumerate() {
        let _ = write!(&mut out, "{:02X}", byte);
        if index % 32 == 31 {
            out.push('\n');
        }
    }
    out
}

fn escape_pdf_string(input: &str) -> String {
    let mut out = String::new();
    for ch in input.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '(' => out.push_str("\\("),
            ')' => out.push_str("\\)"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out
}

/// Encodes text into a WinAnsi (cp1252) PDF string literal. Codepoints with
/// no WinAnsi slot degrade to `?`.
fn encode_winansi_pdf_string(input: &str) -> String {
    let mut out = String::new();
    for ch in input.chars() {
        let byte = match ch {
            '\u{0000}'..='\u{007F}' => ch as u8,
            '\u{00A0}'..='\u{00FF}' => ch as u8,
            '\u{20AC}' => 0x80,
            '\u{201A}' => 0x82,
            '\u{0192}' => 0x83,
            '\u{201E}' => 0x84,
            '\u{2026}' => 0x85,
            '\u{2020}' => 0x86,
            '\u{2021}' => 0x87,
            '\u{02C6}' => 0x88,
            '\u{2030}' => 0x89,
            '\u{0160}' => 0x8A,
            '\u{2039}' => 0x8B,
            '\u{0152}' => 0x8C,
            '\u{017D}' => 0x8E,
            '\u{2018}' => 0x91,
            '\u{2019}' => 0x92,
            '\u{201C}' => 0x93,
            '\u{201D}' => 0x94,
            '\u{2022}' => 0x95,
            '\u{2013}' => 0x96,
            '\u{2014}' => 0x97,
            '\u{02DC}' => 0x98,
            '\u{2122}' => 0x99,
            '\u{0161}' => 0x9A,
            '\u{203A}' => 0x9B,
            '\u{0153}' => 0x9C,
            '\u{017E}' => 0x9E,
            '\u{0178}' => 0x9F,
            _ => b'?',
        };

        match byte {
            b'\\' => out.push_str("\\\\"),
            b'(' => out.push_str("\\("),
            b')' => out.push_str("\\)"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b if b < 0x20 || b >= 0x7f => out.push_str(&format!("\\{:03o}", b)),
            b => out.push(b as char),
        }
    }
    out
}

fn is_base14_font(name: &str) -> bool {
    let n = crate::font::normalize_name(name);
    matches!(
        n.as_str(),
        "courier"
            | "courier-bold"
            | "courier-oblique"
            | "courier-boldoblique"
            | "helvetica"
            | "helvetica-bold"
            | "helvetica-oblique"
            | "helvetica-boldoblique"
            | "times-roman"
            | "times-bold"
            | "times-italic"
            | "times-bolditalic"
            | "symbol"
            | "zapfdingbats"
    )
}

/// Nearest standard font for an unresolvable family.
fn base14_substitute(name: &str) -> String {
    if is_base14_font(name) {
        return sanitize_font_name(name);
    }
    let n = crate::font::normalize_name(name);
    if n.contains("courier") || n.contains("mono") {
        "Courier".to_string()
    } else if n.contains("times") || n.contains("serif") {
        "Times-Roman".to_string()
    } else {
        "Helvetica".to_string()
    }
}

fn sanitize_font_name(name: &str) -> String {
    let mut out = String::new();
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' {
            out.push(ch);
        } else if ch == ' ' {
            out.push('-');
        }
    }
    if out.is_empty() {
        "Helvetica".to_string()
    } else {
        out
    }
}

// --- number formatting ----------------------------------------------------

/// Formats a coordinate with the configured number of decimal places,
/// trimming trailing zeros. Non-finite input renders as 0.
fn fmt_coord(value: f32, precision: usize) -> String {
    if !value.is_finite() {
        return "0".to_string();
    }
    let precision = precision.min(6);
    let factor = 10_f64.powi(precision as i32);
    let scaled = (value as f64 * factor).round() as i64;
    if scaled == 0 {
        return "0".to_string();
    }
    let sign = if scaled < 0 { "-" } else { "" };
    let abs = scaled.unsigned_abs();
    let int_part = abs / factor as u64;
    let frac_part = abs % factor as u64;
    if frac_part == 0 || precision == 0 {
        format!("{}{}", sign, int_part)
    } else {
        let mut s = format!("{}{}.{:0width$}", sign, int_part, frac_part, width = precision);
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
        s
    }
}

fn fmt_pt(value: Pt) -> String {
    let milli = value.to_milli_i64();
    if milli == 0 {
        return "0".to_string();
    }
    let sign = if milli < 0 { "-" } else { "" };
    let abs = milli.abs();
    let int_part = abs / 1000;
    let frac_part = abs % 1000;
    if frac_part == 0 {
        format!("{}{}", sign, int_part)
    } else {
        let mut s = format!("{}{}.{:03}", sign, int_part, frac_part);
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::TextStyle;
    use crate::symbol::{SymbolCache, SymbolDefinition, SymbolKey};
    use crate::types::ProjectionView;

    fn stroke() -> StrokeStyle {
        StrokeStyle::hairline()
    }

    fn view() -> ViewState {
        ViewState::new(800.0, 600.0, 1.0)
    }

    fn simple_buffer() -> CommandBuffer {
        let mut buffer = CommandBuffer::new();
        buffer.push(
            Command::Line {
                from: Point::new(10.0, 10.0),
                to: Point::new(200.0, 10.0),
                stroke: stroke(),
            },
            "truss:1",
        );
        buffer.push(
            Command::Polygon {
                points: vec![
                    Point::new(50.0, 50.0),
                    Point::new(90.0, 50.0),
                    Point::new(90.0, 90.0),
                    Point::new(50.0, 90.0),
                ],
                stroke: stroke(),
                fill: Some(Color::from_rgb8(200, 200, 40)),
            },
            "fixture:1",
        );
        buffer.push(
            Command::Text {
                position: Point::new(10.0, 100.0),
                text: "FOH truss".to_string(),
                style: TextStyle::new("Helvetica", 9.0),
            },
            "label:1",
        );
        buffer
    }

    fn export_to_temp(
        buffer: &CommandBuffer,
        symbols: &SymbolSnapshot,
        options: ExportOptions,
    ) -> (ExportResult, Vec<u8>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("plan.pdf");
        let exporter = PlanExporter::new(options);
        let result = exporter.export(buffer, symbols, &view(), &path);
        let bytes = std::fs::read(&path).unwrap_or_default();
        (result, bytes, dir)
    }

    fn count_occurrences(haystack: &[u8], needle: &[u8]) -> usize {
        if needle.is_empty() || haystack.len() < needle.len() {
            return 0;
        }
        let mut count = 0;
        for window in haystack.windows(needle.len()) {
            if window == needle {
                count += 1;
            }
        }
        count
    }

    #[test]
    fn fmt_coord_respects_precision_and_trims() {
        assert_eq!(fmt_coord(1.23456, 3), "1.235");
        assert_eq!(fmt_coord(1.2, 3), "1.2");
        assert_eq!(fmt_coord(1.0, 3), "1");
        assert_eq!(fmt_coord(-0.0001, 3), "0");
        assert_eq!(fmt_coord(2.5, 0), "3");
        assert_eq!(fmt_coord(f32::NAN, 3), "0");
    }

    #[test]
    fn export_writes_a_loadable_pdf() {
        let (result, bytes, _dir) =
            export_to_temp(&simple_buffer(), &SymbolSnapshot::empty(), ExportOptions::default());
        assert!(result.success, "{}", result.message);
        assert!(bytes.starts_with(b"%PDF-1.4"));
        let doc = lopdf::Document::load_mem(&bytes).expect("parse");
        assert_eq!(doc.get_pages().len(), 1);
    }

    #[test]
    fn object_count_matches_xref_entries() {
        let mut options = ExportOptions::default();
        options.compress_streams = false;
        let (result, bytes, _dir) =
            export_to_temp(&simple_buffer(), &SymbolSnapshot::empty(), options);
        assert!(result.success);
        let obj_count = count_occurrences(&bytes, b" 0 obj\n");
        let text = String::from_utf8_lossy(&bytes);
        let xref_size: usize = text
            .split("xref\n0 ")
            .nth(1)
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|n| n.parse().ok())
            .expect("xref section");
        assert_eq!(obj_count, xref_size - 1);
        assert!(text.contains(&format!("/Size {}", xref_size)));
    }

    #[test]
    fn structural_references_resolve() {
        let (result, bytes, _dir) =
            export_to_temp(&simple_buffer(), &SymbolSnapshot::empty(), ExportOptions::default());
        assert!(result.success);
        let doc = lopdf::Document::load_mem(&bytes).expect("parse");
        let root_id = doc
            .trailer
            .get(b"Root")
            .and_then(|obj| obj.as_reference())
            .expect("Root reference");
        let catalog = doc.get_object(root_id).expect("catalog resolves");
        let pages_id = catalog
            .as_dict()
            .and_then(|dict| dict.get(b"Pages"))
            .and_then(|obj| obj.as_reference())
            .expect("Pages reference");
        let pages = doc.get_object(pages_id).expect("pages resolves");
        let kids = pages
            .as_dict()
            .and_then(|dict| dict.get(b"Kids"))
            .and_then(|obj| obj.as_array())
            .expect("Kids array");
        for kid in kids {
            let page_id = kid.as_reference().expect("page reference");
            let page = doc.get_object(page_id).expect("page resolves");
            let contents_id = page
                .as_dict()
                .and_then(|dict| dict.get(b"Contents"))
                .and_then(|obj| obj.as_reference())
                .expect("Contents reference");
            doc.get_object(contents_id).expect("contents resolves");
            let parent_id = page
                .as_dict()
                .and_then(|dict| dict.get(b"Parent"))
                .and_then(|obj| obj.as_reference())
                .expect("Parent reference");
            assert_eq!(parent_id, pages_id);
        }
    }

    #[test]
    fn empty_buffer_fails_without_touching_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("plan.pdf");
        let exporter = PlanExporter::new(ExportOptions::default());
        let result = exporter.export(
            &CommandBuffer::new(),
            &SymbolSnapshot::empty(),
            &view(),
            &path,
        );
        assert!(!result.success);
        assert_eq!(result.message, "Nothing to export");
        assert!(!path.exists());
    }

    #[test]
    fn non_positive_viewport_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("plan.pdf");
        let exporter = PlanExporter::new(ExportOptions::default());
        let mut bad_view = view();
        bad_view.viewport_width = 0.0;
        let result = exporter.export(
            &simple_buffer(),
            &SymbolSnapshot::empty(),
            &bad_view,
            &path,
        );
        assert!(!result.success);
        assert!(result.message.contains("viewport"));
        assert!(!path.exists());
    }

    #[test]
    fn non_finite_zoom_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("plan.pdf");
        let exporter = PlanExporter::new(ExportOptions::default());
        let mut bad_view = view();
        bad_view.zoom = f32::NAN;
        let result = exporter.export(
            &simple_buffer(),
            &SymbolSnapshot::empty(),
            &bad_view,
            &path,
        );
        assert!(!result.success);
        assert!(result.message.contains("zoom"));
    }

    #[test]
    fn missing_destination_folder_is_rejected() {
        let exporter = PlanExporter::new(ExportOptions::default());
        let result = exporter.export(
            &simple_buffer(),
            &SymbolSnapshot::empty(),
            &view(),
            "/nonexistent-folder-for-rigplot/plan.pdf",
        );
        assert!(!result.success);
        assert!(result.message.contains("folder"));
    }

    #[test]
    fn strokes_render_before_fills_within_a_group() {
        let mut buffer = CommandBuffer::new();
        for offset in [0.0f32, 30.0] {
            buffer.push(
                Command::Polygon {
                    points: vec![
                        Point::new(offset, 0.0),
                        Point::new(offset + 20.0, 0.0),
                        Point::new(offset + 20.0, 20.0),
                    ],
                    stroke: stroke(),
                    fill: Some(Color::WHITE),
                },
                "fixture:1",
            );
        }
        let mut options = ExportOptions::default();
        options.compress_streams = false;
        let (result, bytes, _dir) = export_to_temp(&buffer, &SymbolSnapshot::empty(), options);
        assert!(result.success);
        let text = String::from_utf8_lossy(&bytes);
        let last_stroke = text.rfind("S\n").expect("stroke op");
        let first_fill = text.find("f\n").expect("fill op");
        assert!(
            last_stroke < first_fill,
            "both strokes must precede the first fill"
        );
        assert_eq!(count_occurrences(&bytes, b"\nS\n"), 2);
        assert_eq!(count_occurrences(&bytes, b"\nf\n"), 2);
    }

    #[test]
    fn ten_thousand_instances_share_one_form_xobject() {
        let mut cache = SymbolCache::new();
        let key = SymbolKey::new("gdtf:par64", ProjectionView::Plan, 1);
        let definition = cache.get_or_create(&key, |key, id| {
            let mut buffer = CommandBuffer::new();
            buffer.push(
                Command::Circle {
                    center: Point::new(0.0, 0.0),
                    radius: 0.4,
                    stroke: stroke(),
                    fill: None,
                },
                &key.model,
            );
            let mut bounds = Bounds::EMPTY;
            bounds.expand(Point::new(-0.4, -0.4));
            bounds.expand(Point::new(0.4, 0.4));
            SymbolDefinition {
                key: key.clone(),
                id,
                bounds,
                buffer,
            }
        });

        let mut buffer = CommandBuffer::new();
        for i in 0..10_000u32 {
            let x = (i % 100) as f32;
            let y = (i / 100) as f32;
            buffer.push(
                Command::PlaceSymbolInstance {
                    id: definition.id,
                    transform: Affine::translate(x, y),
                },
                "fixture:instances",
            );
        }
        let snapshot = cache.snapshot();
        let mut options = ExportOptions::default();
        options.compress_streams = false;
        let (result, bytes, _dir) = export_to_temp(&buffer, &snapshot, options);
        assert!(result.success, "{}", result.message);
        assert_eq!(count_occurrences(&bytes, b"/Subtype /Form"), 1);
        assert_eq!(count_occurrences(&bytes, b"/Sym1 Do"), 10_000);
    }

    #[test]
    fn inline_symbol_definition_becomes_a_form() {
        let mut buffer = CommandBuffer::new();
        buffer.push(
            Command::BeginSymbol {
                key: "gdtf:wash@plan".to_string(),
            },
            "fixture:wash",
        );
        buffer.push(
            Command::Rectangle {
                x: -0.3,
                y: -0.3,
                width: 0.6,
                height: 0.6,
                stroke: stroke(),
                fill: None,
            },
            "fixture:wash",
        );
        buffer.push(
            Command::EndSymbol {
                key: "gdtf:wash@plan".to_string(),
            },
            "fixture:wash",
        );
        buffer.push(
            Command::PlaceSymbol {
                key: "gdtf:wash@plan".to_string(),
            },
            "fixture:wash",
        );
        let mut options = ExportOptions::default();
        options.compress_streams = false;
        let (result, bytes, _dir) = export_to_temp(&buffer, &SymbolSnapshot::empty(), options);
        assert!(result.success, "{}", result.message);
        assert_eq!(count_occurrences(&bytes, b"/Subtype /Form"), 1);
        assert_eq!(count_occurrences(&bytes, b"/Sym1 Do"), 1);
    }

    #[test]
    fn unknown_instance_id_fails_validation() {
        let mut buffer = CommandBuffer::new();
        buffer.push(
            Command::PlaceSymbolInstance {
                id: 42,
                transform: Affine::IDENTITY,
            },
            "fixture:ghost",
        );
        let (result, bytes, _dir) =
            export_to_temp(&buffer, &SymbolSnapshot::empty(), ExportOptions::default());
        assert!(!result.success);
        assert!(result.message.contains("42"));
        assert!(bytes.is_empty());
    }

    #[test]
    fn grid_layer_is_gated_by_option() {
        let mut buffer = simple_buffer();
        for i in 0..10 {
            buffer.push(
                Command::Line {
                    from: Point::new(i as f32 * 10.0, 0.0),
                    to: Point::new(i as f32 * 10.0, 600.0),
                    stroke: stroke(),
                },
                GRID_SOURCE_KEY,
            );
        }

        let mut with_grid = ExportOptions::default();
        with_grid.compress_streams = false;
        let mut without_grid = with_grid.clone();
        without_grid.include_grid = false;

        let (result_a, bytes_a, _dir_a) =
            export_to_temp(&buffer, &SymbolSnapshot::empty(), with_grid);
        let (result_b, bytes_b, _dir_b) =
            export_to_temp(&buffer, &SymbolSnapshot::empty(), without_grid);
        assert!(result_a.success && result_b.success);
        let strokes_a = count_occurrences(&bytes_a, b"\nS\n");
        let strokes_b = count_occurrences(&bytes_b, b"\nS\n");
        assert_eq!(strokes_a - strokes_b, 10);
    }

    #[test]
    fn unresolved_font_falls_back_to_base14() {
        let mut buffer = CommandBuffer::new();
        buffer.push(
            Command::Text {
                position: Point::new(10.0, 10.0),
                text: "stage left".to_string(),
                style: TextStyle::new("Custom Rig Sans", 10.0),
            },
            "label:1",
        );
        let mut options = ExportOptions::default();
        options.compress_streams = false;
        let (result, bytes, _dir) = export_to_temp(&buffer, &SymbolSnapshot::empty(), options);
        assert!(result.success, "{}", result.message);
        assert_eq!(count_occurrences(&bytes, b"/BaseFont /Helvetica"), 1);
        assert_eq!(count_occurrences(&bytes, b"/FontFile2"), 0);
    }

    #[test]
    fn truncated_font_degrades_and_export_still_succeeds() {
        let mut registry = FontRegistry::new();
        assert!(
            registry
                .register_bytes(vec![0x00, 0x01, 0x00, 0x00, 0xFF], Some("Chopped"))
                .is_err()
        );

        let mut buffer = CommandBuffer::new();
        buffer.push(
            Command::Text {
                position: Point::new(10.0, 10.0),
                text: "downstage".to_string(),
                style: TextStyle::new("Chopped", 10.0),
            },
            "label:1",
        );
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("plan.pdf");
        let mut options = ExportOptions::default();
        options.compress_streams = false;
        let exporter = PlanExporter::new(options).with_fonts(&registry);
        let result = exporter.export(&buffer, &SymbolSnapshot::empty(), &view(), &path);
        assert!(result.success, "{}", result.message);
        let bytes = std::fs::read(&path).expect("file written");
        assert_eq!(count_occurrences(&bytes, b"/BaseFont /Helvetica"), 1);
    }

    #[test]
    fn composition_clips_and_orders_elements() {
        let mut buffer = CommandBuffer::new();
        buffer.push(
            Command::Line {
                from: Point::new(0.0, 0.0),
                to: Point::new(100.0, 100.0),
                stroke: stroke(),
            },
            "truss:1",
        );
        let elements = vec![
            PageElement::new(
                Rect::new(36.0, 36.0, 300.0, 200.0),
                1,
                ElementContent::PlanView(PlanViewElement {
                    buffer,
                    view: view(),
                    framed: true,
                }),
            ),
            PageElement::new(
                Rect::new(36.0, 250.0, 300.0, 120.0),
                0,
                ElementContent::EventTable(EventTable {
                    title: "Summer Tour".to_string(),
                    columns: vec!["Venue".to_string(), "Date".to_string()],
                    rows: vec![vec!["Roxy".to_string(), "2026-08-01".to_string()]],
                }),
            ),
            PageElement::new(
                Rect::new(350.0, 36.0, 200.0, 300.0),
                2,
                ElementContent::Legend(Legend {
                    title: "Fixtures".to_string(),
                    entries: vec![crate::layout::LegendEntry {
                        symbol_id: None,
                        label: "PAR 64".to_string(),
                        count: 24,
                    }],
                }),
            ),
        ];
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("composed.pdf");
        let mut options = ExportOptions::default();
        options.compress_streams = false;
        let exporter = PlanExporter::new(options);
        let result = exporter.export_composition(&elements, &SymbolSnapshot::empty(), &path);
        assert!(result.success, "{}", result.message);
        let bytes = std::fs::read(&path).expect("file written");
        let text = String::from_utf8_lossy(&bytes);
        // One clip per element.
        assert_eq!(count_occurrences(&bytes, b"re\nW\nn\n"), 3);
        // Elements painted in z order: table (z0) before plan (z1) before
        // legend (z2).
        let table_pos = text.find("Summer Tour").expect("table title");
        let legend_pos = text.find("Fixtures").expect("legend title");
        assert!(table_pos < legend_pos);
    }

    #[test]
    fn compressed_streams_decode_to_the_same_operators() {
        let buffer = simple_buffer();
        let mut plain = ExportOptions::default();
        plain.compress_streams = false;
        let mut squeezed = ExportOptions::default();
        squeezed.compress_streams = true;

        let (result_a, bytes_a, _dir_a) =
            export_to_temp(&buffer, &SymbolSnapshot::empty(), plain);
        let (result_b, bytes_b, _dir_b) =
            export_to_temp(&buffer, &SymbolSnapshot::empty(), squeezed);
        assert!(result_a.success && result_b.success);
        assert_eq!(count_occurrences(&bytes_b, b"/Filter /FlateDecode"), 1);

        let doc = lopdf::Document::load_mem(&bytes_b).expect("parse");
        let page_id = *doc.get_pages().get(&1).expect("page 1");
        let contents_id = doc
            .get_object(page_id)
            .and_then(|page| page.as_dict())
            .and_then(|dict| dict.get(b"Contents"))
            .and_then(|obj| obj.as_reference())
            .expect("Contents reference");
        let decoded = doc
            .get_object(contents_id)
            .and_then(|obj| obj.as_stream())
            .expect("content stream")
            .get_plain_content()
            .expect("decompress");
        let decoded_text = String::from_utf8_lossy(&decoded);
        assert!(decoded_text.contains("BT"));
        let plain_text = String::from_utf8_lossy(&bytes_a);
        assert!(plain_text.contains("BT"));
    }

    #[test]
    fn landscape_swaps_media_box() {
        let mut options = ExportOptions::default();
        options.page.orientation = Orientation::Landscape;
        options.compress_streams = false;
        let (result, bytes, _dir) =
            export_to_temp(&simple_buffer(), &SymbolSnapshot::empty(), options);
        assert!(result.success);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("/MediaBox [0 0 841.89 595.28]"));
    }

    #[test]
    fn precision_option_controls_coordinate_digits() {
        let mut buffer = CommandBuffer::new();
        buffer.push(
            Command::Line {
                from: Point::new(10.123456, 10.0),
                to: Point::new(20.0, 20.0),
                stroke: stroke(),
            },
            "truss:1",
        );
        let mut options = ExportOptions::default();
        options.compress_streams = false;
        options.precision = 1;
        options.scale_stroke_widths = false;
        let (result, bytes, _dir) = export_to_temp(&buffer, &SymbolSnapshot::empty(), options);
        assert!(result.success);
        let text = String::from_utf8_lossy(&bytes);
        let content_start = text.find("stream\n").expect("stream");
        let content_end = text.find("endstream").expect("endstream");
        let content = &text[content_start..content_end];
        for token in content.split_whitespace() {
            if let Some(dot) = token.find('.') {
                let decimals = token.len() - dot - 1;
                assert!(
                    decimals <= 1,
                    "token {token} has more than one decimal place"
                );
            }
        }
    }
}
