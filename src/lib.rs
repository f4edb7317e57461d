//! rigplot: 2D plan capture and vector PDF export for stage-lighting and
//! rigging layouts.
//!
//! The pipeline has three stages sharing one command language:
//!
//! 1. A scene renderer draws a 2D plan through the [`Canvas2D`] trait. The
//!    [`RecordingCanvas`] captures those calls into a [`CommandBuffer`] and,
//!    when enabled, collapses repeated fixture footprints into classified
//!    primitive shapes; the [`MultiplexCanvas`] lets the same pass feed the
//!    screen and the recorder at once.
//! 2. Repeated model geometry is recorded once in a [`SymbolCache`] and
//!    placed by id and transform; [`SymbolCache::snapshot`] hands an
//!    immutable view to the export side.
//! 3. The [`PlanExporter`] replays buffer and snapshot into a PDF 1.4 file:
//!    symbol definitions become Form XObjects, TrueType metrics are parsed
//!    for WinAnsi embedding, streams optionally deflate, and layout elements
//!    (legend, event table, text boxes, framed sub-views) composite onto one
//!    page.

mod canvas;
mod command;
mod error;
mod flate;
mod font;
mod layout;
mod pdf;
mod simplify;
mod symbol;
mod types;

pub use canvas::{Canvas2D, MultiplexCanvas, RecordingCanvas};
pub use command::{
    Command, CommandBuffer, CommandMeta, StrokeStyle, TextAlign, TextMetrics, TextStyle,
    DEFAULT_SOURCE_KEY, GRID_SOURCE_KEY,
};
pub use error::RigPlotError;
pub use font::{FontMetrics, FontRegistry, RegisteredFont};
pub use layout::{
    ElementContent, EventTable, Legend, LegendEntry, PageElement, PlanViewElement, TextBox,
};
pub use pdf::{ExportOptions, ExportResult, PageSetup, PlanExporter};
pub use simplify::{
    FootprintSimplifier, FootprintTemplate, ShapeClass, ASPECT_TOLERANCE, HULL_AREA_RATIO,
};
pub use symbol::{SymbolCache, SymbolDefinition, SymbolKey, SymbolSnapshot};
pub use types::{
    Affine, Bounds, Color, Margins, Orientation, Point, ProjectionView, Pt, Rect, Size, Transform,
    ViewState,
};

#[cfg(test)]
mod tests {
    use super::*;

    /// End-to-end: record a small plan with instancing, snapshot the cache,
    /// export, and check the produced file is a coherent PDF.
    #[test]
    fn record_snapshot_export_round_trip() {
        let mut cache = SymbolCache::new();
        let key = SymbolKey::new("gdtf:par64", ProjectionView::Plan, 1);
        let definition = cache.get_or_create(&key, |key, id| {
            let mut recorder = RecordingCanvas::new(false);
            recorder.begin_frame(ViewState::new(100.0, 100.0, 1.0));
            recorder.set_source_key(&key.model);
            recorder.circle(
                Point::new(0.0, 0.0),
                0.4,
                StrokeStyle::hairline(),
                Some(Color::WHITE),
            );
            recorder.end_frame();
            let buffer = recorder.take_buffer();
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

        let mut recorder = RecordingCanvas::new(true);
        recorder.begin_frame(ViewState::new(800.0, 600.0, 1.0));
        recorder.set_source_key(GRID_SOURCE_KEY);
        for i in 0..5 {
            recorder.line(
                Point::new(i as f32 * 100.0, 0.0),
                Point::new(i as f32 * 100.0, 600.0),
                StrokeStyle::new(Color::rgb(0.8, 0.8, 0.8), 0.5),
            );
        }
        recorder.set_source_key("truss:main");
        recorder.rect(100.0, 50.0, 400.0, 20.0, StrokeStyle::hairline(), None);
        for i in 0..8 {
            recorder.set_source_key("fixture:instances");
            recorder.place_symbol_instance(
                definition.id,
                Affine::translate(120.0 + i as f32 * 50.0, 60.0),
            );
        }
        recorder.set_source_key("label:main");
        recorder.text(
            Point::new(100.0, 80.0),
            "Main truss",
            &TextStyle::new("Helvetica", 9.0),
        );
        recorder.end_frame();

        let buffer = recorder.take_buffer();
        let snapshot = cache.snapshot();
        let view = recorder.view().expect("view recorded");

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stage.pdf");
        let exporter = PlanExporter::new(ExportOptions::default());
        let result = exporter.export(&buffer, &snapshot, &view, &path);
        assert!(result.success, "{}", result.message);

        let bytes = std::fs::read(&path).expect("file written");
        let doc = lopdf::Document::load_mem(&bytes).expect("valid pdf");
        assert_eq!(doc.get_pages().len(), 1);
    }
}
