use crate::command::{Command, CommandBuffer, StrokeStyle, TextStyle, DEFAULT_SOURCE_KEY};
use crate::simplify::FootprintSimplifier;
use crate::types::{Affine, Color, Point, Transform, ViewState};
use tracing::debug;

/// The capability surface every 2D backend implements: the screen canvas,
/// the recorder and the multiplexer all speak this trait, so the scene
/// renderer draws once regardless of who is listening.
pub trait Canvas2D {
    fn begin_frame(&mut self, view: ViewState);
    fn end_frame(&mut self);

    fn save(&mut self);
    fn restore(&mut self);
    fn set_transform(&mut self, transform: Transform);
    fn set_source_key(&mut self, key: &str);

    fn line(&mut self, from: Point, to: Point, stroke: StrokeStyle);
    fn polyline(&mut self, points: &[Point], stroke: StrokeStyle);
    fn polygon(&mut self, points: &[Point], stroke: StrokeStyle, fill: Option<Color>);
    fn rect(
        &mut self,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        stroke: StrokeStyle,
        fill: Option<Color>,
    );
    fn circle(&mut self, center: Point, radius: f32, stroke: StrokeStyle, fill: Option<Color>);
    fn text(&mut self, position: Point, text: &str, style: &TextStyle);

    fn begin_symbol(&mut self, key: &str);
    fn end_symbol(&mut self, key: &str);
    fn place_symbol(&mut self, key: &str);
    fn place_symbol_instance(&mut self, id: u32, transform: Affine);
}

struct SymbolCapture {
    key: String,
    buffer: CommandBuffer,
}

/// Captures every draw call into a [`CommandBuffer`], optionally collapsing
/// same-provenance primitive runs through the footprint simplifier.
///
/// This is a capture path: malformed nesting (unbalanced restores, an
/// `end_symbol` for a key that is not open) is tolerated and logged, never
/// raised, so a frame in progress cannot be aborted by a confused producer.
pub struct RecordingCanvas {
    buffer: CommandBuffer,
    view: Option<ViewState>,
    in_frame: bool,
    source: String,
    transform: Transform,
    transform_stack: Vec<Transform>,
    simplify: bool,
    simplifier: FootprintSimplifier,
    run: Vec<Command>,
    run_source: String,
    symbol: Option<SymbolCapture>,
}

impl RecordingCanvas {
    pub fn new(simplify: bool) -> Self {
        Self {
            buffer: CommandBuffer::new(),
            view: None,
            in_frame: false,
            source: DEFAULT_SOURCE_KEY.to_string(),
            transform: Transform::IDENTITY,
            transform_stack: Vec::new(),
            simplify,
            simplifier: FootprintSimplifier::new(),
            run: Vec::new(),
            run_source: String::new(),
            symbol: None,
        }
    }

    pub fn view(&self) -> Option<ViewState> {
        self.view
    }

    pub fn buffer(&self) -> &CommandBuffer {
        &self.buffer
    }

    /// Hands the captured buffer out and resets the recorder for the next
    /// session.
    pub fn take_buffer(&mut self) -> CommandBuffer {
        self.flush_run();
        std::mem::take(&mut self.buffer)
    }

    fn push(&mut self, command: Command) {
        let source = self.source.clone();
        match self.symbol.as_mut() {
            Some(capture) => capture.buffer.push(command, &source),
            None => self.buffer.push(command, &source),
        }
    }

    fn record_primitive(&mut self, command: Command) {
        // Simplification only groups top-level geometry; symbol definitions
        // are kept verbatim.
        if !self.simplify || self.symbol.is_some() {
            self.push(command);
            return;
        }
        if self.run_source != self.source {
            self.flush_run();
            self.run_source = self.source.clone();
        }
        self.run.push(command);
    }

    fn record_barrier(&mut self, command: Command) {
        self.flush_run();
        self.push(command);
    }

    fn flush_run(&mut self) {
        if self.run.is_empty() {
            return;
        }
        let run = std::mem::take(&mut self.run);
        let source = std::mem::take(&mut self.run_source);
        match self.simplifier.simplify_run(&source, &run) {
            Some(simplified) => self.buffer.push(simplified, &source),
            None => {
                for command in run {
                    self.buffer.push(command, &source);
                }
            }
        }
    }
}

impl Canvas2D for RecordingCanvas {
    fn begin_frame(&mut self, view: ViewState) {
        if self.in_frame {
            debug!("begin_frame while a frame is open; restarting capture");
        }
        self.buffer.clear();
        self.view = Some(view);
        self.in_frame = true;
        self.source = DEFAULT_SOURCE_KEY.to_string();
        self.transform = Transform::IDENTITY;
        self.transform_stack.clear();
        self.simplifier.clear();
        self.run.clear();
        self.run_source.clear();
        self.symbol = None;
    }

    fn end_frame(&mut self) {
        if let Some(capture) = self.symbol.take() {
            debug!(key = %capture.key, "frame ended with an open symbol; discarding capture");
        }
        self.flush_run();
        self.in_frame = false;
    }

    fn save(&mut self) {
        self.transform_stack.push(self.transform);
        self.record_barrier(Command::Save);
    }

    fn restore(&mut self) {
        match self.transform_stack.pop() {
            Some(previous) => {
                self.transform = previous;
                self.record_barrier(Command::Restore);
            }
            None => {
                // Unbalanced restore from a confused producer; drop it.
                debug!("restore without matching save ignored");
            }
        }
    }

    fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
        self.record_barrier(Command::SetTransform(transform));
    }

    fn set_source_key(&mut self, key: &str) {
        if self.source != key {
            self.flush_run();
            self.source = key.to_string();
        }
    }

    fn line(&mut self, from: Point, to: Point, stroke: StrokeStyle) {
        self.record_primitive(Command::Line { from, to, stroke });
    }

    fn polyline(&mut self, points: &[Point], stroke: StrokeStyle) {
        self.record_primitive(Command::Polyline {
            points: points.to_vec(),
            stroke,
        });
    }

    fn polygon(&mut self, points: &[Point], stroke: StrokeStyle, fill: Option<Color>) {
        self.record_primitive(Command::Polygon {
            points: points.to_vec(),
            stroke,
            fill,
        });
    }

    fn rect(
        &mut self,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        stroke: StrokeStyle,
        fill: Option<Color>,
    ) {
        self.record_primitive(Command::Rectangle {
            x,
            y,
            width,
            height,
            stroke,
            fill,
        });
    }

    fn circle(&mut self, center: Point, radius: f32, stroke: StrokeStyle, fill: Option<Color>) {
        self.record_primitive(Command::Circle {
            center,
            radius,
            stroke,
            fill,
        });
    }

    fn text(&mut self, position: Point, text: &str, style: &TextStyle) {
        self.record_barrier(Command::Text {
            position,
            text: text.to_string(),
            style: style.clone(),
        });
    }

    fn begin_symbol(&mut self, key: &str) {
        if let Some(open) = self.symbol.as_ref() {
            debug!(open = %open.key, requested = %key, "begin_symbol while another capture is open; ignored");
            return;
        }
        self.flush_run();
        self.symbol = Some(SymbolCapture {
            key: key.to_string(),
            buffer: CommandBuffer::new(),
        });
    }

    fn end_symbol(&mut self, key: &str) {
        match self.symbol.take() {
            Some(capture) if capture.key == key => {
                let source = self.source.clone();
                self.buffer.push(
                    Command::BeginSymbol {
                        key: capture.key.clone(),
                    },
                    &source,
                );
                self.buffer.append(&capture.buffer);
                self.buffer
                    .push(Command::EndSymbol { key: capture.key }, &source);
            }
            other => {
                debug!(key = %key, "end_symbol without matching begin_symbol ignored");
                self.symbol = other;
            }
        }
    }

    fn place_symbol(&mut self, key: &str) {
        self.record_barrier(Command::PlaceSymbol {
            key: key.to_string(),
        });
    }

    fn place_symbol_instance(&mut self, id: u32, transform: Affine) {
        self.record_barrier(Command::PlaceSymbolInstance { id, transform });
    }
}

/// Fans every call out to a set of child canvases, so one render pass can
/// feed the screen and a recorder at once.
#[derive(Default)]
pub struct MultiplexCanvas {
    children: Vec<Box<dyn Canvas2D>>,
}

impl MultiplexCanvas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, canvas: Box<dyn Canvas2D>) {
        self.children.push(canvas);
    }

    pub fn children(&self) -> usize {
        self.children.len()
    }

    pub fn child(&self, index: usize) -> Option<&dyn Canvas2D> {
        self.children.get(index).map(|c| c.as_ref())
    }

    pub fn child_mut(&mut self, index: usize) -> Option<&mut (dyn Canvas2D + 'static)> {
        self.children.get_mut(index).map(|c| c.as_mut())
    }
}

impl Canvas2D for MultiplexCanvas {
    fn begin_frame(&mut self, view: ViewState) {
        for child in &mut self.children {
            child.begin_frame(view);
        }
    }

    fn end_frame(&mut self) {
        for child in &mut self.children {
            child.end_frame();
        }
    }

    fn save(&mut self) {
        for child in &mut self.children {
            child.save();
        }
    }

    fn restore(&mut self) {
        for child in &mut self.children {
            child.restore();
        }
    }

    fn set_transform(&mut self, transform: Transform) {
        for child in &mut self.children {
            child.set_transform(transform);
        }
    }

    fn set_source_key(&mut self, key: &str) {
        for child in &mut self.children {
            child.set_source_key(key);
        }
    }

    fn line(&mut self, from: Point, to: Point, stroke: StrokeStyle) {
        for child in &mut self.children {
            child.line(from, to, stroke);
        }
    }

    fn polyline(&mut self, points: &[Point], stroke: StrokeStyle) {
        for child in &mut self.children {
            child.polyline(points, stroke);
        }
    }

    fn polygon(&mut self, points: &[Point], stroke: StrokeStyle, fill: Option<Color>) {
        for child in &mut self.children {
            child.polygon(points, stroke, fill);
        }
    }

    fn rect(
        &mut self,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        stroke: StrokeStyle,
        fill: Option<Color>,
    ) {
        for child in &mut self.children {
            child.rect(x, y, width, height, stroke, fill);
        }
    }

    fn circle(&mut self, center: Point, radius: f32, stroke: StrokeStyle, fill: Option<Color>) {
        for child in &mut self.children {
            child.circle(center, radius, stroke, fill);
        }
    }

    fn text(&mut self, position: Point, text: &str, style: &TextStyle) {
        for child in &mut self.children {
            child.text(position, text, style);
        }
    }

    fn begin_symbol(&mut self, key: &str) {
        for child in &mut self.children {
            child.begin_symbol(key);
        }
    }

    fn end_symbol(&mut self, key: &str) {
        for child in &mut self.children {
            child.end_symbol(key);
        }
    }

    fn place_symbol(&mut self, key: &str) {
        for child in &mut self.children {
            child.place_symbol(key);
        }
    }

    fn place_symbol_instance(&mut self, id: u32, transform: Affine) {
        for child in &mut self.children {
            child.place_symbol_instance(id, transform);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandMeta;

    fn stroke() -> StrokeStyle {
        StrokeStyle::hairline()
    }

    fn view() -> ViewState {
        ViewState::new(800.0, 600.0, 1.0)
    }

    fn replay_square(canvas: &mut dyn Canvas2D, source: &str, cx: f32, cy: f32) {
        canvas.set_source_key(source);
        canvas.polygon(
            &[
                Point::new(cx - 0.5, cy - 0.5),
                Point::new(cx + 0.5, cy - 0.5),
                Point::new(cx + 0.5, cy + 0.5),
                Point::new(cx - 0.5, cy + 0.5),
            ],
            stroke(),
            Some(Color::WHITE),
        );
    }

    #[test]
    fn recording_without_simplification_is_a_round_trip() {
        let mut canvas = RecordingCanvas::new(false);
        canvas.begin_frame(view());
        canvas.set_source_key("fixture:1");
        canvas.line(Point::new(0.0, 0.0), Point::new(1.0, 0.0), stroke());
        canvas.circle(Point::new(0.5, 0.5), 0.25, stroke(), None);
        canvas.text(
            Point::new(0.0, 1.0),
            "dimmer 12",
            &TextStyle::new("Helvetica", 8.0),
        );
        canvas.set_source_key("fixture:2");
        canvas.rect(2.0, 2.0, 1.0, 1.0, stroke(), Some(Color::WHITE));
        canvas.end_frame();

        let buffer = canvas.take_buffer();
        assert_eq!(buffer.len(), 4);
        assert!(matches!(buffer.commands()[0], Command::Line { .. }));
        assert!(matches!(buffer.commands()[1], Command::Circle { .. }));
        assert!(matches!(buffer.commands()[2], Command::Text { .. }));
        assert!(matches!(buffer.commands()[3], Command::Rectangle { .. }));
        assert_eq!(buffer.source(0), "fixture:1");
        assert_eq!(buffer.source(3), "fixture:2");
        assert_eq!(buffer.meta(0), CommandMeta::of(&buffer.commands()[0]));
    }

    #[test]
    fn simplification_collapses_same_source_runs() {
        let mut canvas = RecordingCanvas::new(true);
        canvas.begin_frame(view());
        // Two fixtures of the same model, drawn as multi-primitive icons.
        for (source, cx) in [("fixture:1", 0.0), ("fixture:2", 4.0)] {
            canvas.set_source_key(source);
            canvas.rect(cx - 0.5, -0.5, 1.0, 1.0, stroke(), None);
            canvas.line(Point::new(cx - 0.5, -0.5), Point::new(cx + 0.5, 0.5), stroke());
            canvas.line(Point::new(cx - 0.5, 0.5), Point::new(cx + 0.5, -0.5), stroke());
        }
        canvas.end_frame();

        let buffer = canvas.take_buffer();
        // Each three-primitive icon collapses to one footprint primitive.
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.source(0), "fixture:1");
        assert_eq!(buffer.source(1), "fixture:2");
    }

    #[test]
    fn barriers_split_runs() {
        let mut canvas = RecordingCanvas::new(true);
        canvas.begin_frame(view());
        replay_square(&mut canvas, "fixture:1", 0.0, 0.0);
        canvas.save();
        replay_square(&mut canvas, "fixture:1", 4.0, 0.0);
        canvas.restore();
        canvas.end_frame();

        let buffer = canvas.take_buffer();
        let kinds: Vec<_> = buffer.commands().iter().map(std::mem::discriminant).collect();
        // simplified, Save, simplified, Restore
        assert_eq!(buffer.len(), 4);
        assert!(matches!(buffer.commands()[1], Command::Save));
        assert!(matches!(buffer.commands()[3], Command::Restore));
        assert_eq!(kinds[0], kinds[2]);
    }

    #[test]
    fn unbalanced_restore_is_ignored() {
        let mut canvas = RecordingCanvas::new(false);
        canvas.begin_frame(view());
        canvas.restore();
        canvas.restore();
        canvas.save();
        canvas.restore();
        canvas.end_frame();

        let buffer = canvas.take_buffer();
        assert_eq!(buffer.len(), 2);
        assert!(matches!(buffer.commands()[0], Command::Save));
        assert!(matches!(buffer.commands()[1], Command::Restore));
    }

    #[test]
    fn symbol_capture_is_origin_relative_and_bracketed() {
        let mut canvas = RecordingCanvas::new(false);
        canvas.begin_frame(view());
        canvas.set_source_key("moving-head");
        canvas.begin_symbol("gdtf:spot@plan#3");
        canvas.circle(Point::new(0.0, 0.0), 0.3, stroke(), Some(Color::WHITE));
        canvas.rect(-0.2, -0.2, 0.4, 0.4, stroke(), None);
        canvas.end_symbol("gdtf:spot@plan#3");
        canvas.place_symbol_instance(7, Affine::translate(10.0, 5.0));
        canvas.end_frame();

        let buffer = canvas.take_buffer();
        assert_eq!(buffer.len(), 5);
        assert!(matches!(buffer.commands()[0], Command::BeginSymbol { .. }));
        assert!(matches!(buffer.commands()[1], Command::Circle { .. }));
        assert!(matches!(buffer.commands()[2], Command::Rectangle { .. }));
        assert!(matches!(buffer.commands()[3], Command::EndSymbol { .. }));
        assert!(matches!(
            buffer.commands()[4],
            Command::PlaceSymbolInstance { id: 7, .. }
        ));
    }

    #[test]
    fn mismatched_end_symbol_is_ignored() {
        let mut canvas = RecordingCanvas::new(false);
        canvas.begin_frame(view());
        canvas.begin_symbol("a");
        canvas.circle(Point::new(0.0, 0.0), 1.0, stroke(), None);
        canvas.end_symbol("b");
        canvas.end_symbol("a");
        canvas.end_frame();

        let buffer = canvas.take_buffer();
        assert_eq!(buffer.len(), 3);
        assert!(matches!(buffer.commands()[0], Command::BeginSymbol { .. }));
        assert!(matches!(buffer.commands()[2], Command::EndSymbol { .. }));
    }

    #[test]
    fn multiplexer_fans_out_to_all_children() {
        let mut mux = MultiplexCanvas::new();
        mux.add(Box::new(RecordingCanvas::new(false)));
        mux.add(Box::new(RecordingCanvas::new(false)));
        mux.begin_frame(view());
        mux.set_source_key("truss:1");
        mux.line(Point::new(0.0, 0.0), Point::new(12.0, 0.0), stroke());
        mux.end_frame();
        assert_eq!(mux.children(), 2);
    }
}
