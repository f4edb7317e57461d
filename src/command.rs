use crate::types::{Affine, Color, Point, Transform};

/// Source key under which the scene renderer records its background grid.
/// Export drops these primitives when the grid-inclusion flag is off.
pub const GRID_SOURCE_KEY: &str = "grid";

/// Provenance tag applied to primitives recorded before any `set_source_key`
/// call of the session.
pub const DEFAULT_SOURCE_KEY: &str = "";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrokeStyle {
    pub color: Color,
    pub width: f32,
}

impl StrokeStyle {
    pub fn new(color: Color, width: f32) -> Self {
        Self { color, width }
    }

    pub fn hairline() -> Self {
        Self {
            color: Color::BLACK,
            width: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextAlign {
    Left,
    Center,
    Right,
}

/// Exact vertical metrics captured from the live renderer, when available.
/// Export prefers these over values re-derived from the embedded font so the
/// paper output matches what was on screen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextMetrics {
    pub ascent: f32,
    pub descent: f32,
    pub line_height: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextStyle {
    pub family: String,
    pub size: f32,
    pub color: Color,
    pub align: TextAlign,
    pub outline: Option<Color>,
    pub metrics: Option<TextMetrics>,
}

impl TextStyle {
    pub fn new(family: impl Into<String>, size: f32) -> Self {
        Self {
            family: family.into(),
            size,
            color: Color::BLACK,
            align: TextAlign::Left,
            outline: None,
            metrics: None,
        }
    }
}

/// One recorded draw operation. The closed set of variants is the shared
/// language between producers (scene renderers) and consumers (screen canvas,
/// exporters).
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Line {
        from: Point,
        to: Point,
        stroke: StrokeStyle,
    },
    Polyline {
        points: Vec<Point>,
        stroke: StrokeStyle,
    },
    Polygon {
        points: Vec<Point>,
        stroke: StrokeStyle,
        fill: Option<Color>,
    },
    Rectangle {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        stroke: StrokeStyle,
        fill: Option<Color>,
    },
    Circle {
        center: Point,
        radius: f32,
        stroke: StrokeStyle,
        fill: Option<Color>,
    },
    Text {
        position: Point,
        text: String,
        style: TextStyle,
    },
    Save,
    Restore,
    SetTransform(Transform),
    BeginSymbol {
        key: String,
    },
    EndSymbol {
        key: String,
    },
    PlaceSymbol {
        key: String,
    },
    PlaceSymbolInstance {
        id: u32,
        transform: Affine,
    },
}

impl Command {
    /// Barrier commands flush any pending same-provenance primitive group
    /// before being processed and forbid merging geometry across them.
    pub fn is_barrier(&self) -> bool {
        matches!(
            self,
            Command::Save
                | Command::Restore
                | Command::SetTransform(_)
                | Command::Text { .. }
                | Command::BeginSymbol { .. }
                | Command::EndSymbol { .. }
                | Command::PlaceSymbol { .. }
                | Command::PlaceSymbolInstance { .. }
        )
    }

    pub fn has_stroke(&self) -> bool {
        matches!(
            self,
            Command::Line { .. }
                | Command::Polyline { .. }
                | Command::Polygon { .. }
                | Command::Rectangle { .. }
                | Command::Circle { .. }
        )
    }

    pub fn has_fill(&self) -> bool {
        match self {
            Command::Polygon { fill, .. }
            | Command::Rectangle { fill, .. }
            | Command::Circle { fill, .. } => fill.is_some(),
            _ => false,
        }
    }
}

/// Per-command metadata kept alongside the provenance array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandMeta {
    pub has_stroke: bool,
    pub has_fill: bool,
}

impl CommandMeta {
    pub fn of(command: &Command) -> Self {
        Self {
            has_stroke: command.has_stroke(),
            has_fill: command.has_fill(),
        }
    }
}

/// An ordered, append-only sequence of commands with parallel per-command
/// provenance and metadata arrays. The three arrays are always the same
/// length.
#[derive(Debug, Clone, Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
    sources: Vec<String>,
    meta: Vec<CommandMeta>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command, source: &str) {
        self.meta.push(CommandMeta::of(&command));
        self.sources.push(source.to_string());
        self.commands.push(command);
    }

    pub fn append(&mut self, other: &CommandBuffer) {
        self.commands.extend(other.commands.iter().cloned());
        self.sources.extend(other.sources.iter().cloned());
        self.meta.extend(other.meta.iter().copied());
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
        self.sources.clear();
        self.meta.clear();
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn source(&self, index: usize) -> &str {
        &self.sources[index]
    }

    pub fn meta(&self, index: usize) -> CommandMeta {
        self.meta[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Command, &str, CommandMeta)> {
        self.commands
            .iter()
            .zip(self.sources.iter())
            .zip(self.meta.iter())
            .map(|((command, source), meta)| (command, source.as_str(), *meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stroke() -> StrokeStyle {
        StrokeStyle::hairline()
    }

    #[test]
    fn parallel_arrays_stay_in_sync() {
        let mut buffer = CommandBuffer::new();
        buffer.push(
            Command::Line {
                from: Point::new(0.0, 0.0),
                to: Point::new(1.0, 1.0),
                stroke: stroke(),
            },
            "fixture:1",
        );
        buffer.push(Command::Save, "fixture:1");
        buffer.push(
            Command::Circle {
                center: Point::new(0.5, 0.5),
                radius: 0.25,
                stroke: stroke(),
                fill: Some(Color::WHITE),
            },
            "fixture:2",
        );
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.source(0), "fixture:1");
        assert_eq!(buffer.source(2), "fixture:2");
        assert!(buffer.meta(0).has_stroke);
        assert!(!buffer.meta(0).has_fill);
        assert!(buffer.meta(2).has_fill);
        assert_eq!(buffer.iter().count(), 3);
    }

    #[test]
    fn barrier_classification_covers_control_commands() {
        assert!(Command::Save.is_barrier());
        assert!(Command::Restore.is_barrier());
        assert!(Command::SetTransform(Transform::IDENTITY).is_barrier());
        assert!(
            Command::Text {
                position: Point::default(),
                text: "PAR 64".into(),
                style: TextStyle::new("Helvetica", 10.0),
            }
            .is_barrier()
        );
        assert!(
            Command::PlaceSymbolInstance {
                id: 1,
                transform: Affine::IDENTITY,
            }
            .is_barrier()
        );
        assert!(
            !Command::Line {
                from: Point::default(),
                to: Point::new(1.0, 0.0),
                stroke: stroke(),
            }
            .is_barrier()
        );
    }

    #[test]
    fn fill_detection_requires_fill_color() {
        let open = Command::Polygon {
            points: vec![Point::new(0.0, 0.0), Point::new(1.0, 0.0), Point::new(0.0, 1.0)],
            stroke: stroke(),
            fill: None,
        };
        let filled = Command::Polygon {
            points: vec![Point::new(0.0, 0.0), Point::new(1.0, 0.0), Point::new(0.0, 1.0)],
            stroke: stroke(),
            fill: Some(Color::BLACK),
        };
        assert!(!open.has_fill());
        assert!(filled.has_fill());
    }
}
