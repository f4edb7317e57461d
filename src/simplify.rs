use crate::command::{Command, StrokeStyle};
use crate::types::{Color, Point};
use std::collections::HashMap;

/// Aspect tolerance below which an oriented footprint counts as circular.
/// Empirical; tunable, not guaranteed optimal.
pub const ASPECT_TOLERANCE: f32 = 0.1;

/// Hull-to-oriented-bbox area ratio below which the hull outline is kept
/// instead of a plain rectangle. Empirical; tunable, not guaranteed optimal.
pub const HULL_AREA_RATIO: f32 = 0.6;

/// Circles contribute a fixed low-resolution ring of sample vertices to the
/// footprint measurement.
const CIRCLE_SAMPLE_SEGMENTS: usize = 12;

/// Runs with fewer vertices than this are left untouched.
const MIN_RUN_POINTS: usize = 3;

/// Covariance magnitudes below this count as degenerate; the axis angle
/// falls back to zero.
const COVARIANCE_EPSILON: f32 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeClass {
    Circle,
    Rectangle,
    Hull,
}

/// Cached classification for one source key. Shape decisions are made on the
/// first run of a key and reused for every later run within the session;
/// size and placement are re-measured per run.
#[derive(Debug, Clone)]
pub struct FootprintTemplate {
    pub shape: ShapeClass,
    pub ref_width: f32,
    pub ref_height: f32,
    /// Hull vertices normalized into the canonical axis-aligned unit frame
    /// (each coordinate in -1..=1 relative to the half-extents). Empty for
    /// circle and rectangle templates.
    pub hull: Vec<Point>,
    pub stroke: StrokeStyle,
    pub fill: Option<Color>,
}

/// Measured pose of one concrete run: centroid, dominant axis and oriented
/// extents.
#[derive(Debug, Clone)]
struct RunMeasure {
    centroid: Point,
    angle: f32,
    width: f32,
    height: f32,
    hull: Vec<Point>,
    hull_area: f32,
}

/// Collapses a contiguous same-provenance run of stroke/fill-bearing
/// primitives into one classified footprint primitive. Template cache lives
/// for a single recording session.
#[derive(Debug, Default)]
pub struct FootprintSimplifier {
    templates: HashMap<String, FootprintTemplate>,
}

impl FootprintSimplifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops all cached templates. Called at `begin_frame`.
    pub fn clear(&mut self) {
        self.templates.clear();
    }

    pub fn template(&self, source: &str) -> Option<&FootprintTemplate> {
        self.templates.get(source)
    }

    /// Attempts to replace `run` with one simplified primitive. Returns
    /// `None` when the run is degenerate (too few points, zero extent,
    /// collapsed hull); callers then pass the original primitives through
    /// unchanged.
    pub fn simplify_run(&mut self, source: &str, run: &[Command]) -> Option<Command> {
        let points = collect_vertices(run);
        if points.len() < MIN_RUN_POINTS {
            return None;
        }

        let measure = measure_run(&points)?;
        if measure.width <= 0.0 || measure.height <= 0.0 {
            return None;
        }

        let (stroke, fill) = run_style(run);

        let template = match self.templates.get(source) {
            Some(existing) => existing.clone(),
            None => {
                let template = classify(&measure, stroke, fill);
                self.templates.insert(source.to_string(), template.clone());
                template
            }
        };

        Some(emit(&template, &measure, stroke, fill))
    }
}

fn collect_vertices(run: &[Command]) -> Vec<Point> {
    let mut points = Vec::new();
    for command in run {
        match command {
            Command::Line { from, to, .. } => {
                points.push(*from);
                points.push(*to);
            }
            Command::Polyline { points: p, .. } | Command::Polygon { points: p, .. } => {
                points.extend_from_slice(p);
            }
            Command::Rectangle {
                x,
                y,
                width,
                height,
                ..
            } => {
                points.push(Point::new(*x, *y));
                points.push(Point::new(*x + *width, *y));
                points.push(Point::new(*x + *width, *y + *height));
                points.push(Point::new(*x, *y + *height));
            }
            Command::Circle { center, radius, .. } => {
                for i in 0..CIRCLE_SAMPLE_SEGMENTS {
                    let theta =
                        (i as f32) * core::f32::consts::TAU / (CIRCLE_SAMPLE_SEGMENTS as f32);
                    points.push(Point::new(
                        center.x + radius * libm::cosf(theta),
                        center.y + radius * libm::sinf(theta),
                    ));
                }
            }
            _ => {}
        }
    }
    points
}

fn measure_run(points: &[Point]) -> Option<RunMeasure> {
    let n = points.len() as f32;
    let mut cx = 0.0f32;
    let mut cy = 0.0f32;
    for p in points {
        cx += p.x;
        cy += p.y;
    }
    cx /= n;
    cy /= n;

    // 2x2 covariance of the centered cloud; the principal eigenvector gives
    // the dominant axis.
    let mut cxx = 0.0f32;
    let mut cxy = 0.0f32;
    let mut cyy = 0.0f32;
    for p in points {
        let dx = p.x - cx;
        let dy = p.y - cy;
        cxx += dx * dx;
        cxy += dx * dy;
        cyy += dy * dy;
    }
    cxx /= n;
    cxy /= n;
    cyy /= n;

    let angle = if cxy.abs() < COVARIANCE_EPSILON && (cxx - cyy).abs() < COVARIANCE_EPSILON {
        0.0
    } else {
        0.5 * libm::atan2f(2.0 * cxy, cxx - cyy)
    };

    let cos = libm::cosf(angle);
    let sin = libm::sinf(angle);

    let mut min_u = f32::INFINITY;
    let mut max_u = f32::NEG_INFINITY;
    let mut min_v = f32::INFINITY;
    let mut max_v = f32::NEG_INFINITY;
    for p in points {
        let dx = p.x - cx;
        let dy = p.y - cy;
        let u = dx * cos + dy * sin;
        let v = -dx * sin + dy * cos;
        min_u = min_u.min(u);
        max_u = max_u.max(u);
        min_v = min_v.min(v);
        max_v = max_v.max(v);
    }

    let hull = convex_hull(points);
    if hull.len() < 3 {
        return None;
    }
    let hull_area = polygon_area(&hull).abs();

    Some(RunMeasure {
        centroid: Point::new(cx, cy),
        angle,
        width: max_u - min_u,
        height: max_v - min_v,
        hull,
        hull_area,
    })
}

/// Andrew's monotone chain. Returns the hull in counter-clockwise order
/// without the closing point; collapses to fewer than 3 points for colinear
/// input.
pub fn convex_hull(points: &[Point]) -> Vec<Point> {
    let mut sorted: Vec<Point> = points.to_vec();
    sorted.sort_by(|a, b| {
        a.x.partial_cmp(&b.x)
            .unwrap_or(core::cmp::Ordering::Equal)
            .then(a.y.partial_cmp(&b.y).unwrap_or(core::cmp::Ordering::Equal))
    });
    sorted.dedup_by(|a, b| a.x == b.x && a.y == b.y);
    if sorted.len() < 3 {
        return sorted;
    }

    let cross = |o: Point, a: Point, b: Point| -> f32 {
        (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
    };

    let mut lower: Vec<Point> = Vec::new();
    for &p in &sorted {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0 {
            lower.pop();
        }
        lower.push(p);
    }

    let mut upper: Vec<Point> = Vec::new();
    for &p in sorted.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0 {
            upper.pop();
        }
        upper.push(p);
    }

    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

/// Signed area via the shoelace formula; positive for counter-clockwise
/// winding.
pub fn polygon_area(points: &[Point]) -> f32 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0f32;
    for i in 0..points.len() {
        let a = points[i];
        let b = points[(i + 1) % points.len()];
        sum += a.x * b.y - b.x * a.y;
    }
    sum * 0.5
}

fn run_style(run: &[Command]) -> (StrokeStyle, Option<Color>) {
    let mut stroke = StrokeStyle::hairline();
    let mut fill = None;
    for command in run {
        match command {
            Command::Line { stroke: s, .. } | Command::Polyline { stroke: s, .. } => {
                stroke = *s;
            }
            Command::Polygon {
                stroke: s, fill: f, ..
            }
            | Command::Rectangle {
                stroke: s, fill: f, ..
            }
            | Command::Circle {
                stroke: s, fill: f, ..
            } => {
                stroke = *s;
                if fill.is_none() {
                    fill = *f;
                }
            }
            _ => {}
        }
    }
    (stroke, fill)
}

fn classify(measure: &RunMeasure, stroke: StrokeStyle, fill: Option<Color>) -> FootprintTemplate {
    let max_extent = measure.width.max(measure.height);
    let aspect_delta = (measure.width - measure.height).abs() / max_extent;
    if aspect_delta < ASPECT_TOLERANCE {
        return FootprintTemplate {
            shape: ShapeClass::Circle,
            ref_width: measure.width,
            ref_height: measure.height,
            hull: Vec::new(),
            stroke,
            fill,
        };
    }

    let rect_area = measure.width * measure.height;
    if rect_area > 0.0 && measure.hull_area / rect_area < HULL_AREA_RATIO {
        // Store the hull normalized into the canonical axis-aligned frame so
        // later runs can re-scale it to their own measured extents.
        let cos = libm::cosf(measure.angle);
        let sin = libm::sinf(measure.angle);
        let half_w = measure.width * 0.5;
        let half_h = measure.height * 0.5;
        let hull = measure
            .hull
            .iter()
            .map(|p| {
                let dx = p.x - measure.centroid.x;
                let dy = p.y - measure.centroid.y;
                let u = dx * cos + dy * sin;
                let v = -dx * sin + dy * cos;
                Point::new(u / half_w, v / half_h)
            })
            .collect();
        return FootprintTemplate {
            shape: ShapeClass::Hull,
            ref_width: measure.width,
            ref_height: measure.height,
            hull,
            stroke,
            fill,
        };
    }

    FootprintTemplate {
        shape: ShapeClass::Rectangle,
        ref_width: measure.width,
        ref_height: measure.height,
        hull: Vec::new(),
        stroke,
        fill,
    }
}

fn emit(
    template: &FootprintTemplate,
    measure: &RunMeasure,
    stroke: StrokeStyle,
    fill: Option<Color>,
) -> Command {
    let cos = libm::cosf(measure.angle);
    let sin = libm::sinf(measure.angle);
    let half_w = measure.width * 0.5;
    let half_h = measure.height * 0.5;
    let place = |u: f32, v: f32| -> Point {
        let x = u * cos - v * sin;
        let y = u * sin + v * cos;
        Point::new(measure.centroid.x + x, measure.centroid.y + y)
    };

    match template.shape {
        ShapeClass::Circle => Command::Circle {
            center: measure.centroid,
            radius: measure.width.max(measure.height) * 0.5,
            stroke,
            fill,
        },
        ShapeClass::Rectangle => Command::Polygon {
            points: vec![
                place(-half_w, -half_h),
                place(half_w, -half_h),
                place(half_w, half_h),
                place(-half_w, half_h),
            ],
            stroke,
            fill,
        },
        ShapeClass::Hull => Command::Polygon {
            points: template
                .hull
                .iter()
                .map(|p| place(p.x * half_w, p.y * half_h))
                .collect(),
            stroke,
            fill,
        },
    }
}
