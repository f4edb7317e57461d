use crate::command::{CommandBuffer, TextStyle};
use crate::types::{Rect, ViewState};

/// One framed sub-view of the plan: its own buffer and view state, rendered
/// into an explicit frame rectangle on the page.
#[derive(Debug, Clone)]
pub struct PlanViewElement {
    pub buffer: CommandBuffer,
    pub view: ViewState,
    /// Draw a border line around the frame.
    pub framed: bool,
}

#[derive(Debug, Clone)]
pub struct LegendEntry {
    /// Symbol swatch drawn next to the label, when the model has one.
    pub symbol_id: Option<u32>,
    pub label: String,
    pub count: u32,
}

#[derive(Debug, Clone)]
pub struct Legend {
    pub title: String,
    pub entries: Vec<LegendEntry>,
}

/// Production-event header block: show name, venue, date and whatever other
/// fields the layout editor configured, as label/value pairs per row.
#[derive(Debug, Clone)]
pub struct EventTable {
    pub title: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct TextBox {
    pub text: String,
    pub style: TextStyle,
}

#[derive(Debug, Clone)]
pub enum ElementContent {
    PlanView(PlanViewElement),
    Legend(Legend),
    EventTable(EventTable),
    TextBox(TextBox),
}

/// One element of a composed page. Elements are clipped to their frame and
/// painted in ascending `z_index`, insertion order breaking ties.
#[derive(Debug, Clone)]
pub struct PageElement {
    pub frame: Rect,
    pub z_index: i32,
    pub content: ElementContent,
}

impl PageElement {
    pub fn new(frame: Rect, z_index: i32, content: ElementContent) -> Self {
        Self {
            frame,
            z_index,
            content,
        }
    }
}

/// Paint order for a set of elements: ascending z, stable on insertion order.
pub fn paint_order(elements: &[PageElement]) -> Vec<&PageElement> {
    let mut ordered: Vec<&PageElement> = elements.iter().collect();
    ordered.sort_by_key(|element| element.z_index);
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_element(z_index: i32, marker: &str) -> PageElement {
        PageElement::new(
            Rect::new(0.0, 0.0, 100.0, 20.0),
            z_index,
            ElementContent::TextBox(TextBox {
                text: marker.to_string(),
                style: TextStyle::new("Helvetica", 10.0),
            }),
        )
    }

    fn marker(element: &PageElement) -> &str {
        match &element.content {
            ElementContent::TextBox(text_box) => &text_box.text,
            _ => unreachable!(),
        }
    }

    #[test]
    fn paint_order_is_z_then_insertion() {
        let elements = vec![
            text_element(5, "a"),
            text_element(1, "b"),
            text_element(5, "c"),
            text_element(0, "d"),
        ];
        let ordered: Vec<&str> = paint_order(&elements).into_iter().map(marker).collect();
        assert_eq!(ordered, vec!["d", "b", "a", "c"]);
    }
}
