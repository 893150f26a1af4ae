//! Turns free-form model output into elements and suggestions.
//!
//! Models wrap their JSON in prose or code fences, so the object is taken
//! from the first `{` to the last `}`. Anything unparseable becomes a plain
//! description with a fixed confidence.

use std::collections::HashMap;

use serde_json::Value;

use crate::perception::types::{ActionSuggestion, ActionType, Element, ElementType, Rect};

pub const TEXT_ONLY_CONFIDENCE: f32 = 0.6;
const DEFAULT_CONFIDENCE: f32 = 0.8;
const DEFAULT_SIZE: u32 = 50;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub description: String,
    pub elements: Vec<Element>,
    pub suggestions: Vec<ActionSuggestion>,
    pub confidence: f32,
    pub scene: String,
    pub structured: bool,
}

pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

pub fn parse_response(text: &str) -> ParsedResponse {
    extract_json(text)
        .and_then(|json| serde_json::from_str::<Value>(json).ok())
        .filter(Value::is_object)
        .map(|data| from_json(&data))
        .unwrap_or_else(|| ParsedResponse {
            description: text.trim().to_string(),
            elements: Vec::new(),
            suggestions: Vec::new(),
            confidence: TEXT_ONLY_CONFIDENCE,
            scene: "unknown".to_string(),
            structured: false,
        })
}

fn num(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(Value::as_f64)
}

/// `[a, b]` or `{k1: a, k2: b}` or two sibling keys.
fn pair(v: &Value, field: &str, k1: &str, k2: &str) -> Option<(f64, f64)> {
    match v.get(field) {
        Some(Value::Array(items)) if items.len() >= 2 => Some((items[0].as_f64()?, items[1].as_f64()?)),
        Some(obj @ Value::Object(_)) => Some((num(obj, k1)?, num(obj, k2)?)),
        _ => Some((num(v, k1)?, num(v, k2)?)),
    }
}

fn confidence(v: &Value, default: f32) -> f32 {
    num(v, "confidence").map(|c| c as f32).unwrap_or(default)
}

fn parse_element(v: &Value) -> Element {
    let (x, y) = pair(v, "position", "x", "y").unwrap_or((0.0, 0.0));
    let (w, h) = pair(v, "size", "width", "height")
        .unwrap_or((DEFAULT_SIZE as f64, DEFAULT_SIZE as f64));
    let name = v.get("name").and_then(Value::as_str).unwrap_or("unknown");
    let element_type = v
        .get("type")
        .and_then(Value::as_str)
        .map(ElementType::parse)
        .unwrap_or(ElementType::Unknown);
    Element::new(
        name,
        Rect::new(x as i32, y as i32, w.max(1.0) as u32, h.max(1.0) as u32),
        confidence(v, DEFAULT_CONFIDENCE),
        element_type,
    )
}

pub fn screen_center_element() -> Element {
    Element::new("screen_center", Rect::new(400, 600, 50, 50), 0.5, ElementType::Unknown)
}

fn parse_suggestion(v: &Value, elements: &[Element]) -> Option<ActionSuggestion> {
    let action = v.get("action").and_then(Value::as_str).unwrap_or("tap");
    let Some(action_type) = ActionType::parse(action) else {
        tracing::debug!(action, "skipping suggestion with unknown action");
        return None;
    };
    let by_name = v
        .get("target")
        .and_then(Value::as_str)
        .and_then(|name| elements.iter().find(|e| e.name == name));
    let target = by_name
        .or_else(|| elements.first())
        .cloned()
        .unwrap_or_else(screen_center_element);

    let parameters: HashMap<String, Value> = v
        .get("parameters")
        .and_then(Value::as_object)
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    Some(ActionSuggestion {
        action_type,
        target: Some(target),
        parameters,
        priority: v.get("priority").and_then(Value::as_u64).unwrap_or(1) as u32,
        description: v
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        confidence: confidence(v, DEFAULT_CONFIDENCE),
    })
}

fn from_json(data: &Value) -> ParsedResponse {
    let elements: Vec<Element> = data
        .get("elements")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter(|v| v.is_object()).map(parse_element).collect())
        .unwrap_or_default();

    let mut suggestions: Vec<ActionSuggestion> = data
        .get("suggestions")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| parse_suggestion(v, &elements))
                .collect()
        })
        .unwrap_or_default();

    // Compact prompt format: a single `priority_action` string.
    if suggestions.is_empty() {
        if let Some(text) = data.get("priority_action").and_then(Value::as_str) {
            suggestions.push(ActionSuggestion {
                action_type: ActionType::Tap,
                target: Some(elements.first().cloned().unwrap_or_else(screen_center_element)),
                parameters: HashMap::new(),
                priority: 1,
                description: text.to_string(),
                confidence: DEFAULT_CONFIDENCE,
            });
        }
    }

    let scene = data
        .get("current_scene")
        .or_else(|| data.get("scene"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    ParsedResponse {
        description: data
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        elements,
        suggestions,
        confidence: confidence(data, DEFAULT_CONFIDENCE),
        scene,
        structured: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_inside_prose_is_extracted() {
        let text = r#"Here is my analysis:
```json
{"current_scene": "world_map", "description": "map view",
 "elements": [{"name": "empty_land", "type": "icon", "x": 100, "y": 200, "width": 80, "height": 60, "confidence": 0.9}],
 "suggestions": [{"action": "click", "target": "empty_land", "priority": 3, "description": "occupy"}]}
```
Good luck!"#;
        let parsed = parse_response(text);
        assert!(parsed.structured);
        assert_eq!(parsed.scene, "world_map");
        assert_eq!(parsed.elements.len(), 1);
        assert_eq!(parsed.elements[0].rect, Rect::new(100, 200, 80, 60));
        assert_eq!(parsed.elements[0].element_type, ElementType::Icon);
        let s = &parsed.suggestions[0];
        assert_eq!(s.action_type, ActionType::Tap);
        assert_eq!(s.target.as_ref().unwrap().name, "empty_land");
        assert_eq!(s.priority, 3);
        assert_eq!(s.confidence, 0.8);
    }

    #[test]
    fn missing_fields_use_defaults() {
        let parsed = parse_response(r#"{"elements": [{"position": [10, 20]}], "suggestions": [{}]}"#);
        let el = &parsed.elements[0];
        assert_eq!(el.name, "unknown");
        assert_eq!(el.rect, Rect::new(10, 20, 50, 50));
        assert_eq!(el.confidence, 0.8);
        assert_eq!(parsed.confidence, 0.8);
        assert_eq!(parsed.scene, "unknown");
        // unnamed target falls back to the first element
        assert_eq!(parsed.suggestions[0].target.as_ref().unwrap().name, "unknown");
    }

    #[test]
    fn suggestion_without_elements_targets_screen_center() {
        let parsed = parse_response(r#"{"suggestions": [{"action": "swipe", "target": "nowhere"}]}"#);
        let target = parsed.suggestions[0].target.as_ref().unwrap();
        assert_eq!(target.name, "screen_center");
        assert_eq!(target.rect, Rect::new(400, 600, 50, 50));
        assert_eq!(target.confidence, 0.5);
    }

    #[test]
    fn non_json_becomes_description() {
        let parsed = parse_response("The player is on the city screen.");
        assert!(!parsed.structured);
        assert_eq!(parsed.description, "The player is on the city screen.");
        assert_eq!(parsed.confidence, TEXT_ONLY_CONFIDENCE);
        assert!(parsed.elements.is_empty());

        let broken = parse_response("{ not json }");
        assert_eq!(broken.confidence, TEXT_ONLY_CONFIDENCE);
    }

    #[test]
    fn compact_format_uses_scene_and_priority_action() {
        let parsed = parse_response(
            r#"{"scene": "battle", "elements": [{"name": "skip", "x": 1, "y": 2}], "priority_action": "tap skip"}"#,
        );
        assert_eq!(parsed.scene, "battle");
        assert_eq!(parsed.suggestions[0].description, "tap skip");
        assert_eq!(parsed.suggestions[0].target.as_ref().unwrap().name, "skip");
    }
}
