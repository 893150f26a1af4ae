//! Keyword templates: scene layouts described in JSON and matched against
//! the free-text description a vision model returns.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::BotResult;
use crate::perception::types::{
    ActionSuggestion, ActionType, AnalysisResult, AnalysisSource, Element, ElementType, Rect,
    ScreenType,
};

pub const DEFAULT_KEYWORD_THRESHOLD: f32 = 0.6;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionHints {
    #[serde(default)]
    pub left_side: bool,
    #[serde(default)]
    pub right_side: bool,
    #[serde(default)]
    pub top_area: bool,
    #[serde(default)]
    pub bottom_area: bool,
    #[serde(default)]
    pub top_left: bool,
    #[serde(default)]
    pub top_right: bool,
    #[serde(default)]
    pub bottom_left: bool,
    #[serde(default)]
    pub bottom_right: bool,
}

impl PositionHints {
    fn locate(&self, (w, h): (u32, u32)) -> (i32, i32) {
        let (w, h) = (w as i32, h as i32);
        let margin = 50;
        if self.top_left {
            return (margin, margin);
        }
        if self.top_right {
            return (w - margin, margin);
        }
        if self.bottom_left {
            return (margin, h - margin);
        }
        if self.bottom_right {
            return (w - margin, h - margin);
        }
        let x = if self.left_side {
            w / 4
        } else if self.right_side {
            w * 3 / 4
        } else {
            w / 2
        };
        let y = if self.top_area {
            h / 4
        } else if self.bottom_area {
            h * 3 / 4
        } else {
            h / 2
        };
        (x, y)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordElement {
    pub name: String,
    #[serde(rename = "type", default)]
    pub element_type: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub position_hints: PositionHints,
    #[serde(default = "default_element_confidence")]
    pub confidence_threshold: f32,
}

fn default_element_confidence() -> f32 {
    0.7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordAction {
    #[serde(default = "default_action")]
    pub action_type: String,
    #[serde(default)]
    pub target_element: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
}

fn default_action() -> String {
    "tap".to_string()
}

fn default_priority() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordTemplate {
    pub name: String,
    #[serde(default)]
    pub elements: Vec<KeywordElement>,
    #[serde(default)]
    pub actions: Vec<KeywordAction>,
}

impl KeywordTemplate {
    /// Mean per-element score: keyword hit fraction weighted 0.8 plus 0.2
    /// when the element type itself is mentioned.
    pub fn score(&self, text: &str) -> f32 {
        if self.elements.is_empty() {
            return 0.0;
        }
        let total: f32 = self
            .elements
            .iter()
            .map(|el| {
                let mut s = 0.0;
                if !el.keywords.is_empty() {
                    let hits = el
                        .keywords
                        .iter()
                        .filter(|k| text.contains(&k.to_lowercase()))
                        .count();
                    s += hits as f32 / el.keywords.len() as f32 * 0.8;
                }
                if !el.element_type.is_empty() && text.contains(&el.element_type.to_lowercase()) {
                    s += 0.2;
                }
                s
            })
            .sum();
        (total / self.elements.len() as f32).min(1.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct KeywordMatcher {
    templates: Vec<KeywordTemplate>,
}

impl KeywordMatcher {
    pub fn new(templates: Vec<KeywordTemplate>) -> Self {
        Self { templates }
    }

    /// Loads one JSON file holding a template or an array of templates, or
    /// every `*.json` file in a directory.
    pub fn load(path: &Path) -> BotResult<Self> {
        let mut templates = Vec::new();
        if path.is_dir() {
            for entry in std::fs::read_dir(path)? {
                let file = entry?.path();
                if file.extension().and_then(|e| e.to_str()) == Some("json") {
                    templates.extend(Self::read_file(&file)?);
                }
            }
        } else if path.exists() {
            templates = Self::read_file(path)?;
        } else {
            tracing::warn!(path = %path.display(), "keyword template path not found");
        }
        tracing::info!(count = templates.len(), "keyword templates loaded");
        Ok(Self { templates })
    }

    fn read_file(path: &Path) -> BotResult<Vec<KeywordTemplate>> {
        let content = std::fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&content)?;
        if value.is_array() {
            Ok(serde_json::from_value(value)?)
        } else {
            Ok(vec![serde_json::from_value(value)?])
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.templates.iter().map(|t| t.name.as_str()).collect()
    }

    /// Applies the best-scoring template, or the screen-center fallback.
    pub fn match_text(
        &self,
        description: &str,
        scene: &str,
        screen_size: (u32, u32),
        threshold: f32,
    ) -> AnalysisResult {
        let text = format!("{} {}", description, scene).to_lowercase();
        let best = self
            .templates
            .iter()
            .map(|t| (t, t.score(&text)))
            .max_by(|a, b| a.1.total_cmp(&b.1));

        match best {
            Some((template, score)) if score >= threshold => {
                tracing::info!(template = %template.name, score, "keyword template applied");
                self.apply(template, score, &text, description, scene, screen_size)
            }
            _ => Self::fallback(description, scene, screen_size),
        }
    }

    fn apply(
        &self,
        template: &KeywordTemplate,
        score: f32,
        text: &str,
        description: &str,
        scene: &str,
        screen_size: (u32, u32),
    ) -> AnalysisResult {
        let elements: Vec<Element> = template
            .elements
            .iter()
            .filter(|el| el.keywords.is_empty() || el.keywords.iter().any(|k| text.contains(&k.to_lowercase())))
            .map(|el| {
                let (cx, cy) = el.position_hints.locate(screen_size);
                Element::new(
                    el.name.clone(),
                    Rect::new(cx - 50, cy - 25, 100, 50),
                    el.confidence_threshold,
                    ElementType::parse(&el.element_type),
                )
            })
            .collect();

        let mut suggestions: Vec<ActionSuggestion> = template
            .actions
            .iter()
            .filter_map(|action| {
                let target = match &action.target_element {
                    Some(name) => Some(elements.iter().find(|e| &e.name == name)?.clone()),
                    None => None,
                };
                Some(ActionSuggestion {
                    action_type: ActionType::parse(&action.action_type).unwrap_or(ActionType::Tap),
                    target,
                    parameters: HashMap::new(),
                    priority: action.priority,
                    description: action.description.clone(),
                    confidence: 0.8,
                })
            })
            .collect();
        suggestions.sort_by(|a, b| b.priority.cmp(&a.priority));

        AnalysisResult {
            screen_type: ScreenType::parse(scene),
            elements,
            suggestions,
            confidence: score,
            source: AnalysisSource::Vlm,
            description: description.to_string(),
            raw: serde_json::json!({ "template_used": template.name, "scene": scene }),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn fallback(description: &str, scene: &str, (w, h): (u32, u32)) -> AnalysisResult {
        let center = Element::new(
            "screen_center",
            Rect::new(w as i32 / 2 - 50, h as i32 / 2 - 25, 100, 50),
            0.3,
            ElementType::Unknown,
        );
        AnalysisResult {
            screen_type: ScreenType::parse(scene),
            suggestions: vec![ActionSuggestion {
                action_type: ActionType::Tap,
                target: Some(center.clone()),
                parameters: HashMap::new(),
                priority: 1,
                description: "tap the screen center".to_string(),
                confidence: 0.3,
            }],
            elements: vec![center],
            confidence: 0.3,
            source: AnalysisSource::Fallback,
            description: description.to_string(),
            raw: serde_json::json!({ "template_used": "fallback", "scene": scene }),
            timestamp: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn battle_template() -> KeywordTemplate {
        serde_json::from_value(serde_json::json!({
            "name": "battle_report",
            "elements": [
                {
                    "name": "skip_button",
                    "type": "button",
                    "keywords": ["skip", "battle"],
                    "position_hints": { "bottom_right": true }
                },
                {
                    "name": "report_panel",
                    "type": "dialog",
                    "keywords": ["report", "victory"]
                }
            ],
            "actions": [
                { "action_type": "tap", "target_element": "skip_button", "description": "skip", "priority": 3 },
                { "action_type": "tap", "target_element": "missing", "description": "never", "priority": 9 }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn score_weights_keywords_and_type() {
        let t = battle_template();
        // skip_button: 2/2 * 0.8 + 0.2 ("button" mentioned); report_panel: 1/2 * 0.8
        let s = t.score("battle skip button, report");
        assert!((s - (1.0 + 0.4) / 2.0).abs() < 1e-6, "score was {s}");
        assert_eq!(t.score("nothing relevant"), 0.0);
    }

    #[test]
    fn best_template_builds_elements_and_actions() {
        let matcher = KeywordMatcher::new(vec![battle_template()]);
        let result = matcher.match_text(
            "Battle victory report with a skip button",
            "battle",
            (1000, 800),
            DEFAULT_KEYWORD_THRESHOLD,
        );
        assert_eq!(result.screen_type, ScreenType::Battle);
        assert_eq!(result.elements.len(), 2);
        let skip = result.element_by_name("skip_button").unwrap();
        assert_eq!(skip.center(), crate::perception::types::Point::new(950, 750));
        assert_eq!(result.suggestions.len(), 1);
        assert_eq!(result.suggestions[0].description, "skip");
    }

    #[test]
    fn low_score_falls_back_to_center() {
        let matcher = KeywordMatcher::new(vec![battle_template()]);
        let result = matcher.match_text("a quiet city street", "city", (800, 600), 0.6);
        assert_eq!(result.source, AnalysisSource::Fallback);
        assert_eq!(result.confidence, 0.3);
        assert_eq!(result.elements[0].name, "screen_center");
        assert_eq!(result.elements[0].center(), crate::perception::types::Point::new(400, 300));
    }

    #[test]
    fn load_accepts_array_files() {
        let dir = tempfile::tempdir().unwrap();
        let body = serde_json::to_string(&vec![battle_template(), battle_template()]).unwrap();
        std::fs::write(dir.path().join("templates.json"), body).unwrap();
        let matcher = KeywordMatcher::load(dir.path()).unwrap();
        assert_eq!(matcher.names(), vec!["battle_report", "battle_report"]);
    }
}
