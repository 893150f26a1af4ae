use std::collections::HashMap;

use async_trait::async_trait;
use image::GrayImage;

use crate::errors::{BotError, BotResult};
use crate::perception::template::TemplateMatcher;
use crate::perception::traits::ScreenParser;
use crate::perception::types::{
    ActionSuggestion, ActionType, AnalysisResult, AnalysisSource, Element, ScreenType, Screenshot,
};

/// Screen markers checked in order; the first present one names the screen.
pub const SCREEN_MARKERS: [(&str, ScreenType); 4] = [
    ("main_menu", ScreenType::MainMenu),
    ("world_map", ScreenType::WorldMap),
    ("battle", ScreenType::Battle),
    ("city", ScreenType::City),
];

pub const COMMON_BUTTONS: [&str; 4] = ["confirm_button", "cancel_button", "close_button", "back_button"];

pub const WORLD_MAP_TARGETS: [&str; 3] = ["empty_land", "resource_point", "army_idle"];

/// Template-based screen analysis.
#[derive(Debug, Clone)]
pub struct ScreenAnalyzer {
    matcher: TemplateMatcher,
}

impl ScreenAnalyzer {
    pub fn new(matcher: TemplateMatcher) -> Self {
        Self { matcher }
    }

    pub fn matcher(&self) -> &TemplateMatcher {
        &self.matcher
    }

    pub fn detect_screen(&self, screen: &GrayImage) -> (ScreenType, Option<Element>) {
        for (name, screen_type) in SCREEN_MARKERS {
            if let Some(el) = self.find_optional(screen, name) {
                return (screen_type, Some(el));
            }
        }
        (ScreenType::Unknown, None)
    }

    fn find_optional(&self, screen: &GrayImage, name: &str) -> Option<Element> {
        match self.matcher.find(screen, name) {
            Ok(found) => found,
            Err(BotError::TemplateNotFound(_)) => None,
            Err(e) => {
                tracing::warn!(template = name, error = %e, "marker match failed");
                None
            }
        }
    }

    fn find_all_optional(&self, screen: &GrayImage, name: &str) -> Vec<Element> {
        match self.matcher.find_all(screen, name) {
            Ok(found) => found,
            Err(BotError::TemplateNotFound(_)) => Vec::new(),
            Err(e) => {
                tracing::warn!(template = name, error = %e, "element match failed");
                Vec::new()
            }
        }
    }

    pub fn analyze(&self, screen: &GrayImage) -> AnalysisResult {
        let (screen_type, marker) = self.detect_screen(screen);
        let mut elements: Vec<Element> = marker.iter().cloned().collect();

        if screen_type == ScreenType::WorldMap {
            for name in WORLD_MAP_TARGETS {
                elements.extend(self.find_all_optional(screen, name));
            }
        }
        for name in COMMON_BUTTONS {
            elements.extend(self.find_all_optional(screen, name));
        }

        let confidence = marker
            .as_ref()
            .map(|m| m.confidence)
            .or_else(|| elements.iter().map(|e| e.confidence).max_by(f32::total_cmp))
            .unwrap_or(0.0);
        let suggestions = suggest_from_elements(screen_type, &elements);

        tracing::debug!(
            screen = %screen_type,
            elements = elements.len(),
            suggestions = suggestions.len(),
            "template analysis complete"
        );

        AnalysisResult {
            screen_type,
            description: format!("{} with {} recognised elements", screen_type, elements.len()),
            elements,
            suggestions,
            confidence,
            source: AnalysisSource::Template,
            raw: serde_json::json!({ "screen_type": screen_type.as_str(), "method": "template" }),
            timestamp: chrono::Utc::now(),
        }
    }
}

fn priority_for(name: &str, screen_type: ScreenType) -> Option<(u32, &'static str)> {
    match name {
        "confirm_button" => Some((5, "confirm the open dialog")),
        "resource_point" if screen_type == ScreenType::WorldMap => Some((4, "occupy a resource point")),
        "empty_land" if screen_type == ScreenType::WorldMap => Some((3, "occupy empty land")),
        "army_idle" if screen_type == ScreenType::WorldMap => Some((2, "dispatch an idle army")),
        "close_button" => Some((1, "close the panel")),
        _ => None,
    }
}

/// One tap suggestion per actionable element.
pub fn suggest_from_elements(screen_type: ScreenType, elements: &[Element]) -> Vec<ActionSuggestion> {
    elements
        .iter()
        .filter_map(|el| {
            let (priority, what) = priority_for(&el.name, screen_type)?;
            let c = el.center();
            Some(ActionSuggestion {
                action_type: ActionType::Tap,
                target: Some(el.clone()),
                parameters: HashMap::new(),
                priority,
                description: format!("{what} at ({}, {})", c.x, c.y),
                confidence: el.confidence,
            })
        })
        .collect()
}

#[async_trait]
impl ScreenParser for ScreenAnalyzer {
    fn name(&self) -> &str {
        "template"
    }

    async fn parse(&self, shot: &Screenshot) -> BotResult<AnalysisResult> {
        let analyzer = self.clone();
        let image = shot.image.clone();
        tokio::task::spawn_blocking(move || analyzer.analyze(&image.to_luma8()))
            .await
            .map_err(|e| BotError::Vision(format!("template analysis task failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::ccoeff::tests::noise_image;
    use crate::perception::template::TemplateLibrary;
    use std::sync::Arc;

    fn crop(img: &GrayImage, x: u32, y: u32, w: u32, h: u32) -> GrayImage {
        image::imageops::crop_imm(img, x, y, w, h).to_image()
    }

    fn analyzer_for(screen: &GrayImage, entries: &[(&str, (u32, u32, u32, u32))]) -> ScreenAnalyzer {
        let mut library = TemplateLibrary::new();
        for (name, (x, y, w, h)) in entries {
            library.insert(*name, crop(screen, *x, *y, *w, *h));
        }
        ScreenAnalyzer::new(TemplateMatcher::new(Arc::new(library), 0.8, 0.3, 10))
    }

    #[test]
    fn world_map_collects_targets_and_suggests() {
        let screen = noise_image(160, 120, 21);
        let analyzer = analyzer_for(
            &screen,
            &[
                ("world_map", (0, 0, 20, 12)),
                ("resource_point", (60, 40, 12, 12)),
                ("empty_land", (100, 80, 12, 12)),
                ("confirm_button", (120, 10, 18, 8)),
            ],
        );

        let result = analyzer.analyze(&screen);
        assert_eq!(result.screen_type, ScreenType::WorldMap);
        assert_eq!(result.source, AnalysisSource::Template);
        assert!(result.element_by_name("resource_point").is_some());
        assert!(result.element_by_name("empty_land").is_some());
        assert_eq!(result.raw["method"], "template");
        assert_eq!(result.raw["screen_type"], "world_map");

        let best = result.best_suggestion().unwrap();
        assert_eq!(best.target.as_ref().unwrap().name, "confirm_button");
    }

    #[test]
    fn first_marker_wins() {
        let screen = noise_image(100, 100, 4);
        let analyzer = analyzer_for(
            &screen,
            &[("main_menu", (0, 0, 16, 16)), ("world_map", (50, 50, 16, 16))],
        );
        let (screen_type, marker) = analyzer.detect_screen(&screen);
        assert_eq!(screen_type, ScreenType::MainMenu);
        assert_eq!(marker.unwrap().name, "main_menu");
    }

    #[test]
    fn map_targets_ignored_off_the_map() {
        let screen = noise_image(100, 100, 9);
        let analyzer = analyzer_for(&screen, &[("empty_land", (10, 10, 12, 12))]);
        let result = analyzer.analyze(&screen);
        assert_eq!(result.screen_type, ScreenType::Unknown);
        assert!(result.elements.is_empty());
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn parse_runs_off_the_runtime() {
        let screen = noise_image(64, 64, 2);
        let analyzer = analyzer_for(&screen, &[("city", (8, 8, 16, 16))]);
        let shot = Screenshot::new(image::DynamicImage::ImageLuma8(screen));
        let result = analyzer.parse(&shot).await.unwrap();
        assert_eq!(result.screen_type, ScreenType::City);
    }
}
