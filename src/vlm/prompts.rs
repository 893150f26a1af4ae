use std::collections::HashMap;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptCategory {
    GameAnalysis,
    UiElements,
    ActionSuggestion,
    EfficientAnalysis,
}

impl PromptCategory {
    pub const ALL: [PromptCategory; 4] = [
        PromptCategory::GameAnalysis,
        PromptCategory::UiElements,
        PromptCategory::ActionSuggestion,
        PromptCategory::EfficientAnalysis,
    ];

    pub fn builtin(&self) -> &'static str {
        match self {
            PromptCategory::GameAnalysis => GAME_ANALYSIS_PROMPT,
            PromptCategory::UiElements => UI_ELEMENTS_PROMPT,
            PromptCategory::ActionSuggestion => ACTION_SUGGESTION_PROMPT,
            PromptCategory::EfficientAnalysis => EFFICIENT_ANALYSIS_PROMPT,
        }
    }
}

pub const GAME_ANALYSIS_PROMPT: &str = r#"You are an assistant for the mobile strategy game "Three Kingdoms: Strategy". Analyse this iPad screenshot.

Report:
1. the current screen (main_menu, world_map, battle_ui, city_view or unknown)
2. the visible UI elements and buttons with pixel positions
3. the recommended next actions, highest priority first

Answer with JSON only, in this shape:
{
  "current_scene": "world_map",
  "description": "short summary of the screen",
  "confidence": 0.9,
  "elements": [
    {"name": "empty_land", "type": "button|icon|text|image|menu|dialog", "x": 100, "y": 200, "width": 80, "height": 60, "confidence": 0.9}
  ],
  "suggestions": [
    {"action": "tap|swipe|long_press|wait|home|back", "target": "empty_land", "priority": 3, "description": "why", "confidence": 0.8}
  ]
}"#;

pub const UI_ELEMENTS_PROMPT: &str = "List every UI element in this game screenshot: buttons, icons and text labels. \
Focus on interactive elements and give accurate pixel positions and types. \
Answer with JSON: {\"elements\": [{\"name\", \"type\", \"x\", \"y\", \"width\", \"height\", \"confidence\"}]}.";

pub const ACTION_SUGGESTION_PROMPT: &str = "Based on the current game state in this screenshot, suggest the best next actions. \
Rank them by priority and name the element each one targets. \
Answer with JSON: {\"suggestions\": [{\"action\", \"target\", \"priority\", \"description\", \"confidence\"}]}.";

pub const EFFICIENT_ANALYSIS_PROMPT: &str = "As a Three Kingdoms strategy expert, quickly analyse the screenshot: \
identify the screen type, locate the main clickable elements and give the single best action. \
Be concise and give precise coordinates. \
JSON: {\"scene\": \"screen_type\", \"elements\": [{\"name\": \"element\", \"x\": 0, \"y\": 0}], \"priority_action\": \"best action\"}";

/// Prompt asking the model to improve the analysis prompt from recent
/// outcomes.
pub fn optimization_prompt(current: &str, history_summary: &str, feedback: Option<&str>) -> String {
    format!(
        "You tune prompts for a game screenshot analyser.\n\n\
         Current prompt:\n{current}\n\n\
         Recent analysis history:\n{history_summary}\n\n\
         User feedback:\n{}\n\n\
         Write an improved prompt that yields more accurate scene detection and element \
         coordinates. Keep the same JSON answer format. Reply with the prompt text only.",
        feedback.unwrap_or("none")
    )
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PromptStats {
    pub uses: u64,
    pub success_rate: f64,
    /// Seconds.
    pub avg_response_time: f64,
}

impl PromptStats {
    fn record(&mut self, success: bool, response_time: f64) {
        self.uses += 1;
        let n = self.uses as f64;
        self.success_rate = (self.success_rate * (n - 1.0) + if success { 1.0 } else { 0.0 }) / n;
        self.avg_response_time = (self.avg_response_time * (n - 1.0) + response_time) / n;
    }

    /// Low success or slow answers mark a prompt for optimisation.
    pub fn needs_optimization(&self) -> bool {
        self.uses >= 5 && (self.success_rate < 0.7 || self.avg_response_time > 10.0)
    }
}

/// Active prompts per category with usage statistics. An optimised prompt
/// replaces the built-in one until [`PromptBook::reset`].
#[derive(Debug, Clone, Default)]
pub struct PromptBook {
    overrides: HashMap<PromptCategory, String>,
    stats: HashMap<PromptCategory, PromptStats>,
}

impl PromptBook {
    pub fn get(&self, category: PromptCategory) -> &str {
        self.overrides
            .get(&category)
            .map(String::as_str)
            .unwrap_or_else(|| category.builtin())
    }

    pub fn set(&mut self, category: PromptCategory, prompt: impl Into<String>) {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            tracing::warn!(?category, "ignoring empty prompt");
            return;
        }
        self.overrides.insert(category, prompt);
        self.stats.remove(&category);
    }

    pub fn reset(&mut self, category: PromptCategory) {
        self.overrides.remove(&category);
    }

    pub fn record(&mut self, category: PromptCategory, success: bool, response_time: f64) {
        let stats = self.stats.entry(category).or_default();
        stats.record(success, response_time);
        if stats.needs_optimization() {
            tracing::info!(
                ?category,
                success_rate = stats.success_rate,
                avg_response_time = stats.avg_response_time,
                "prompt is underperforming"
            );
        }
    }

    pub fn stats(&self, category: PromptCategory) -> PromptStats {
        self.stats.get(&category).cloned().unwrap_or_default()
    }

    pub fn all_stats(&self) -> HashMap<PromptCategory, PromptStats> {
        PromptCategory::ALL
            .iter()
            .map(|c| (*c, self.stats(*c)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_replaces_builtin_until_reset() {
        let mut book = PromptBook::default();
        assert_eq!(book.get(PromptCategory::GameAnalysis), GAME_ANALYSIS_PROMPT);
        book.set(PromptCategory::GameAnalysis, "find the army");
        assert_eq!(book.get(PromptCategory::GameAnalysis), "find the army");
        book.set(PromptCategory::GameAnalysis, "   ");
        assert_eq!(book.get(PromptCategory::GameAnalysis), "find the army");
        book.reset(PromptCategory::GameAnalysis);
        assert_eq!(book.get(PromptCategory::GameAnalysis), GAME_ANALYSIS_PROMPT);
    }

    #[test]
    fn stats_are_running_means() {
        let mut book = PromptBook::default();
        for (ok, t) in [(true, 2.0), (false, 4.0), (true, 6.0), (false, 8.0)] {
            book.record(PromptCategory::UiElements, ok, t);
        }
        let s = book.stats(PromptCategory::UiElements);
        assert_eq!(s.uses, 4);
        assert!((s.success_rate - 0.5).abs() < 1e-9);
        assert!((s.avg_response_time - 5.0).abs() < 1e-9);
        assert!(!s.needs_optimization());
        book.record(PromptCategory::UiElements, false, 1.0);
        assert!(book.stats(PromptCategory::UiElements).needs_optimization());
    }

    #[test]
    fn optimization_prompt_embeds_inputs() {
        let p = optimization_prompt("old prompt", "5 runs, 2 failed", None);
        assert!(p.contains("old prompt"));
        assert!(p.contains("5 runs, 2 failed"));
        assert!(p.contains("none"));
    }
}
