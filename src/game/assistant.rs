use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::analysis::{AnalysisManager, AnalysisRequest, AnalysisStats};
use crate::errors::{BotError, BotResult};
use crate::executor::{AutomationService, AutomationStats};
use crate::game::controller::{ControllerStats, GameController};
use crate::perception::keyword::KeywordMatcher;
use crate::perception::traits::ScreenParser;
use crate::perception::types::{
    Action, ActionSuggestion, ActionType, AnalysisResult, Element, Point, Screenshot,
};
use crate::vlm::screen_parser::vlm_to_analysis;

const DEFAULT_SWIPE_OFFSET: i32 = 100;
const DEFAULT_LONG_PRESS_SECS: f64 = 1.0;

#[derive(Debug, Clone, Default)]
struct Counters {
    analyses: u64,
    vlm_analyses: u64,
    template_analyses: u64,
    vlm_fallbacks: u64,
    suggestions_executed: u64,
    last_analysis: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistantStats {
    pub analyses: u64,
    pub vlm_analyses: u64,
    pub template_analyses: u64,
    pub vlm_fallbacks: u64,
    pub suggestions_executed: u64,
    pub last_analysis: Option<DateTime<Utc>>,
    pub controller: ControllerStats,
    pub automation: AutomationStats,
    pub analysis: Option<AnalysisStats>,
}

/// Screen understanding and suggestion execution. Uses the VLM when one
/// is configured and reachable, template matching otherwise.
pub struct GameAssistant {
    controller: Arc<GameController>,
    automation: Arc<AutomationService>,
    manager: Option<AnalysisManager>,
    keywords: Option<Arc<KeywordMatcher>>,
    result_timeout: Duration,
    counters: Mutex<Counters>,
}

impl GameAssistant {
    pub fn new(
        controller: Arc<GameController>,
        automation: Arc<AutomationService>,
        manager: Option<AnalysisManager>,
        result_timeout: Duration,
    ) -> Self {
        Self {
            controller,
            automation,
            manager,
            keywords: None,
            result_timeout,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn with_keywords(mut self, keywords: Arc<KeywordMatcher>) -> Self {
        self.keywords = Some(keywords);
        self
    }

    pub fn controller(&self) -> &Arc<GameController> {
        &self.controller
    }

    pub fn automation(&self) -> &Arc<AutomationService> {
        &self.automation
    }

    pub fn manager(&self) -> Option<&AnalysisManager> {
        self.manager.as_ref()
    }

    /// Probes the model and starts background analysis processing.
    pub async fn start(&self) -> bool {
        match &self.manager {
            Some(manager) => manager.start().await,
            None => false,
        }
    }

    pub async fn stop(&self) -> BotResult<()> {
        if let Some(manager) = &self.manager {
            manager.stop();
        }
        self.controller.device().disconnect().await
    }

    async fn analyze_with_vlm(&self, manager: &AnalysisManager, shot: &Screenshot) -> BotResult<AnalysisResult> {
        let request = AnalysisRequest::new(shot.clone()).with_priority(1);
        let vlm = manager.analyze(request, self.result_timeout).await?;
        if !vlm.success {
            return Err(BotError::Vlm(
                vlm.error.clone().unwrap_or_else(|| "analysis failed".into()),
            ));
        }
        Ok(vlm_to_analysis(
            &vlm,
            self.keywords.as_deref(),
            (shot.width(), shot.height()),
        ))
    }

    pub async fn analyze_current_screen(&self) -> BotResult<AnalysisResult> {
        let shot = self.controller.screenshot(true).await?;

        let vlm = self
            .manager
            .as_ref()
            .filter(|m| m.is_running() && m.model().is_available());
        if let Some(manager) = vlm {
            match self.analyze_with_vlm(manager, &shot).await {
                Ok(result) => {
                    self.count(|c| c.vlm_analyses += 1).await;
                    return Ok(result);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "VLM analysis failed; using templates");
                    self.counters.lock().await.vlm_fallbacks += 1;
                }
            }
        }

        let result = self.controller.analyzer().parse(&shot).await?;
        self.count(|c| c.template_analyses += 1).await;
        Ok(result)
    }

    async fn count(&self, f: impl FnOnce(&mut Counters)) {
        let mut c = self.counters.lock().await;
        f(&mut c);
        c.analyses += 1;
        c.last_analysis = Some(Utc::now());
    }

    /// Template lookup first, then the elements of a full analysis.
    pub async fn find_game_element(&self, name: &str) -> BotResult<Option<Element>> {
        match self.controller.find(name).await {
            Ok(Some(el)) => return Ok(Some(el)),
            Ok(None) | Err(BotError::TemplateNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let analysis = self.analyze_current_screen().await?;
        Ok(analysis.element_by_name(name).cloned())
    }

    /// Suggestions for the current screen, best first.
    pub async fn game_suggestions(&self) -> BotResult<Vec<ActionSuggestion>> {
        let analysis = self.analyze_current_screen().await?;
        Ok(analysis.ranked_suggestions().into_iter().cloned().collect())
    }

    pub async fn execute_suggestion(&self, suggestion: &ActionSuggestion) -> BotResult<bool> {
        let action = suggestion_action(suggestion)?;
        let result = self.automation.execute_action(&action).await;
        if result.success {
            self.counters.lock().await.suggestions_executed += 1;
            tracing::info!(description = %suggestion.description, "suggestion executed");
        }
        Ok(result.success)
    }

    pub async fn optimize_prompts(&self, feedback: Option<&str>) -> BotResult<String> {
        match &self.manager {
            Some(manager) => manager.optimize_prompt(feedback).await,
            None => Err(BotError::VlmUnavailable("VLM analysis is disabled".into())),
        }
    }

    pub async fn statistics(&self) -> AssistantStats {
        let c = self.counters.lock().await.clone();
        let analysis = match &self.manager {
            Some(m) => Some(m.stats().await),
            None => None,
        };
        AssistantStats {
            analyses: c.analyses,
            vlm_analyses: c.vlm_analyses,
            template_analyses: c.template_analyses,
            vlm_fallbacks: c.vlm_fallbacks,
            suggestions_executed: c.suggestions_executed,
            last_analysis: c.last_analysis,
            controller: self.controller.statistics().await,
            automation: self.automation.stats().await,
            analysis,
        }
    }
}

fn int_param(suggestion: &ActionSuggestion, key: &str) -> Option<i32> {
    suggestion.parameters.get(key)?.as_i64().map(|v| v as i32)
}

/// Translates a suggestion into an executable action on its target.
pub fn suggestion_action(suggestion: &ActionSuggestion) -> BotResult<Action> {
    let target = suggestion
        .target
        .clone()
        .ok_or_else(|| BotError::Validation("suggestion has no target element".into()))?;
    let c = target.center();
    let action = match suggestion.action_type {
        ActionType::Tap => Action::new(ActionType::Tap).on(target),
        ActionType::Swipe => {
            let end = Point::new(
                int_param(suggestion, "end_x").unwrap_or(c.x + DEFAULT_SWIPE_OFFSET),
                int_param(suggestion, "end_y").unwrap_or(c.y),
            );
            Action::swipe(c, end, suggestion_duration(suggestion, 1.0)).on(target)
        }
        ActionType::LongPress => Action::new(ActionType::LongPress)
            .on(target)
            .with_param(
                "duration",
                serde_json::json!(suggestion_duration(suggestion, DEFAULT_LONG_PRESS_SECS)),
            ),
        other => {
            return Err(BotError::Action(format!("{other:?} suggestions are not executable")));
        }
    };
    Ok(action.described(suggestion.description.clone()))
}

fn suggestion_duration(suggestion: &ActionSuggestion, default: f64) -> f64 {
    suggestion
        .parameters
        .get("duration")
        .and_then(|v| v.as_f64())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ManagerSettings;
    use crate::device::mock::{Gesture, MockHandles};
    use crate::executor::FixedApprover;
    use crate::game::controller::tests::{controller_for, Scene};
    use crate::perception::types::{ElementType, ExecutionMode, Rect, ScreenType};
    use crate::vlm::screen_parser::tests::{ok_result, ScriptedModel};
    use std::collections::HashMap;

    fn manager(model: ScriptedModel) -> AnalysisManager {
        AnalysisManager::new(
            Arc::new(model),
            ManagerSettings {
                max_concurrent: 1,
                history_limit: 10,
                result_limit: 10,
                auto_interval: Duration::from_millis(50),
                capture_retry: Duration::from_millis(50),
                debug_dir: None,
                session_dir: None,
            },
        )
    }

    async fn assistant(manager: Option<AnalysisManager>) -> (GameAssistant, MockHandles) {
        let scene = Scene::new(40, &[("city", (0, 0, 20, 12)), ("confirm_button", (100, 90, 18, 10))]);
        let (screen, matcher) = scene.matcher();
        let (controller, handles) = controller_for(matcher, false).await;
        handles.push_gray(screen);
        let controller = Arc::new(controller);
        let automation = Arc::new(AutomationService::new(
            controller.device().clone(),
            ExecutionMode::Auto,
            Arc::new(FixedApprover(true)),
        ));
        let assistant = GameAssistant::new(controller, automation, manager, Duration::from_secs(2));
        if let Some(m) = assistant.manager() {
            m.start().await;
        }
        (assistant, handles)
    }

    fn suggestion(action_type: ActionType, parameters: HashMap<String, serde_json::Value>) -> ActionSuggestion {
        ActionSuggestion {
            action_type,
            target: Some(Element::new("gate", Rect::new(100, 100, 40, 40), 0.9, ElementType::Button)),
            parameters,
            priority: 3,
            description: "enter the city".into(),
            confidence: 0.8,
        }
    }

    #[test]
    fn swipe_suggestion_defaults_end_to_the_right() {
        let action = suggestion_action(&suggestion(ActionType::Swipe, HashMap::new())).unwrap();
        assert_eq!(action.target_position(), Some(Point::new(120, 120)));
        assert_eq!(action.param_point("target_position"), Some(Point::new(220, 120)));

        let mut params = HashMap::new();
        params.insert("end_x".to_string(), serde_json::json!(5));
        params.insert("end_y".to_string(), serde_json::json!(6));
        let action = suggestion_action(&suggestion(ActionType::Swipe, params)).unwrap();
        assert_eq!(action.param_point("target_position"), Some(Point::new(5, 6)));
    }

    #[test]
    fn long_press_suggestion_defaults_to_one_second() {
        let action = suggestion_action(&suggestion(ActionType::LongPress, HashMap::new())).unwrap();
        assert_eq!(action.param_f64("duration"), Some(1.0));
        assert_eq!(action.description, "enter the city");
    }

    #[test]
    fn suggestion_without_target_is_rejected() {
        let mut s = suggestion(ActionType::Tap, HashMap::new());
        s.target = None;
        assert!(matches!(suggestion_action(&s), Err(BotError::Validation(_))));
        assert!(suggestion_action(&suggestion(ActionType::Home, HashMap::new())).is_err());
    }

    #[tokio::test]
    async fn templates_used_without_vlm() {
        let (assistant, _) = assistant(None).await;
        let result = assistant.analyze_current_screen().await.unwrap();
        assert_eq!(result.screen_type, ScreenType::City);
        let stats = assistant.statistics().await;
        assert_eq!(stats.template_analyses, 1);
        assert_eq!(stats.vlm_analyses, 0);
        assert!(stats.analysis.is_none());
    }

    #[tokio::test]
    async fn vlm_result_preferred_when_available() {
        let (assistant, _) = assistant(Some(manager(ScriptedModel::new(vec![ok_result("world_map", Vec::new())])))).await;
        let result = assistant.analyze_current_screen().await.unwrap();
        assert_eq!(result.screen_type, ScreenType::WorldMap);
        assert_eq!(assistant.statistics().await.vlm_analyses, 1);
    }

    #[tokio::test]
    async fn vlm_failure_falls_back_to_templates() {
        // The scripted model fails once its queue is empty.
        let (assistant, _) = assistant(Some(manager(ScriptedModel::new(Vec::new())))).await;
        let result = assistant.analyze_current_screen().await.unwrap();
        assert_eq!(result.screen_type, ScreenType::City);
        let stats = assistant.statistics().await;
        assert_eq!(stats.vlm_fallbacks, 1);
        assert_eq!(stats.template_analyses, 1);
    }

    #[tokio::test]
    async fn find_and_execute_suggestion() {
        let (assistant, handles) = assistant(None).await;
        let confirm = assistant.find_game_element("confirm_button").await.unwrap().unwrap();
        assert_eq!(confirm.center(), Point::new(109, 95));
        assert!(assistant.find_game_element("army_idle").await.unwrap().is_none());

        let suggestions = assistant.game_suggestions().await.unwrap();
        assert_eq!(suggestions[0].target.as_ref().unwrap().name, "confirm_button");
        assert!(assistant.execute_suggestion(&suggestions[0]).await.unwrap());
        assert_eq!(handles.gestures(), vec![Gesture::Tap(109, 95)]);
        assert_eq!(assistant.statistics().await.suggestions_executed, 1);
    }

    #[tokio::test]
    async fn absurd_model_duration_is_rejected() {
        let (assistant, handles) = assistant(None).await;
        let confirm = assistant.find_game_element("confirm_button").await.unwrap().unwrap();
        let suggestion = ActionSuggestion {
            action_type: ActionType::LongPress,
            target: Some(confirm),
            parameters: HashMap::from([("duration".to_string(), serde_json::json!(1e20))]),
            priority: 5,
            description: "hold confirm".into(),
            confidence: 0.9,
        };
        assert!(!assistant.execute_suggestion(&suggestion).await.unwrap());
        assert!(handles.gestures().is_empty());
        assert_eq!(assistant.statistics().await.suggestions_executed, 0);
    }

    #[tokio::test]
    async fn optimize_needs_a_model() {
        let (assistant, _) = assistant(None).await;
        assert!(matches!(
            assistant.optimize_prompts(None).await,
            Err(BotError::VlmUnavailable(_))
        ));
    }
}
