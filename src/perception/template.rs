use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::GrayImage;

use crate::errors::{BotError, BotResult};
use crate::perception::ccoeff::{best_match, match_template_ccoeff_normed};
use crate::perception::types::{Element, ElementType, MatchResult, Point, Rect};

#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub image: Arc<GrayImage>,
    pub path: Option<PathBuf>,
}

/// Grayscale reference images keyed by file stem.
#[derive(Debug, Clone, Default)]
pub struct TemplateLibrary {
    templates: HashMap<String, Template>,
}

impl TemplateLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every `*.png` in `dir`. A missing directory gives an empty library.
    pub fn load(dir: &Path) -> BotResult<Self> {
        let mut library = Self::new();
        if !dir.is_dir() {
            tracing::warn!(dir = %dir.display(), "template directory not found; no templates loaded");
            return Ok(library);
        }

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_png = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("png"));
            if !is_png {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match image::open(&path) {
                Ok(img) => {
                    library.templates.insert(
                        name.clone(),
                        Template {
                            name,
                            image: Arc::new(img.to_luma8()),
                            path: Some(path),
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable template");
                }
            }
        }

        tracing::info!(dir = %dir.display(), count = library.len(), "templates loaded");
        Ok(library)
    }

    pub fn insert(&mut self, name: impl Into<String>, image: GrayImage) {
        let name = name.into();
        self.templates.insert(
            name.clone(),
            Template {
                name,
                image: Arc::new(image),
                path: None,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&Template> {
        self.templates.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Guesses an element type from a template name such as `confirm_button`.
pub fn element_type_for(name: &str) -> ElementType {
    let lower = name.to_ascii_lowercase();
    if lower.contains("button") || lower.contains("btn") {
        ElementType::Button
    } else if lower.contains("menu") {
        ElementType::Menu
    } else if lower.contains("dialog") || lower.contains("popup") {
        ElementType::Dialog
    } else if lower.contains("text") || lower.contains("label") {
        ElementType::Text
    } else {
        ElementType::Icon
    }
}

/// Greedy non-maximum suppression: keeps the most confident element of
/// every group whose IoU exceeds `overlap`.
pub fn nms(mut elements: Vec<Element>, overlap: f32) -> Vec<Element> {
    elements.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Element> = Vec::with_capacity(elements.len());
    for candidate in elements {
        if kept.iter().all(|k| k.rect.iou(&candidate.rect) <= overlap) {
            kept.push(candidate);
        }
    }
    kept
}

#[derive(Debug, Clone)]
pub struct TemplateMatcher {
    library: Arc<TemplateLibrary>,
    pub threshold: f32,
    pub nms_threshold: f32,
    pub max_results: usize,
}

impl TemplateMatcher {
    pub fn new(library: Arc<TemplateLibrary>, threshold: f32, nms_threshold: f32, max_results: usize) -> Self {
        Self {
            library,
            threshold,
            nms_threshold,
            max_results,
        }
    }

    pub fn library(&self) -> &TemplateLibrary {
        &self.library
    }

    fn template(&self, name: &str) -> BotResult<&Template> {
        self.library
            .get(name)
            .ok_or_else(|| BotError::TemplateNotFound(name.to_string()))
    }

    fn element(template: &Template, x: u32, y: u32, confidence: f32) -> Element {
        let mut el = Element::new(
            template.name.clone(),
            Rect::new(x as i32, y as i32, template.image.width(), template.image.height()),
            confidence,
            element_type_for(&template.name),
        );
        el.template_path = template.path.as_ref().map(|p| p.display().to_string());
        el
    }

    /// Best placement of the named template if it clears the threshold.
    pub fn find(&self, screen: &GrayImage, name: &str) -> BotResult<Option<Element>> {
        Ok(self.match_one(screen, name)?.element)
    }

    pub fn match_one(&self, screen: &GrayImage, name: &str) -> BotResult<MatchResult> {
        let template = self.template(name)?;
        let best = match_template_ccoeff_normed(screen, &template.image).and_then(|s| best_match(&s));

        let Some((score, (x, y))) = best else {
            return Ok(MatchResult {
                found: false,
                template_name: name.to_string(),
                confidence: 0.0,
                location: None,
                element: None,
            });
        };

        let found = score >= self.threshold;
        let element = found.then(|| Self::element(template, x, y, score));
        tracing::trace!(template = name, score, x, y, found, "template match");
        Ok(MatchResult {
            found,
            template_name: name.to_string(),
            confidence: score,
            location: element.as_ref().map(Element::center),
            element,
        })
    }

    /// Every placement above the threshold, suppressed and capped.
    pub fn find_all(&self, screen: &GrayImage, name: &str) -> BotResult<Vec<Element>> {
        let template = self.template(name)?;
        let Some(scores) = match_template_ccoeff_normed(screen, &template.image) else {
            return Ok(Vec::new());
        };

        let candidates: Vec<Element> = scores
            .enumerate_pixels()
            .filter(|(_, _, p)| p[0] >= self.threshold)
            .map(|(x, y, p)| Self::element(template, x, y, p[0]))
            .collect();

        let mut kept = nms(candidates, self.nms_threshold);
        kept.truncate(self.max_results);
        tracing::debug!(template = name, count = kept.len(), "find_all");
        Ok(kept)
    }

    /// Finds the first present template among `names`, in order.
    pub fn find_first(&self, screen: &GrayImage, names: &[&str]) -> Option<Element> {
        names.iter().find_map(|name| match self.find(screen, name) {
            Ok(found) => found,
            Err(BotError::TemplateNotFound(_)) => None,
            Err(e) => {
                tracing::warn!(template = name, error = %e, "template match failed");
                None
            }
        })
    }

    /// Elements nearest to `origin` first.
    pub fn sort_by_distance(elements: &mut [Element], origin: Point) {
        elements.sort_by(|a, b| a.center().distance(origin).total_cmp(&b.center().distance(origin)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::ccoeff::tests::noise_image;
    use image::Luma;

    fn matcher_with(name: &str, template: GrayImage) -> TemplateMatcher {
        let mut library = TemplateLibrary::new();
        library.insert(name, template);
        TemplateMatcher::new(Arc::new(library), 0.8, 0.3, 10)
    }

    /// Pastes `patch` into `canvas` at `(x, y)`.
    fn paste(canvas: &mut GrayImage, patch: &GrayImage, x: u32, y: u32) {
        image::imageops::replace(canvas, patch, x as i64, y as i64);
    }

    #[test]
    fn find_locates_template() {
        let screen = noise_image(120, 90, 11);
        let patch = image::imageops::crop_imm(&screen, 40, 25, 16, 12).to_image();
        let matcher = matcher_with("army_idle", patch);

        let el = matcher.find(&screen, "army_idle").unwrap().unwrap();
        assert_eq!(el.rect, Rect::new(40, 25, 16, 12));
        assert_eq!(el.element_type, ElementType::Icon);
        assert!(el.confidence > 0.99);
    }

    #[test]
    fn find_below_threshold_is_none() {
        let screen = noise_image(60, 60, 1);
        let unrelated = noise_image(10, 10, 999);
        let matcher = matcher_with("confirm_button", unrelated);
        assert!(matcher.find(&screen, "confirm_button").unwrap().is_none());
    }

    #[test]
    fn unknown_template_is_error() {
        let matcher = matcher_with("a", GrayImage::from_pixel(2, 2, Luma([1])));
        let screen = noise_image(10, 10, 0);
        assert!(matches!(
            matcher.find(&screen, "missing"),
            Err(BotError::TemplateNotFound(_))
        ));
        assert!(matcher.find_first(&screen, &["missing"]).is_none());
    }

    #[test]
    fn find_all_returns_each_copy_once() {
        let patch = noise_image(10, 10, 42);
        let mut screen = GrayImage::from_pixel(100, 60, Luma([0]));
        // background noise so windows are not flat
        paste(&mut screen, &noise_image(100, 60, 5), 0, 0);
        paste(&mut screen, &patch, 5, 5);
        paste(&mut screen, &patch, 50, 30);
        paste(&mut screen, &patch, 80, 8);

        let matcher = matcher_with("empty_land", patch);
        let found = matcher.find_all(&screen, "empty_land").unwrap();
        let mut origins: Vec<(i32, i32)> = found.iter().map(|e| (e.rect.x, e.rect.y)).collect();
        origins.sort();
        assert_eq!(origins, vec![(5, 5), (50, 30), (80, 8)]);
    }

    #[test]
    fn find_all_respects_max_results() {
        let patch = noise_image(6, 6, 8);
        let mut screen = noise_image(100, 20, 2);
        for i in 0..5 {
            paste(&mut screen, &patch, i * 20 + 2, 7);
        }
        let mut matcher = matcher_with("resource_point", patch);
        matcher.max_results = 2;
        assert_eq!(matcher.find_all(&screen, "resource_point").unwrap().len(), 2);
    }

    #[test]
    fn nms_keeps_most_confident_of_overlap() {
        let a = Element::new("x", Rect::new(0, 0, 10, 10), 0.85, ElementType::Icon);
        let b = Element::new("x", Rect::new(2, 0, 10, 10), 0.95, ElementType::Icon);
        let c = Element::new("x", Rect::new(40, 40, 10, 10), 0.81, ElementType::Icon);
        let kept = nms(vec![a, b, c], 0.3);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].rect.x, 2);
        assert_eq!(kept[1].rect.x, 40);
    }

    #[test]
    fn load_reads_png_files_only() {
        let dir = tempfile::tempdir().unwrap();
        noise_image(8, 8, 1).save(dir.path().join("close_button.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();

        let library = TemplateLibrary::load(dir.path()).unwrap();
        assert_eq!(library.names(), vec!["close_button"]);
        let t = library.get("close_button").unwrap();
        assert_eq!(t.image.dimensions(), (8, 8));
    }

    #[test]
    fn missing_dir_gives_empty_library() {
        let library = TemplateLibrary::load(Path::new("/definitely/not/here")).unwrap();
        assert!(library.is_empty());
    }

    #[test]
    fn element_types_from_names() {
        assert_eq!(element_type_for("confirm_button"), ElementType::Button);
        assert_eq!(element_type_for("main_menu"), ElementType::Menu);
        assert_eq!(element_type_for("resource_point"), ElementType::Icon);
    }
}
