/*!
 * In-process word substitution backend.
 *
 * Used as the last-resort fallback when no LLM is reachable. It never fails
 * and never touches the network; quality is whatever the word list gives.
 */

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use super::{Backend, Prompt};
use crate::errors::ProviderError;

/// Built-in Russian to Serbian (Cyrillic) word list
const DEFAULT_ENTRIES: &[(&str, &str)] = &[
    ("фэнтези", "фантастика"),
    ("приключения", "авантуре"),
    ("Отзвуки", "Одјеци"),
    ("герой", "јунак"),
    ("мир", "свет"),
    ("человек", "човек"),
    ("жизнь", "живот"),
    ("любовь", "љубав"),
    ("смерть", "смрт"),
    ("время", "време"),
    ("дом", "кућа"),
    ("сердце", "срце"),
    ("ночь", "ноћ"),
    ("день", "дан"),
    ("солнце", "сунце"),
    ("луна", "месец"),
    ("земля", "земља"),
    ("огонь", "ватра"),
    ("воздух", "ваздух"),
    ("деревня", "село"),
    ("город", "град"),
    ("книга", "књига"),
    ("слово", "реч"),
    ("язык", "језик"),
    ("глава", "поглавље"),
    ("история", "прича"),
    ("конец", "крај"),
    ("начало", "почетак"),
    ("будущее", "будућност"),
    ("прошлое", "прошлост"),
    ("настоящее", "садашњост"),
    ("вопрос", "питање"),
    ("ответ", "одговор"),
    ("мысль", "мисао"),
    ("чувство", "осећање"),
    ("радость", "радост"),
    ("грусть", "туга"),
    ("надежда", "нада"),
    ("мечта", "сан"),
    ("проверка", "провера"),
    ("перевода", "превођења"),
    ("здесь", "овде"),
    ("находится", "се налази"),
    ("русский", "руски"),
    ("который", "који"),
    ("нужно", "треба"),
    ("перевести", "превести"),
    ("сербский", "српски"),
    ("второй", "други"),
    ("абзац", "пасус"),
    ("содержит", "садржи"),
    ("больше", "више"),
    ("тестирования", "тестирања"),
    ("хотим", "желимо"),
    ("убедиться", "уверити"),
    ("работает", "ради"),
    ("правильно", "исправно"),
    ("сохраняет", "очувава"),
];

/// Dictionary backend; clones share the same word list
#[derive(Debug, Clone)]
pub struct Dictionary {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}

impl Dictionary {
    pub fn new() -> Self {
        let entries = DEFAULT_ENTRIES
            .iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();
        Self {
            entries: Arc::new(RwLock::new(entries)),
        }
    }

    pub fn empty() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn add_entry(&self, from: &str, to: &str) {
        self.entries.write().insert(from.to_string(), to.to_string());
    }

    /// Merge entries, overriding existing ones
    pub fn load(&self, entries: HashMap<String, String>) {
        self.entries.write().extend(entries);
    }

    /// Merge a JSON object of `{"word": "translation"}` pairs
    pub fn load_from_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<usize> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let entries: HashMap<String, String> = serde_json::from_str(&content)?;
        let count = entries.len();
        self.load(entries);
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Substitute every known word in a single pass. Longer keys win over
    /// shorter keys they contain, and replaced text is never rescanned.
    pub fn apply(&self, text: &str) -> String {
        if text.trim().is_empty() {
            return text.to_string();
        }
        let entries = self.entries.read();
        let mut keys: Vec<&String> = entries
            .keys()
            .filter(|k| !k.is_empty() && text.contains(k.as_str()))
            .collect();
        if keys.is_empty() {
            return text.to_string();
        }
        keys.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()).then_with(|| a.cmp(b)));

        let pattern = keys.iter().map(|k| regex::escape(k)).collect::<Vec<_>>().join("|");
        match Regex::new(&pattern) {
            Ok(re) => re
                .replace_all(text, |caps: &regex::Captures| {
                    let matched = &caps[0];
                    entries.get(matched).cloned().unwrap_or_else(|| matched.to_string())
                })
                .into_owned(),
            Err(e) => {
                log::warn!("Dictionary pattern failed to compile: {}", e);
                text.to_string()
            }
        }
    }
}

#[async_trait]
impl Backend for Dictionary {
    async fn translate(
        &self,
        text: &str,
        _prompt: &Prompt,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        Ok(self.apply(text))
    }

    fn provider_name(&self) -> &str {
        "dictionary"
    }

    fn model(&self) -> &str {
        "dictionary"
    }
}
