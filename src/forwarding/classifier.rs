//! Rule-driven content classification.
//!
//! Classification is deterministic: rules are evaluated by descending
//! priority (insertion order within a priority band), the first match wins,
//! and the same message with the same rule set always yields the same
//! category and confidence.

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::types::message::{MediaKind, Message};

/// Content type detected from the message's media discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Sticker,
    Animation,
    Contact,
    Location,
    Poll,
    Game,
    Webpage,
    Text,
    Unknown,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::Voice => "voice",
            Self::Sticker => "sticker",
            Self::Animation => "animation",
            Self::Contact => "contact",
            Self::Location => "location",
            Self::Poll => "poll",
            Self::Game => "game",
            Self::Webpage => "webpage",
            Self::Text => "text",
            Self::Unknown => "unknown",
        }
    }

    pub fn detect(message: &Message) -> Self {
        match &message.media {
            Some(media) => match media.kind {
                MediaKind::Photo => Self::Photo,
                MediaKind::Video => Self::Video,
                MediaKind::Document => Self::Document,
                MediaKind::Audio => Self::Audio,
                MediaKind::Voice => Self::Voice,
                MediaKind::Sticker => Self::Sticker,
                MediaKind::Animation => Self::Animation,
                MediaKind::Contact => Self::Contact,
                MediaKind::Location => Self::Location,
                MediaKind::Poll => Self::Poll,
                MediaKind::Game => Self::Game,
                MediaKind::Webpage => Self::Webpage,
            },
            None if !message.text.is_empty() => Self::Text,
            None => Self::Unknown,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStrategy {
    MediaType,
    FileExtension,
    SizeBased,
    PatternMatching,
    SourceBased,
    /// Extension point; never matches in this crate.
    ContentAnalysis,
    /// Extension point; never matches in this crate.
    MlClassification,
}

/// Size bounds attached to a `size_based` rule.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConditions {
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub name: String,
    pub strategy: RuleStrategy,
    pub pattern: String,
    pub category: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub conditions: RuleConditions,
    #[serde(default)]
    pub metadata_extractors: Vec<String>,
}

/// Classification output for one message.
#[derive(Clone, Debug)]
pub struct ContentMetadata {
    pub content_type: ContentType,
    pub category: String,
    pub subcategory: Option<String>,
    pub file_extension: Option<String>,
    pub file_size: Option<u64>,
    pub mime_type: Option<String>,
    pub duration: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub source_channel: Option<String>,
    pub keywords: Vec<String>,
    pub confidence: f64,
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ContentMetadata {
    fn new(content_type: ContentType) -> Self {
        Self {
            content_type,
            category: "general".to_string(),
            subcategory: None,
            file_extension: None,
            file_size: None,
            mime_type: None,
            duration: None,
            width: None,
            height: None,
            source_channel: None,
            keywords: Vec::new(),
            confidence: 1.0,
            extra: BTreeMap::new(),
        }
    }
}

const EXTENSION_GROUPS: &[(&str, &[&str])] = &[
    ("image", &[".jpg", ".jpeg", ".png", ".gif", ".bmp", ".webp", ".svg", ".ico"]),
    ("video", &[".mp4", ".mkv", ".avi", ".mov", ".wmv", ".flv", ".webm", ".m4v"]),
    ("audio", &[".mp3", ".wav", ".flac", ".aac", ".ogg", ".wma", ".m4a"]),
    ("document", &[".pdf", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".txt"]),
    ("archive", &[".zip", ".rar", ".7z", ".tar", ".gz", ".bz2", ".xz"]),
    ("code", &[".py", ".js", ".java", ".c", ".cpp", ".h", ".html", ".css", ".php", ".rs"]),
    ("data", &[".json", ".xml", ".csv", ".sql", ".db", ".sqlite"]),
    ("ebook", &[".epub", ".mobi", ".azw", ".fb2", ".djvu"]),
    ("font", &[".ttf", ".otf", ".woff", ".woff2", ".eot"]),
    ("cad", &[".dwg", ".dxf", ".step", ".stp", ".iges", ".igs"]),
    ("vector", &[".ai", ".eps", ".ps", ".cdr"]),
    ("executable", &[".exe", ".msi", ".deb", ".rpm", ".dmg", ".app"]),
    ("iso_image", &[".iso", ".img", ".bin", ".cue"]),
];

const SIZE_CATEGORIES: &[(&str, u64, u64)] = &[
    ("tiny", 0, 10 * 1024),
    ("small", 10 * 1024, 100 * 1024),
    ("medium", 100 * 1024, 10 * 1024 * 1024),
    ("large", 10 * 1024 * 1024, 100 * 1024 * 1024),
    ("huge", 100 * 1024 * 1024, u64::MAX),
];

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "had", "her", "was",
    "one", "our", "out", "day", "get", "has", "him", "his", "how", "its", "may", "new",
    "now", "old", "see", "two", "who", "boy", "did", "man", "end", "few", "got", "let",
    "put", "say", "she", "too", "use", "this", "that", "with", "from", "have", "will",
];

const MAX_KEYWORDS: usize = 20;

fn text_patterns() -> &'static [(&'static str, Regex)] {
    static PATTERNS: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            ("url", Regex::new(r"https?://\S+").unwrap()),
            (
                "email",
                Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap(),
            ),
            ("hashtag", Regex::new(r"#\w+").unwrap()),
            ("mention", Regex::new(r"@\w+").unwrap()),
            ("phone", Regex::new(r"\+?[1-9]?[0-9]{7,15}").unwrap()),
            (
                "bitcoin",
                Regex::new(r"\b[13][a-km-zA-HJ-NP-Z1-9]{25,34}\b").unwrap(),
            ),
            (
                "credit_card",
                Regex::new(r"\b(?:\d{4}[-\s]?){3}\d{4}\b").unwrap(),
            ),
            (
                "ip_address",
                Regex::new(r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b").unwrap(),
            ),
        ]
    })
}

fn keyword_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\w{4,}\b").unwrap())
}

fn extension_group(extension: &str) -> Option<&'static str> {
    let lower = extension.to_ascii_lowercase();
    EXTENSION_GROUPS
        .iter()
        .find(|(_, exts)| exts.contains(&lower.as_str()))
        .map(|(group, _)| *group)
}

fn size_category(size: u64) -> &'static str {
    SIZE_CATEGORIES
        .iter()
        .find(|(_, min, max)| size >= *min && size < *max)
        .map(|(name, _, _)| *name)
        .unwrap_or("unknown")
}

pub struct ContentClassifier {
    rules: Vec<ClassificationRule>,
}

impl ContentClassifier {
    pub fn new() -> Self {
        let mut classifier = Self { rules: Vec::new() };
        classifier.install_default_rules();
        classifier
    }

    pub fn without_rules() -> Self {
        Self { rules: Vec::new() }
    }

    fn install_default_rules(&mut self) {
        let defaults = [
            ("photo_classification", RuleStrategy::MediaType, "photo", "photos", 100, RuleConditions::default()),
            ("video_classification", RuleStrategy::MediaType, "video", "videos", 100, RuleConditions::default()),
            ("audio_classification", RuleStrategy::MediaType, "audio", "audio", 100, RuleConditions::default()),
            ("document_classification", RuleStrategy::MediaType, "document", "documents", 90, RuleConditions::default()),
            ("archive_files", RuleStrategy::FileExtension, "archive", "archives", 80, RuleConditions::default()),
            ("code_files", RuleStrategy::FileExtension, "code", "source_code", 80, RuleConditions::default()),
            ("url_content", RuleStrategy::PatternMatching, "url", "links", 60, RuleConditions::default()),
            (
                "large_files",
                RuleStrategy::SizeBased,
                "large",
                "large_files",
                50,
                RuleConditions {
                    min_size: Some(50 * 1024 * 1024),
                    max_size: None,
                },
            ),
        ];
        for (name, strategy, pattern, category, priority, conditions) in defaults {
            self.add_rule(ClassificationRule {
                name: name.to_string(),
                strategy,
                pattern: pattern.to_string(),
                category: category.to_string(),
                priority,
                conditions,
                metadata_extractors: Vec::new(),
            });
        }
    }

    /// Insert a rule, keeping the evaluation order stable: priority
    /// descending, insertion order inside a band.
    pub fn add_rule(&mut self, rule: ClassificationRule) {
        self.rules.push(rule);
        self.rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
    }

    pub fn remove_rule(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.name != name);
        self.rules.len() != before
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    pub fn export_rules(&self) -> serde_json::Value {
        serde_json::to_value(&self.rules).unwrap_or_default()
    }

    pub fn import_rules(&mut self, raw: &serde_json::Value) -> usize {
        let Ok(rules) = serde_json::from_value::<Vec<ClassificationRule>>(raw.clone()) else {
            return 0;
        };
        let count = rules.len();
        for rule in rules {
            self.add_rule(rule);
        }
        count
    }

    /// Classify a message and extract metadata.
    pub fn classify(&self, message: &Message, source_channel: Option<&str>) -> ContentMetadata {
        let content_type = ContentType::detect(message);
        let mut metadata = ContentMetadata::new(content_type);
        metadata.source_channel = source_channel.map(str::to_string);

        self.extract_basic(message, &mut metadata);
        self.apply_rules(message, &mut metadata);
        self.extract_type_specific(&mut metadata);
        if !message.text.is_empty() {
            self.extract_text_patterns(&message.text, &mut metadata);
        }

        metadata
    }

    fn extract_basic(&self, message: &Message, metadata: &mut ContentMetadata) {
        if let Some(file) = &message.file {
            metadata.file_size = Some(file.size);
            metadata.mime_type = file.mime.clone();
            if let Some(name) = &file.name {
                if let Some(pos) = name.rfind('.') {
                    metadata.file_extension = Some(name[pos..].to_ascii_lowercase());
                }
            }
        }
        if let Some(media) = &message.media {
            metadata.duration = media.duration;
            metadata.width = media.width;
            metadata.height = media.height;
        }
    }

    fn apply_rules(&self, message: &Message, metadata: &mut ContentMetadata) {
        for rule in &self.rules {
            if self.rule_matches(rule, message, metadata) {
                metadata.category = rule.category.clone();
                metadata.confidence = (metadata.confidence + 0.1).min(1.0);
                return;
            }
        }
        metadata.category = metadata.content_type.as_str().to_string();
    }

    fn rule_matches(
        &self,
        rule: &ClassificationRule,
        message: &Message,
        metadata: &ContentMetadata,
    ) -> bool {
        match rule.strategy {
            RuleStrategy::MediaType => metadata.content_type.as_str() == rule.pattern,
            RuleStrategy::FileExtension => metadata
                .file_extension
                .as_deref()
                .and_then(extension_group)
                .map(|group| group == rule.pattern)
                .unwrap_or(false),
            RuleStrategy::SizeBased => match metadata.file_size {
                Some(size) => {
                    let min = rule.conditions.min_size.unwrap_or(0);
                    let max = rule.conditions.max_size.unwrap_or(u64::MAX);
                    size >= min && size <= max
                }
                None => false,
            },
            RuleStrategy::PatternMatching => {
                if message.text.is_empty() {
                    return false;
                }
                text_patterns()
                    .iter()
                    .find(|(name, _)| *name == rule.pattern)
                    .map(|(_, re)| re.is_match(&message.text))
                    .unwrap_or(false)
            }
            RuleStrategy::SourceBased => {
                metadata.source_channel.as_deref() == Some(rule.pattern.as_str())
            }
            RuleStrategy::ContentAnalysis | RuleStrategy::MlClassification => false,
        }
    }

    fn extract_type_specific(&self, metadata: &mut ContentMetadata) {
        match metadata.content_type {
            ContentType::Photo => {
                metadata.subcategory = Some("photo".to_string());
                if let Some(size) = metadata.file_size {
                    metadata.extra.insert(
                        "size_category".to_string(),
                        serde_json::Value::String(size_category(size).to_string()),
                    );
                }
            }
            ContentType::Video => {
                metadata.subcategory = Some(match metadata.duration {
                    Some(d) if d < 30 => "short_video".to_string(),
                    Some(d) if d > 3600 => "long_video".to_string(),
                    _ => "video".to_string(),
                });
            }
            ContentType::Voice => {
                metadata.subcategory = Some("voice_message".to_string());
            }
            ContentType::Audio => {
                metadata.subcategory = Some("audio_file".to_string());
            }
            ContentType::Document => {
                if let Some(group) = metadata
                    .file_extension
                    .as_deref()
                    .and_then(extension_group)
                {
                    metadata.subcategory = Some(group.to_string());
                    metadata.extra.insert(
                        "file_type".to_string(),
                        serde_json::Value::String(group.to_string()),
                    );
                }
            }
            _ => {}
        }
    }

    fn extract_text_patterns(&self, text: &str, metadata: &mut ContentMetadata) {
        let mut keywords: Vec<String> = Vec::new();

        for (name, pattern) in text_patterns() {
            let count = pattern.find_iter(text).count();
            if count > 0 {
                keywords.push((*name).to_string());
                metadata.extra.insert(
                    format!("{name}_count"),
                    serde_json::Value::from(count as u64),
                );
            }
        }

        let stop_words: HashSet<&str> = STOP_WORDS.iter().copied().collect();
        let lower = text.to_lowercase();
        let mut seen: HashSet<String> = HashSet::new();
        for word in keyword_regex().find_iter(&lower) {
            let word = word.as_str();
            if stop_words.contains(word) {
                continue;
            }
            if seen.insert(word.to_string()) {
                keywords.push(word.to_string());
            }
            if keywords.len() >= MAX_KEYWORDS {
                break;
            }
        }

        keywords.truncate(MAX_KEYWORDS);
        metadata.keywords = keywords;
    }

    pub fn stats(&self) -> ClassifierStats {
        ClassifierStats {
            total_rules: self.rules.len(),
            extension_groups: EXTENSION_GROUPS.len(),
            text_patterns: text_patterns().len(),
        }
    }
}

impl Default for ContentClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct ClassifierStats {
    pub total_rules: usize,
    pub extension_groups: usize,
    pub text_patterns: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::{file_message, photo_message, text_message};
    use crate::types::message::{FileInfo, MediaInfo, MediaKind};

    #[test]
    fn test_photo_classified_by_media_type_rule() {
        let classifier = ContentClassifier::new();
        let metadata = classifier.classify(&photo_message(1, 9), None);

        assert_eq!(metadata.content_type, ContentType::Photo);
        assert_eq!(metadata.category, "photos");
        assert_eq!(metadata.subcategory.as_deref(), Some("photo"));
        assert!((metadata.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_archive_extension_beats_size() {
        let classifier = ContentClassifier::new();
        let msg = file_message(1, 9, 101, "backup.rar", 200 * 1024 * 1024);
        let metadata = classifier.classify(&msg, None);

        // The document media-type rule (priority 90) wins over the archive
        // extension rule (priority 80) for document media.
        assert_eq!(metadata.category, "documents");
        assert_eq!(metadata.subcategory.as_deref(), Some("archive"));
        assert_eq!(metadata.file_extension.as_deref(), Some(".rar"));
    }

    #[test]
    fn test_extension_group_lookup() {
        assert_eq!(extension_group(".RAR"), Some("archive"));
        assert_eq!(extension_group(".pdf"), Some("document"));
        assert_eq!(extension_group(".iso"), Some("iso_image"));
        assert_eq!(extension_group(".xyz"), None);
    }

    #[test]
    fn test_size_categories() {
        assert_eq!(size_category(1024), "tiny");
        assert_eq!(size_category(50 * 1024), "small");
        assert_eq!(size_category(5 * 1024 * 1024), "medium");
        assert_eq!(size_category(50 * 1024 * 1024), "large");
        assert_eq!(size_category(500 * 1024 * 1024), "huge");
    }

    #[test]
    fn test_text_with_url_classified_as_links() {
        let classifier = ContentClassifier::new();
        let msg = text_message(1, 9, "check https://example.com/leak out");
        let metadata = classifier.classify(&msg, None);

        assert_eq!(metadata.content_type, ContentType::Text);
        assert_eq!(metadata.category, "links");
        assert_eq!(
            metadata.extra.get("url_count"),
            Some(&serde_json::Value::from(1u64))
        );
        assert!(metadata.keywords.contains(&"url".to_string()));
    }

    #[test]
    fn test_unmatched_message_falls_back_to_content_type() {
        let classifier = ContentClassifier::new();
        let msg = text_message(1, 9, "short note");
        let metadata = classifier.classify(&msg, None);
        assert_eq!(metadata.category, "text");
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = ContentClassifier::new();
        let msg = text_message(1, 9, "grab https://host/x and email me at a@b.co now");

        let first = classifier.classify(&msg, Some("-100"));
        let second = classifier.classify(&msg, Some("-100"));

        assert_eq!(first.category, second.category);
        assert_eq!(first.confidence, second.confidence);
        assert_eq!(first.keywords, second.keywords);
        assert_eq!(first.extra, second.extra);
    }

    #[test]
    fn test_video_duration_subcategories() {
        let classifier = ContentClassifier::new();

        let mut clip = text_message(1, 9, "");
        clip.media = Some(MediaInfo {
            kind: MediaKind::Video,
            duration: Some(10),
            width: Some(720),
            height: Some(1280),
        });
        assert_eq!(
            classifier.classify(&clip, None).subcategory.as_deref(),
            Some("short_video")
        );

        let mut film = clip.clone();
        film.media.as_mut().unwrap().duration = Some(7200);
        assert_eq!(
            classifier.classify(&film, None).subcategory.as_deref(),
            Some("long_video")
        );
    }

    #[test]
    fn test_voice_vs_audio_subcategory() {
        let classifier = ContentClassifier::new();

        let mut voice = text_message(1, 9, "");
        voice.media = Some(MediaInfo::of_kind(MediaKind::Voice));
        assert_eq!(
            classifier.classify(&voice, None).subcategory.as_deref(),
            Some("voice_message")
        );

        let mut track = text_message(2, 9, "");
        track.media = Some(MediaInfo::of_kind(MediaKind::Audio));
        assert_eq!(
            classifier.classify(&track, None).subcategory.as_deref(),
            Some("audio_file")
        );
    }

    #[test]
    fn test_keyword_extraction_caps_and_filters() {
        let classifier = ContentClassifier::new();
        let long_text = (0..40)
            .map(|i| format!("keyword{i}"))
            .collect::<Vec<_>>()
            .join(" ");
        let msg = text_message(1, 9, &format!("the and for {long_text}"));

        let metadata = classifier.classify(&msg, None);
        assert!(metadata.keywords.len() <= MAX_KEYWORDS);
        assert!(!metadata.keywords.contains(&"the".to_string()));
    }

    #[test]
    fn test_size_based_rule_matches_in_range() {
        let mut classifier = ContentClassifier::without_rules();
        classifier.add_rule(ClassificationRule {
            name: "mid".to_string(),
            strategy: RuleStrategy::SizeBased,
            pattern: "medium".to_string(),
            category: "mid_sized".to_string(),
            priority: 10,
            conditions: RuleConditions {
                min_size: Some(100),
                max_size: Some(1000),
            },
            metadata_extractors: Vec::new(),
        });

        let inside = file_message(1, 9, 101, "f.bin", 500);
        assert_eq!(classifier.classify(&inside, None).category, "mid_sized");

        let outside = file_message(2, 9, 102, "f.bin", 5000);
        assert_eq!(classifier.classify(&outside, None).category, "document");
    }

    #[test]
    fn test_source_based_rule() {
        let mut classifier = ContentClassifier::without_rules();
        classifier.add_rule(ClassificationRule {
            name: "watched".to_string(),
            strategy: RuleStrategy::SourceBased,
            pattern: "-100500".to_string(),
            category: "watched_channel".to_string(),
            priority: 10,
            conditions: RuleConditions::default(),
            metadata_extractors: Vec::new(),
        });

        let msg = text_message(1, 9, "hello there");
        assert_eq!(
            classifier.classify(&msg, Some("-100500")).category,
            "watched_channel"
        );
        assert_eq!(classifier.classify(&msg, Some("-42")).category, "text");
    }

    #[test]
    fn test_priority_order_is_stable() {
        let mut classifier = ContentClassifier::without_rules();
        for name in ["first", "second"] {
            classifier.add_rule(ClassificationRule {
                name: name.to_string(),
                strategy: RuleStrategy::MediaType,
                pattern: "text".to_string(),
                category: name.to_string(),
                priority: 10,
                conditions: RuleConditions::default(),
                metadata_extractors: Vec::new(),
            });
        }

        // Same priority: insertion order decides.
        let msg = text_message(1, 9, "body");
        assert_eq!(classifier.classify(&msg, None).category, "first");
    }

    #[test]
    fn test_rule_export_import_round_trip() {
        let classifier = ContentClassifier::new();
        let exported = classifier.export_rules();

        let mut fresh = ContentClassifier::without_rules();
        let imported = fresh.import_rules(&exported);

        assert_eq!(imported, classifier.rules().len());
        let msg = photo_message(1, 9);
        assert_eq!(fresh.classify(&msg, None).category, "photos");
    }

    #[test]
    fn test_remove_rule() {
        let mut classifier = ContentClassifier::new();
        assert!(classifier.remove_rule("photo_classification"));
        assert!(!classifier.remove_rule("photo_classification"));

        let metadata = classifier.classify(&photo_message(1, 9), None);
        assert_eq!(metadata.category, "photo");
    }

    #[test]
    fn test_file_without_media_kind_detects_unknown() {
        let classifier = ContentClassifier::new();
        let msg = Message {
            id: 1,
            date: chrono::Utc::now(),
            sender_id: Some(9),
            text: String::new(),
            file: Some(FileInfo {
                id: 5,
                name: Some("blob".into()),
                size: 1,
                mime: None,
            }),
            media: None,
            reply_to: None,
        };
        assert_eq!(
            classifier.classify(&msg, None).content_type,
            ContentType::Unknown
        );
    }
}
