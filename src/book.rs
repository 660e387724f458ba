/*!
 * In-memory book model.
 *
 * Format adapters (EPUB, FB2, Markdown) parse into and serialise from this
 * tree; the pipeline only ever sees a `Book`. Translation works on
 * `TranslationUnit`s, each addressed by a `UnitPath` into the tree.
 */

use serde::{Deserialize, Serialize};

/// Context hint attached to the book title
pub const HINT_BOOK_TITLE: &str = "Book title";
/// Context hint attached to the book description
pub const HINT_BOOK_DESCRIPTION: &str = "Book description";
/// Context hint attached to chapter titles
pub const HINT_CHAPTER_TITLE: &str = "Chapter title";
/// Context hint attached to section titles
pub const HINT_SECTION_TITLE: &str = "Section title";
/// Context hint attached to section bodies
pub const HINT_SECTION_CONTENT: &str = "Section content";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cover: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Section {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Book {
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
}

/// Position of a unit inside the book tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnitPath {
    MetadataTitle,
    MetadataDescription,
    ChapterTitle { chapter: usize },
    SectionTitle { chapter: usize, section: usize },
    SectionContent { chapter: usize, section: usize },
}

impl UnitPath {
    /// Chapter index, if the path is inside a chapter
    pub fn chapter(&self) -> Option<usize> {
        match self {
            Self::MetadataTitle | Self::MetadataDescription => None,
            Self::ChapterTitle { chapter }
            | Self::SectionTitle { chapter, .. }
            | Self::SectionContent { chapter, .. } => Some(*chapter),
        }
    }

    pub fn is_metadata(&self) -> bool {
        matches!(self, Self::MetadataTitle | Self::MetadataDescription)
    }

    /// The context hint that goes with this position
    pub fn context_hint(&self) -> &'static str {
        match self {
            Self::MetadataTitle => HINT_BOOK_TITLE,
            Self::MetadataDescription => HINT_BOOK_DESCRIPTION,
            Self::ChapterTitle { .. } => HINT_CHAPTER_TITLE,
            Self::SectionTitle { .. } => HINT_SECTION_TITLE,
            Self::SectionContent { .. } => HINT_SECTION_CONTENT,
        }
    }
}

impl std::fmt::Display for UnitPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MetadataTitle => write!(f, "metadata.title"),
            Self::MetadataDescription => write!(f, "metadata.description"),
            Self::ChapterTitle { chapter } => write!(f, "chapters[{}].title", chapter),
            Self::SectionTitle { chapter, section } => {
                write!(f, "chapters[{}].sections[{}].title", chapter, section)
            }
            Self::SectionContent { chapter, section } => {
                write!(f, "chapters[{}].sections[{}].content", chapter, section)
            }
        }
    }
}

/// One atomic piece of text to translate
#[derive(Debug, Clone, PartialEq)]
pub struct TranslationUnit {
    pub text: String,
    pub context_hint: String,
    pub path: UnitPath,
}

impl TranslationUnit {
    pub fn new(path: UnitPath, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context_hint: path.context_hint().to_string(),
            path,
        }
    }

    /// Blank units pass through untouched and never reach the cache
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

impl Book {
    /// All units in traversal order: metadata first, then each chapter title
    /// followed by its sections' titles and contents.
    pub fn units(&self) -> Vec<TranslationUnit> {
        let mut units = vec![
            TranslationUnit::new(UnitPath::MetadataTitle, self.metadata.title.clone()),
            TranslationUnit::new(UnitPath::MetadataDescription, self.metadata.description.clone()),
        ];
        for (c, chapter) in self.chapters.iter().enumerate() {
            units.push(TranslationUnit::new(
                UnitPath::ChapterTitle { chapter: c },
                chapter.title.clone(),
            ));
            for (s, section) in chapter.sections.iter().enumerate() {
                units.push(TranslationUnit::new(
                    UnitPath::SectionTitle { chapter: c, section: s },
                    section.title.clone(),
                ));
                units.push(TranslationUnit::new(
                    UnitPath::SectionContent { chapter: c, section: s },
                    section.content.clone(),
                ));
            }
        }
        units
    }

    pub fn get(&self, path: UnitPath) -> Option<&str> {
        let text = match path {
            UnitPath::MetadataTitle => &self.metadata.title,
            UnitPath::MetadataDescription => &self.metadata.description,
            UnitPath::ChapterTitle { chapter } => &self.chapters.get(chapter)?.title,
            UnitPath::SectionTitle { chapter, section } => {
                &self.chapters.get(chapter)?.sections.get(section)?.title
            }
            UnitPath::SectionContent { chapter, section } => {
                &self.chapters.get(chapter)?.sections.get(section)?.content
            }
        };
        Some(text.as_str())
    }

    /// Replace the text at `path`. Returns false if the path does not exist.
    pub fn set(&mut self, path: UnitPath, text: String) -> bool {
        let slot = match path {
            UnitPath::MetadataTitle => Some(&mut self.metadata.title),
            UnitPath::MetadataDescription => Some(&mut self.metadata.description),
            UnitPath::ChapterTitle { chapter } => self.chapters.get_mut(chapter).map(|c| &mut c.title),
            UnitPath::SectionTitle { chapter, section } => self
                .chapters
                .get_mut(chapter)
                .and_then(|c| c.sections.get_mut(section))
                .map(|s| &mut s.title),
            UnitPath::SectionContent { chapter, section } => self
                .chapters
                .get_mut(chapter)
                .and_then(|c| c.sections.get_mut(section))
                .map(|s| &mut s.content),
        };
        match slot {
            Some(slot) => {
                *slot = text;
                true
            }
            None => false,
        }
    }

    /// A bounded excerpt of the book body, used for language detection
    pub fn sample_text(&self, max_chars: usize) -> String {
        let mut sample = String::new();
        let pieces = std::iter::once(self.metadata.title.as_str())
            .chain(std::iter::once(self.metadata.description.as_str()))
            .chain(self.chapters.iter().flat_map(|c| {
                std::iter::once(c.title.as_str())
                    .chain(c.sections.iter().map(|s| s.content.as_str()))
            }));
        for piece in pieces.filter(|p| !p.trim().is_empty()) {
            if sample.chars().count() >= max_chars {
                break;
            }
            if !sample.is_empty() {
                sample.push('\n');
            }
            sample.push_str(piece.trim());
        }
        sample.chars().take(max_chars).collect()
    }

    pub fn section_count(&self) -> usize {
        self.chapters.iter().map(|c| c.sections.len()).sum()
    }
}
