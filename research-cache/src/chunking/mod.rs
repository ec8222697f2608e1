use chrono::Utc;
use serde_json::{json, Map, Value};

use common::error::AppError;
use common::utils::config::AppConfig;

/// Abbreviation periods are swapped for this placeholder before sentence
/// splitting and restored afterwards, so "Dr. Smith" stays one sentence.
const ABBREV_PLACEHOLDER: char = '\u{e000}';

const ABBREVIATIONS: &[&str] = &[
    "Mr.", "Mrs.", "Ms.", "Dr.", "Prof.", "Sr.", "Jr.", "St.", "Inc.", "Ltd.", "Corp.", "Co.",
    "vs.", "e.g.", "i.e.", "etc.", "cf.", "et al.", "Fig.", "No.", "approx.",
];

#[derive(Debug, Clone, Copy)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_text_length: usize,
}

impl ChunkingConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            min_text_length: config.min_text_length,
        }
    }
}

/// A bounded segment of text prepared for embedding and storage. Immutable
/// after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub content: String,
    pub metadata: Map<String, Value>,
    pub chunk_index: usize,
    pub source_id: Option<String>,
}

/// Splits normalized text into overlapping, sentence-respecting segments.
pub struct TextChunker {
    config: ChunkingConfig,
}

impl TextChunker {
    /// The `chunk_overlap < chunk_size` invariant is enforced here, at
    /// configuration time; `chunk` does not re-validate it per call.
    pub fn new(config: ChunkingConfig) -> Result<Self, AppError> {
        if config.chunk_size == 0 {
            return Err(AppError::Validation("chunk_size must be positive".into()));
        }
        if config.chunk_overlap >= config.chunk_size {
            return Err(AppError::Validation(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                config.chunk_overlap, config.chunk_size
            )));
        }
        Ok(Self { config })
    }

    /// Splits `text` into chunks of at most `chunk_size` characters, seeding
    /// each new chunk with trailing content of its predecessor. Text shorter
    /// than the configured minimum after normalization yields an empty vec;
    /// that is a valid "nothing to chunk" result, not an error.
    pub fn chunk(
        &self,
        text: &str,
        metadata: &Map<String, Value>,
        source_id: Option<&str>,
    ) -> Vec<Chunk> {
        let normalized = normalize_text(text);
        if normalized.chars().count() < self.config.min_text_length {
            return Vec::new();
        }

        let sentences = split_sentences(&normalized);
        let units = self.to_units(sentences);
        let bodies = self.pack(units);

        let total_chunks = bodies.len();
        let processed_at = Utc::now().to_rfc3339();

        bodies
            .into_iter()
            .enumerate()
            .map(|(chunk_index, content)| {
                let mut merged = metadata.clone();
                merged.insert("chunk_index".to_string(), json!(chunk_index));
                merged.insert("total_chunks".to_string(), json!(total_chunks));
                merged.insert("chunk_length".to_string(), json!(content.chars().count()));
                merged.insert("processed_at".to_string(), json!(processed_at));
                Chunk {
                    content,
                    metadata: merged,
                    chunk_index,
                    source_id: source_id.map(str::to_string),
                }
            })
            .collect()
    }

    /// Sentences that fit `chunk_size` pass through whole; oversized ones are
    /// broken down to word-level pieces so packing never emits an oversized
    /// chunk.
    fn to_units(&self, sentences: Vec<String>) -> Vec<String> {
        let mut units = Vec::with_capacity(sentences.len());
        for sentence in sentences {
            if sentence.chars().count() <= self.config.chunk_size {
                units.push(sentence);
            } else {
                units.extend(pack_words(&sentence, self.config.chunk_size));
            }
        }
        units
    }

    /// Greedy sentence packing with trailing-sentence overlap seeding.
    fn pack(&self, units: Vec<String>) -> Vec<String> {
        let mut bodies: Vec<String> = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_len = 0usize;

        for unit in units {
            let unit_len = unit.chars().count();
            let extra = if current.is_empty() {
                unit_len
            } else {
                unit_len + 1
            };

            if !current.is_empty() && current_len + extra > self.config.chunk_size {
                bodies.push(current.join(" "));

                let (seed, seed_len) = self.overlap_seed(&current);
                current = seed;
                current_len = seed_len;

                // Drop the seed when it would push this unit past the limit.
                let seeded_extra = if current.is_empty() {
                    unit_len
                } else {
                    unit_len + 1
                };
                if current_len + seeded_extra > self.config.chunk_size {
                    current.clear();
                    current_len = 0;
                }
            }

            if current.is_empty() {
                current_len = unit_len;
            } else {
                current_len += unit_len + 1;
            }
            current.push(unit);
        }

        if !current.is_empty() {
            bodies.push(current.join(" "));
        }

        bodies
    }

    /// Scans the just-closed chunk backwards, collecting whole trailing
    /// sentences while the combined length stays within the overlap budget.
    /// When not even the last sentence fits, falls back to its trailing words
    /// so adjacent chunks still share context.
    fn overlap_seed(&self, closed: &[String]) -> (Vec<String>, usize) {
        if self.config.chunk_overlap == 0 {
            return (Vec::new(), 0);
        }

        let mut seed: Vec<String> = Vec::new();
        let mut seed_len = 0usize;
        for sentence in closed.iter().rev() {
            let len = sentence.chars().count();
            let extra = if seed.is_empty() { len } else { len + 1 };
            if seed_len + extra > self.config.chunk_overlap {
                break;
            }
            seed.insert(0, sentence.clone());
            seed_len += extra;
        }

        if seed.is_empty() {
            if let Some(last) = closed.last() {
                if let Some(tail) = trailing_words(last, self.config.chunk_overlap) {
                    let len = tail.chars().count();
                    return (vec![tail], len);
                }
            }
        }

        (seed, seed_len)
    }
}

/// Collapses whitespace runs, strips non-printable control characters while
/// keeping newlines, unifies line endings, and folds runs of blank lines.
pub fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");

    let cleaned: String = unified
        .chars()
        .map(|c| if c == '\t' { ' ' } else { c })
        .filter(|c| *c == '\n' || !c.is_control())
        .collect();

    let mut collapsed = String::with_capacity(cleaned.len());
    for (i, line) in cleaned.split('\n').enumerate() {
        if i > 0 {
            collapsed.push('\n');
        }
        let mut last_was_space = false;
        for c in line.trim().chars() {
            if c == ' ' {
                if !last_was_space {
                    collapsed.push(' ');
                }
                last_was_space = true;
            } else {
                collapsed.push(c);
                last_was_space = false;
            }
        }
    }

    // Fold three or more consecutive newlines down to a single blank line.
    let mut result = String::with_capacity(collapsed.len());
    let mut newline_run = 0usize;
    for c in collapsed.chars() {
        if c == '\n' {
            newline_run += 1;
            if newline_run <= 2 {
                result.push(c);
            }
        } else {
            newline_run = 0;
            result.push(c);
        }
    }

    result.trim().to_string()
}

/// Splits on sentence-terminal punctuation followed by whitespace, with known
/// abbreviations protected by a placeholder substitution.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut protected = text.to_string();
    for abbrev in ABBREVIATIONS {
        if protected.contains(abbrev) {
            let shielded = abbrev.replace('.', &ABBREV_PLACEHOLDER.to_string());
            protected = protected.replace(abbrev, &shielded);
        }
    }

    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = protected.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            if chars.peek().map_or(true, |next| next.is_whitespace()) {
                push_sentence(&mut sentences, &current);
                current.clear();
            }
        }
    }
    push_sentence(&mut sentences, &current);

    sentences
}

fn push_sentence(sentences: &mut Vec<String>, raw: &str) {
    let restored = raw.replace(ABBREV_PLACEHOLDER, ".");
    let trimmed = restored.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
}

/// Word-level greedy packing for a single oversized sentence. Words longer
/// than the budget are hard-split on char boundaries.
fn pack_words(sentence: &str, budget: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for word in sentence.split_whitespace() {
        let word_len = word.chars().count();
        if word_len > budget {
            if !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let chars: Vec<char> = word.chars().collect();
            for piece in chars.chunks(budget) {
                pieces.push(piece.iter().collect());
            }
            continue;
        }

        let extra = if current.is_empty() {
            word_len
        } else {
            word_len + 1
        };
        if current_len + extra > budget && !current.is_empty() {
            pieces.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(word);
        current_len += word_len;
    }

    if !current.is_empty() {
        pieces.push(current);
    }

    pieces
}

/// Trailing words of a sentence fitting within `budget`, or `None` when not
/// even the final word fits.
fn trailing_words(sentence: &str, budget: usize) -> Option<String> {
    let words: Vec<&str> = sentence.split_whitespace().collect();
    let mut taken: Vec<&str> = Vec::new();
    let mut len = 0usize;
    for word in words.iter().rev() {
        let word_len = word.chars().count();
        let extra = if taken.is_empty() {
            word_len
        } else {
            word_len + 1
        };
        if len + extra > budget {
            break;
        }
        taken.insert(0, word);
        len += extra;
    }
    if taken.is_empty() {
        None
    } else {
        Some(taken.join(" "))
    }
}
