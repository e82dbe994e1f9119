//! Spoken-command extraction.
//!
//! A fixed dictionary maps trigger phrases to [`CommandCode`]s. Matching is
//! longest-phrase-first so "copy that" never loses to "copy", and a match
//! needs word boundaries on both sides so "copycat" stays plain text.

use s2p_core::message::CommandCode;

/// The trigger dictionary. Multiple phrases may map to one code.
const PHRASES: &[(&str, CommandCode)] = &[
    ("new line", CommandCode::Enter),
    ("press enter", CommandCode::Enter),
    ("select all", CommandCode::SelectAll),
    ("copy that", CommandCode::Copy),
    ("copy", CommandCode::Copy),
    ("paste", CommandCode::Paste),
    ("cut", CommandCode::Cut),
    ("scratch that", CommandCode::Cancel),
    ("cancel", CommandCode::Cancel),
];

/// Result of running an utterance through the parser. At most one command
/// per utterance; the first (longest) match wins.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedUtterance {
    pub text_before: Option<String>,
    pub command: Option<CommandCode>,
    pub text_after: Option<String>,
}

pub struct CommandParser {
    /// Dictionary sorted by descending phrase length.
    phrases: Vec<(&'static str, CommandCode)>,
}

impl CommandParser {
    pub fn new() -> Self {
        let mut phrases = PHRASES.to_vec();
        phrases.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { phrases }
    }

    /// Phrases in match order, for introspection and tests.
    pub fn phrases(&self) -> impl Iterator<Item = (&'static str, CommandCode)> + '_ {
        self.phrases.iter().copied()
    }

    /// Normalize and split an utterance into text before, a command, and
    /// text after. With no match the whole utterance comes back as
    /// `text_before`.
    pub fn process(&self, text: &str) -> ParsedUtterance {
        let normalized = text.trim().to_lowercase();
        if normalized.is_empty() {
            return ParsedUtterance::default();
        }

        for (phrase, code) in &self.phrases {
            let Some(start) = find_word(&normalized, phrase) else { continue };

            let before = normalized[..start].trim();
            let after = normalized[start + phrase.len()..].trim();
            return ParsedUtterance {
                text_before: (!before.is_empty()).then(|| before.to_string()),
                command: Some(*code),
                text_after: (!after.is_empty()).then(|| after.to_string()),
            };
        }

        ParsedUtterance { text_before: Some(normalized), ..Default::default() }
    }
}

impl Default for CommandParser {
    fn default() -> Self {
        Self::new()
    }
}

/// First occurrence of `phrase` in `text` bounded by non-letters (or the
/// ends of the string) on both sides.
fn find_word(text: &str, phrase: &str) -> Option<usize> {
    for (start, _) in text.match_indices(phrase) {
        let left_ok = text[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphabetic());
        let right_ok = text[start + phrase.len()..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphabetic());
        if left_ok && right_ok {
            return Some(start);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_phrase_matches_alone() {
        let parser = CommandParser::new();
        for (phrase, code) in parser.phrases().collect::<Vec<_>>() {
            let parsed = parser.process(phrase);
            assert_eq!(parsed.command, Some(code), "phrase {phrase:?}");
            assert_eq!(parsed.text_before, None);
            assert_eq!(parsed.text_after, None);
        }
    }

    #[test]
    fn every_phrase_matches_surrounded() {
        let parser = CommandParser::new();
        for (phrase, code) in parser.phrases().collect::<Vec<_>>() {
            let parsed = parser.process(&format!("hello {phrase} world"));
            assert_eq!(parsed.text_before.as_deref(), Some("hello"), "phrase {phrase:?}");
            assert_eq!(parsed.command, Some(code));
            assert_eq!(parsed.text_after.as_deref(), Some("world"));
        }
    }

    #[test]
    fn longest_phrase_wins() {
        let parser = CommandParser::new();
        let parsed = parser.process("copy that");
        assert_eq!(parsed.command, Some(CommandCode::Copy));
        // Matched via "copy that", not "copy" with a "that" residue.
        assert_eq!(parsed.text_before, None);
        assert_eq!(parsed.text_after, None);
    }

    #[test]
    fn matches_need_word_boundaries() {
        let parser = CommandParser::new();
        let parsed = parser.process("the copycat strikes");
        assert_eq!(parsed.command, None);
        assert_eq!(parsed.text_before.as_deref(), Some("the copycat strikes"));

        let parsed = parser.process("shortcut keys");
        assert_eq!(parsed.command, None);

        // Punctuation counts as a boundary.
        let parsed = parser.process("done, copy.");
        assert_eq!(parsed.command, Some(CommandCode::Copy));
        assert_eq!(parsed.text_before.as_deref(), Some("done,"));
        assert_eq!(parsed.text_after.as_deref(), Some("."));
    }

    #[test]
    fn normalization_lowercases_and_trims() {
        let parser = CommandParser::new();
        let parsed = parser.process("  Hello NEW LINE World  ");
        assert_eq!(parsed.text_before.as_deref(), Some("hello"));
        assert_eq!(parsed.command, Some(CommandCode::Enter));
        assert_eq!(parsed.text_after.as_deref(), Some("world"));
    }

    #[test]
    fn no_match_returns_whole_utterance() {
        let parser = CommandParser::new();
        let parsed = parser.process("just dictating some words");
        assert_eq!(parsed.text_before.as_deref(), Some("just dictating some words"));
        assert_eq!(parsed.command, None);
        assert_eq!(parsed.text_after, None);
    }

    #[test]
    fn empty_utterance_yields_nothing() {
        let parser = CommandParser::new();
        assert_eq!(parser.process("   "), ParsedUtterance::default());
    }

    #[test]
    fn at_most_one_command_per_utterance() {
        let parser = CommandParser::new();
        // Scan order is by phrase length, so "paste" is found before "copy";
        // the rest of the utterance stays plain text.
        let parsed = parser.process("copy then paste");
        assert_eq!(parsed.command, Some(CommandCode::Paste));
        assert_eq!(parsed.text_before.as_deref(), Some("copy then"));
        assert_eq!(parsed.text_after, None);
    }
}
