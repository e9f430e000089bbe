//! Trigger classification.
//!
//! Text is matched against an ordered rule list; the first rule that fires decides the
//! [`Intent`]. Word rules only fire when the trimmed text *starts with* a configured
//! word (case-insensitive), so a message that merely mentions `ping`, or an echo of
//! another bot's reply, never triggers.
//!
//! Rule order: postal code, phone prefix, info, telemetry, ping.

use std::fmt;

/// What an inbound text asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Ping,
    Info,
    Telemetry,
    Zipcode(String),
    PhonePrefix(String),
    None,
}

impl Intent {
    /// Whether the intent takes a rate-limit slot and counts as a received ping.
    pub fn is_metered(&self) -> bool {
        matches!(
            self,
            Intent::Ping | Intent::Telemetry | Intent::Zipcode(_) | Intent::PhonePrefix(_)
        )
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::Ping => write!(f, "ping"),
            Intent::Info => write!(f, "info"),
            Intent::Telemetry => write!(f, "telemetry"),
            Intent::Zipcode(code) => write!(f, "zipcode {}", code),
            Intent::PhonePrefix(p) => write!(f, "prefix {}", p),
            Intent::None => write!(f, "none"),
        }
    }
}

pub const DEFAULT_TRIGGER_WORDS: &[&str] = &["ping", "test", "pink", "echo"];
pub const DEFAULT_INFO_WORDS: &[&str] = &["info", "help", "?"];
pub const DEFAULT_TELEMETRY_WORDS: &[&str] = &["stats", "telemetry"];

type Matcher = Box<dyn Fn(&str) -> Option<Intent> + Send + Sync>;

struct Rule {
    name: &'static str,
    matcher: Matcher,
}

/// Ordered rule list mapping text to an [`Intent`].
pub struct TriggerClassifier {
    rules: Vec<Rule>,
}

impl Default for TriggerClassifier {
    fn default() -> Self {
        Self::new(
            DEFAULT_TRIGGER_WORDS,
            DEFAULT_INFO_WORDS,
            DEFAULT_TELEMETRY_WORDS,
        )
    }
}

impl fmt::Debug for TriggerClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|r| r.name))
            .finish()
    }
}

impl TriggerClassifier {
    pub fn new<S: AsRef<str>>(ping_words: &[S], info_words: &[S], telemetry_words: &[S]) -> Self {
        let mut classifier = Self { rules: Vec::new() };
        classifier.push("zipcode", |t| {
            is_zipcode(t).then(|| Intent::Zipcode(t.to_string()))
        });
        classifier.push("phone-prefix", |t| {
            is_phone_prefix(t).then(|| Intent::PhonePrefix(t.to_string()))
        });
        classifier.push_words("info", info_words, Intent::Info);
        classifier.push_words("telemetry", telemetry_words, Intent::Telemetry);
        classifier.push_words("ping", ping_words, Intent::Ping);
        classifier
    }

    fn push<F>(&mut self, name: &'static str, matcher: F)
    where
        F: Fn(&str) -> Option<Intent> + Send + Sync + 'static,
    {
        self.rules.push(Rule {
            name,
            matcher: Box::new(matcher),
        });
    }

    fn push_words<S: AsRef<str>>(&mut self, name: &'static str, words: &[S], intent: Intent) {
        let words: Vec<String> = words
            .iter()
            .map(|w| w.as_ref().trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();
        if words.is_empty() {
            return;
        }
        self.push(name, move |t| {
            let lower = t.to_lowercase();
            words
                .iter()
                .any(|w| lower.starts_with(w.as_str()))
                .then(|| intent.clone())
        });
    }

    pub fn classify(&self, text: &str) -> Intent {
        let text = text.trim();
        if text.is_empty() {
            return Intent::None;
        }
        self.rules
            .iter()
            .find_map(|rule| (rule.matcher)(text))
            .unwrap_or(Intent::None)
    }
}

/// Exactly five ASCII digits.
pub fn is_zipcode(text: &str) -> bool {
    text.len() == 5 && text.bytes().all(|b| b.is_ascii_digit())
}

/// A leading zero followed by two to four digits.
pub fn is_phone_prefix(text: &str) -> bool {
    (3..=5).contains(&text.len())
        && text.starts_with('0')
        && text.bytes().all(|b| b.is_ascii_digit())
}
