//! Persisted user settings and spoken speed parsing

use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::autocapture::ChainingPolicy;

pub const MIN_SPEECH_RATE: u8 = 1;
pub const MAX_SPEECH_RATE: u8 = 10;

/// User preferences that survive restarts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Speech rate multiplier, 1..=10
    pub speech_rate: u8,
    /// Preferred engine voice
    pub voice: Option<String>,
    /// Auto-capture chaining policy
    pub policy: ChainingPolicy,
    /// Repeat interval for the interval-chained policy
    pub interval_secs: u64,
    /// Description model id
    pub model: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            speech_rate: 3,
            voice: None,
            policy: ChainingPolicy::CompletionChained,
            interval_secs: 3,
            model: "gemini-2.0-flash".to_string(),
        }
    }
}

impl Settings {
    /// Load settings, falling back to defaults when the file is missing or
    /// unreadable
    pub fn load(path: &Path) -> Self {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(?path, "no settings file, using defaults");
                return Self::default();
            }
            Err(e) => {
                warn!(?e, ?path, "failed to read settings, using defaults");
                return Self::default();
            }
        };

        match serde_json::from_slice::<Settings>(&bytes) {
            Ok(settings) => settings.sanitized(),
            Err(e) => {
                warn!(?e, ?path, "corrupt settings file, using defaults");
                Self::default()
            }
        }
    }

    /// Write settings atomically
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("failed to create settings directory")?;
        }
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(&tmp, json).context("failed to write settings")?;
        std::fs::rename(&tmp, path).context("failed to replace settings")?;
        Ok(())
    }

    fn sanitized(mut self) -> Self {
        if !(MIN_SPEECH_RATE..=MAX_SPEECH_RATE).contains(&self.speech_rate) {
            warn!(rate = self.speech_rate, "stored speech rate out of range, resetting");
            self.speech_rate = Self::default().speech_rate;
        }
        if !(1..=60).contains(&self.interval_secs) {
            self.interval_secs = Self::default().interval_secs;
        }
        self
    }
}

fn number_word(word: &str) -> Option<u8> {
    let n = match word {
        "one" | "일" | "한" | "하나" => 1,
        "two" | "이" | "두" | "둘" => 2,
        "three" | "삼" | "세" | "셋" => 3,
        "four" | "사" | "네" | "넷" => 4,
        "five" | "오" | "다섯" => 5,
        "six" | "육" | "여섯" => 6,
        "seven" | "칠" | "일곱" => 7,
        "eight" | "팔" | "여덟" => 8,
        "nine" | "구" | "아홉" => 9,
        "ten" | "십" | "열" => 10,
        _ => return None,
    };
    Some(n)
}

fn token_value(token: &str) -> Option<u8> {
    token
        .parse::<u8>()
        .ok()
        .or_else(|| number_word(token))
        .filter(|n| (MIN_SPEECH_RATE..=MAX_SPEECH_RATE).contains(n))
}

// "3x", "three times", "3배", "세 배속", "다섯빼"
const SPEED_PATTERN: &str = r"([0-9]+|[a-z]+|[가-힣]+)\s*(?:배속|배|빼|x\b|times\b)";

/// Compiled suffix pattern. `None` if it failed to compile, in which case
/// only bare numbers are recognised.
fn speed_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| match Regex::new(SPEED_PATTERN) {
            Ok(regex) => Some(regex),
            Err(e) => {
                warn!(?e, "invalid speed regex, suffixed speeds disabled");
                None
            }
        })
        .as_ref()
}

/// Extract a 1..=10 speed from a recognised utterance.
///
/// Accepts a number followed by a multiplier suffix, or an utterance that is
/// nothing but a number.
pub fn parse_spoken_speed(text: &str) -> Option<u8> {
    let lowered = text.trim().to_lowercase();

    if let Some(pattern) = speed_pattern() {
        for caps in pattern.captures_iter(&lowered) {
            if let Some(n) = caps.get(1).and_then(|m| token_value(m.as_str())) {
                debug!(text, speed = n, "speed recognised");
                return Some(n);
            }
        }
    }

    let bare = lowered.trim_end_matches(['.', '!', '?']).trim();
    let n = token_value(bare);
    if n.is_none() {
        debug!(text, "no speed recognised");
    }
    n
}
