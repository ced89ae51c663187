//! Session document shared by every participant of a room.

use std::fmt;

use serde::{Deserialize, Serialize};

/// BCP-47 style language tag, e.g. `en-US` or `ja`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LanguageTag(String);

impl LanguageTag {
    pub fn new<S: Into<String>>(tag: S) -> Self {
        Self(tag.into().trim().replace('_', "-"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Primary language subtag, lowercased (`en` for `en-US`).
    pub fn primary(&self) -> String {
        self.0
            .split('-')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase()
    }

    /// Two tags address the same spoken language when their primary subtags match.
    pub fn same_language(&self, other: &LanguageTag) -> bool {
        self.primary() == other.primary()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for LanguageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LanguageTag {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub participant_id: String,
    pub language: LanguageTag,
}

impl Participant {
    pub fn new<S: Into<String>>(participant_id: S, language: impl Into<LanguageTag>) -> Self {
        Self {
            participant_id: participant_id.into(),
            language: language.into(),
        }
    }
}

/// Mutual-exclusion token deciding who may currently speak.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnLock {
    pub holder_id: String,
    #[serde(default)]
    pub utterance_text: String,
    #[serde(default)]
    pub utterance_final: bool,
    #[serde(default)]
    pub source_language: Option<LanguageTag>,
    /// Acquisition time, moved forward each time the holder renews the lock.
    pub acquired_at_ms: u64,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDocument {
    pub session_id: String,
    pub participants: Vec<Participant>,
    pub turn_lock: Option<TurnLock>,
    #[serde(default)]
    pub lock_epoch: u64,
    #[serde(default)]
    pub version: u64,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl SessionDocument {
    pub fn new<S: Into<String>>(session_id: S, participants: Vec<Participant>, now_ms: u64) -> Self {
        let mut document = Self {
            session_id: session_id.into(),
            participants: Vec::new(),
            turn_lock: None,
            lock_epoch: 0,
            version: 0,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        };
        for participant in participants {
            document.upsert_participant(participant);
        }
        document
    }

    pub fn participant(&self, participant_id: &str) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|participant| participant.participant_id == participant_id)
    }

    pub fn is_participant(&self, participant_id: &str) -> bool {
        self.participant(participant_id).is_some()
    }

    /// Inserts the participant, or replaces the language of an existing one.
    pub fn upsert_participant(&mut self, participant: Participant) -> bool {
        match self
            .participants
            .iter_mut()
            .find(|existing| existing.participant_id == participant.participant_id)
        {
            Some(existing) => {
                let changed = existing.language != participant.language;
                existing.language = participant.language;
                changed
            }
            None => {
                self.participants.push(participant);
                true
            }
        }
    }

    pub fn remove_participant(&mut self, participant_id: &str) -> bool {
        let before = self.participants.len();
        self.participants
            .retain(|participant| participant.participant_id != participant_id);
        before != self.participants.len()
    }

    /// Languages of everyone except `speaker_id`, de-duplicated in join order and
    /// excluding the language the speaker used.
    pub fn target_languages(&self, speaker_id: &str, source: &LanguageTag) -> Vec<LanguageTag> {
        let mut targets: Vec<LanguageTag> = Vec::new();
        for participant in &self.participants {
            if participant.participant_id == speaker_id {
                continue;
            }
            if participant.language.is_empty() || participant.language.same_language(source) {
                continue;
            }
            if targets
                .iter()
                .any(|existing| existing.same_language(&participant.language))
            {
                continue;
            }
            targets.push(participant.language.clone());
        }
        targets
    }

    pub fn lock_holder(&self) -> Option<&str> {
        self.turn_lock.as_ref().map(|lock| lock.holder_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> SessionDocument {
        SessionDocument::new(
            "room",
            vec![
                Participant::new("alice", "en-US"),
                Participant::new("bob", "ja-JP"),
                Participant::new("carol", "en-GB"),
                Participant::new("dave", "ko"),
                Participant::new("erin", "ja"),
            ],
            0,
        )
    }

    #[test]
    fn language_tag_normalizes_separator_and_primary() {
        let tag = LanguageTag::new(" zh_Hant_TW ");
        assert_eq!(tag.as_str(), "zh-Hant-TW");
        assert_eq!(tag.primary(), "zh");
        assert!(tag.same_language(&LanguageTag::new("ZH")));
    }

    #[test]
    fn targets_skip_speaker_source_language_and_duplicates() {
        let document = room();
        let targets = document.target_languages("alice", &LanguageTag::new("en-US"));
        assert_eq!(targets, vec![LanguageTag::new("ja-JP"), LanguageTag::new("ko")]);
    }

    #[test]
    fn targets_follow_detected_language_not_profile_language() {
        let document = room();
        let targets = document.target_languages("alice", &LanguageTag::new("ja"));
        assert_eq!(targets, vec![LanguageTag::new("en-GB"), LanguageTag::new("ko")]);
    }

    #[test]
    fn upsert_is_unique_by_participant_id() {
        let mut document = room();
        assert!(document.upsert_participant(Participant::new("bob", "fr")));
        assert!(!document.upsert_participant(Participant::new("bob", "fr")));
        assert_eq!(document.participants.len(), 5);
        assert_eq!(
            document.participant("bob").map(|p| p.language.as_str()),
            Some("fr")
        );
        assert!(document.remove_participant("bob"));
        assert!(!document.remove_participant("bob"));
    }
}
