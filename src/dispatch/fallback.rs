//! Generated replies used when the AI processor fails
//!
//! Lookup falls back from the requested language to English, then from the
//! requested persona to `Persona::Neutral`, so the built-in table always
//! has an answer.

use crate::persona::{Language, Persona};
use std::collections::HashMap;

/// Fallback replies keyed by persona and language
#[derive(Clone, Debug)]
pub struct FallbackResponses {
    table: HashMap<(Persona, Language), Vec<String>>,
}

impl Default for FallbackResponses {
    fn default() -> Self {
        Self::builtin()
    }
}

impl FallbackResponses {
    /// Empty table; `pick` returns `None` until entries are added
    pub fn empty() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Built-in replies for every persona
    pub fn builtin() -> Self {
        use Language::*;
        use Persona::*;

        let mut responses = Self::empty();
        responses
            .insert(
                Neutral,
                English,
                &[
                    "Sorry, I couldn't get an answer just now. Please try again.",
                    "Something went wrong on my side. Could you ask that again?",
                ],
            )
            .insert(
                Neutral,
                Spanish,
                &["Lo siento, no pude obtener una respuesta. Inténtalo de nuevo."],
            )
            .insert(
                Neutral,
                French,
                &["Désolé, je n'ai pas pu obtenir de réponse. Veuillez réessayer."],
            )
            .insert(
                Neutral,
                German,
                &["Entschuldigung, ich konnte gerade keine Antwort finden. Bitte versuche es erneut."],
            )
            .insert(
                Friendly,
                English,
                &[
                    "Oops, my thoughts got tangled! Mind asking me again?",
                    "Hmm, I lost my train of thought there. Try me once more?",
                ],
            )
            .insert(
                Friendly,
                Spanish,
                &["¡Ups, me he liado! ¿Me lo preguntas otra vez?"],
            )
            .insert(
                Butler,
                English,
                &[
                    "My apologies, I am unable to attend to that at present.",
                    "I beg your pardon, the answer eludes me for the moment.",
                ],
            )
            .insert(
                Butler,
                French,
                &["Toutes mes excuses, je ne puis répondre pour le moment."],
            )
            .insert(
                Robot,
                English,
                &["ERROR. RESPONSE UNAVAILABLE. PLEASE REPEAT QUERY."],
            )
            .insert(
                Robot,
                German,
                &["FEHLER. ANTWORT NICHT VERFÜGBAR. BITTE WIEDERHOLEN."],
            );
        responses
    }

    /// Add or replace the replies for one persona/language pair
    pub fn insert(&mut self, persona: Persona, language: Language, replies: &[&str]) -> &mut Self {
        let replies: Vec<String> = replies.iter().map(|r| r.to_string()).collect();
        if replies.is_empty() {
            self.table.remove(&(persona, language));
        } else {
            self.table.insert((persona, language), replies);
        }
        self
    }

    /// Choose a reply, rotating through the set with `seed`
    pub fn pick(&self, persona: Persona, language: Language, seed: u64) -> Option<&str> {
        let candidates = [
            (persona, language),
            (persona, Language::English),
            (Persona::Neutral, language),
            (Persona::Neutral, Language::English),
        ];
        candidates
            .iter()
            .find_map(|key| self.table.get(key))
            .map(|replies| replies[(seed % replies.len() as u64) as usize].as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_persona_and_language_has_a_fallback() {
        let responses = FallbackResponses::builtin();
        for persona in Persona::ALL {
            for language in Language::ALL {
                let reply = responses.pick(persona, language, 0);
                assert!(reply.is_some(), "{} / {:?} has no fallback", persona, language);
                assert!(!reply.unwrap().is_empty());
            }
        }
    }

    #[test]
    fn test_fallbacks_vary_by_persona() {
        let responses = FallbackResponses::builtin();
        let neutral = responses.pick(Persona::Neutral, Language::English, 0);
        let robot = responses.pick(Persona::Robot, Language::English, 0);
        assert_ne!(neutral, robot);
    }

    #[test]
    fn test_language_falls_back_to_english_for_persona() {
        let responses = FallbackResponses::builtin();
        let reply = responses.pick(Persona::Robot, Language::French, 0).unwrap();
        assert!(reply.starts_with("ERROR"));
    }

    #[test]
    fn test_localized_reply() {
        let responses = FallbackResponses::builtin();
        let reply = responses.pick(Persona::Neutral, Language::Spanish, 0).unwrap();
        assert!(reply.starts_with("Lo siento"));
    }

    #[test]
    fn test_seed_rotates_deterministically() {
        let responses = FallbackResponses::builtin();
        let a = responses.pick(Persona::Friendly, Language::English, 0);
        let b = responses.pick(Persona::Friendly, Language::English, 1);
        let c = responses.pick(Persona::Friendly, Language::English, 2);
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_empty_table_has_no_reply() {
        let mut responses = FallbackResponses::empty();
        assert!(responses.pick(Persona::Neutral, Language::English, 0).is_none());

        responses.insert(Persona::Neutral, Language::English, &["fallback"]);
        assert_eq!(
            responses.pick(Persona::Butler, Language::German, 7),
            Some("fallback")
        );
    }
}
