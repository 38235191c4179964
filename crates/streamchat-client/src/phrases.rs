//! Random chat lines for the demo client.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use streamchat_rpc::proto::Message;
use streamchat_rpc::MessageProducer;

const NAMES: &[&str] = &["Alice", "Bob", "Carol", "Dave", "Erin", "Frank", "Grace", "Heidi"];

const DRINKS: &[&str] = &[
    "beer", "coffee", "tea", "lemonade", "cider", "water", "juice", "cocoa",
];

/// Produces "<Name> wants to drink <drink>" forever, or up to a limit.
#[derive(Debug)]
pub struct PhraseProducer {
    rng: StdRng,
    remaining: Option<usize>,
}

impl PhraseProducer {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            remaining: None,
        }
    }

    /// Deterministic sequence for a given seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            remaining: None,
        }
    }

    /// Stops after `count` messages.
    pub fn limit(mut self, count: usize) -> Self {
        self.remaining = Some(count);
        self
    }

    fn phrase(&mut self) -> String {
        let name = NAMES.choose(&mut self.rng).copied().unwrap_or("Someone");
        let drink = DRINKS.choose(&mut self.rng).copied().unwrap_or("water");
        format!("{name} wants to drink {drink}")
    }
}

impl Default for PhraseProducer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageProducer for PhraseProducer {
    fn next_message(&mut self) -> Option<Message> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }
        Some(Message {
            body: self.phrase(),
        })
    }
}
