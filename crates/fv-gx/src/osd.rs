//! On-screen display messages

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Oldest messages are dropped beyond this
const MAX_MESSAGES: usize = 16;

#[derive(Debug, Clone)]
pub struct OsdMessage {
    pub text: String,
    pub expires: Instant,
}

/// Timed text overlay shown on top of each presented frame
#[derive(Debug, Default)]
pub struct OnScreenDisplay {
    messages: VecDeque<OsdMessage>,
}

impl OnScreenDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Show `text` for `milliseconds`
    pub fn add_message(&mut self, text: &str, milliseconds: u32) {
        self.add_message_at(text, milliseconds, Instant::now());
    }

    fn add_message_at(&mut self, text: &str, milliseconds: u32, now: Instant) {
        if self.messages.len() == MAX_MESSAGES {
            self.messages.pop_front();
        }
        tracing::info!(target: "osd", "{}", text);
        self.messages.push_back(OsdMessage {
            text: text.to_string(),
            expires: now + Duration::from_millis(milliseconds as u64),
        });
    }

    /// Drop expired messages and return what is still visible at `now`
    pub fn visible(&mut self, now: Instant) -> Vec<&str> {
        self.messages.retain(|m| m.expires > now);
        self.messages.iter().map(|m| m.text.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_expire() {
        let mut osd = OnScreenDisplay::new();
        let start = Instant::now();
        osd.add_message_at("short", 100, start);
        osd.add_message_at("long", 5000, start);

        assert_eq!(osd.visible(start), vec!["short", "long"]);
        assert_eq!(osd.visible(start + Duration::from_millis(200)), vec!["long"]);
        assert!(osd.visible(start + Duration::from_secs(6)).is_empty());
    }

    #[test]
    fn test_message_limit() {
        let mut osd = OnScreenDisplay::new();
        let start = Instant::now();
        for i in 0..MAX_MESSAGES + 4 {
            osd.add_message_at(&format!("msg {}", i), 1000, start);
        }
        assert_eq!(osd.len(), MAX_MESSAGES);
        assert_eq!(osd.visible(start)[0], "msg 4");
    }
}
