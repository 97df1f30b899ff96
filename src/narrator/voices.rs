//! Role-to-voice resolution.
//!
//! Walks the configured binding table in order; the first binding whose
//! keyword the lower-cased role contains wins. The preferred voice is
//! matched by name substring against the device catalog, falling back to
//! the first enumerated voice, or `None` on an empty catalog (caller skips
//! speaking without error).

use crate::config::VoiceBinding;
use crate::narrator::device::VoiceInfo;

pub struct VoiceAssignment {
    bindings: Vec<VoiceBinding>,
}

impl VoiceAssignment {
    pub fn new(bindings: Vec<VoiceBinding>) -> Self {
        Self { bindings }
    }

    /// Deterministic for a fixed binding table and voice list.
    pub fn resolve(&self, role: &str, voices: &[VoiceInfo]) -> Option<VoiceInfo> {
        let role = role.to_lowercase();

        for binding in &self.bindings {
            if !role.contains(&binding.role_keyword.to_lowercase()) {
                continue;
            }
            if let Some(voice) = voices
                .iter()
                .find(|v| v.name.contains(&binding.preferred_voice))
            {
                return Some(voice.clone());
            }
            // First matching binding decides; an unavailable preference
            // falls through to the default, not to later bindings.
            break;
        }

        voices.first().cloned()
    }
}
