//! Streamer discovery and selection

use crate::error::{ClientError, Result};

/// Result of applying one streamer list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOutcome {
    pub ids: Vec<String>,
    /// Set when the policy picked a streamer on its own
    pub auto_selected: Option<String>,
}

/// Streamers advertised by the rendezvous server and the current selection
#[derive(Debug, Clone, Default)]
pub struct StreamerDirectory {
    ids: Vec<String>,
    selected: Option<String>,
}

impl StreamerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the directory with a freshly received list
    ///
    /// A single entry is always auto-selected. With several entries, `preferred`
    /// is selected when present in the list; otherwise nothing is. A previous
    /// selection survives only while it is still advertised.
    pub fn on_streamer_list(&mut self, ids: Vec<String>, preferred: Option<&str>) -> DiscoveryOutcome {
        let auto_selected = match ids.as_slice() {
            [only] => Some(only.clone()),
            [] => None,
            _ => preferred
                .filter(|p| !p.is_empty())
                .and_then(|p| ids.iter().find(|id| id.as_str() == p).cloned()),
        };

        self.ids = ids;
        if auto_selected.is_some() {
            self.selected = auto_selected.clone();
        } else if let Some(current) = &self.selected {
            if !self.ids.contains(current) {
                self.selected = None;
            }
        }

        DiscoveryOutcome {
            ids: self.ids.clone(),
            auto_selected,
        }
    }

    /// Explicitly select an advertised streamer
    pub fn select(&mut self, id: &str) -> Result<()> {
        if !self.ids.iter().any(|known| known == id) {
            return Err(ClientError::UnknownStreamer(id.to_string()));
        }
        self.selected = Some(id.to_string());
        Ok(())
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.selected = None;
    }
}
