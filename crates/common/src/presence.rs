// Typed view of the presence payload grid clients publish through awareness.

use serde::{Deserialize, Serialize};

/// Presence state of one grid editor.
///
/// The relay never interprets presence while relaying; this view exists for
/// introspection. Unknown fields are ignored so newer clients still parse.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellPresence {
    /// Display name.
    pub name: String,
    /// Hex color assigned to this editor (e.g. "#e06c75").
    #[serde(default)]
    pub color: Option<String>,
    /// Key of the cell currently being edited, `None` when idle.
    #[serde(default, rename = "cellKey")]
    pub cell_key: Option<String>,
}

impl CellPresence {
    /// Returns `None` if the payload is not JSON or lacks `name`.
    pub fn from_json(raw: &str) -> Option<Self> {
        serde_json::from_str(raw).ok()
    }
}
