//! Cell candidates: one entry of an attachment batch.

use serde::{Deserialize, Serialize};

/// A network node reported by the attachment source.
///
/// A batch holds at most one primary (serving) entry; the rest are
/// neighbours seen at the same moment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellCandidate {
    /// Cell identifier (CI, CID or NCI depending on the radio technology).
    pub identifier: String,

    /// Location or tracking area code, when the radio reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,

    /// Signal strength in dBm.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<i32>,

    /// Whether the device is currently registered on this cell.
    #[serde(default)]
    pub is_primary: bool,
}

/// Returns the primary entry of a batch, if there is one.
pub fn primary(batch: &[CellCandidate]) -> Option<&CellCandidate> {
    batch.iter().find(|c| c.is_primary)
}
