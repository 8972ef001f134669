use serde::{Deserialize, Serialize};

/// Identifiers with this prefix are defect IDs and win over generic ones.
pub const DEFECT_ID_PREFIX: &str = "DF";

/// Identifier used when a producer sent a title but no identifier.
pub const UNKNOWN_ID: &str = "Unknown";

/// Context update as sent by the browser extension, a marker file or the
/// window-title bridge. Any field may be missing; empty strings count as
/// missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextPayload {
    #[serde(alias = "primary_id")]
    pub defect_id: Option<String>,
    #[serde(alias = "secondary_id")]
    pub plm_id: Option<String>,
    #[serde(alias = "raw_title")]
    pub title: Option<String>,
    /// Where the update came from (page URL or producer name)
    #[serde(alias = "source")]
    pub url: Option<String>,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

pub(crate) fn has_defect_prefix(id: &str) -> bool {
    id.get(..DEFECT_ID_PREFIX.len())
        .map(|head| head.eq_ignore_ascii_case(DEFECT_ID_PREFIX))
        .unwrap_or(false)
}

impl ContextPayload {
    pub fn title(&self) -> Option<&str> {
        present(&self.title)
    }

    pub fn source(&self) -> Option<&str> {
        present(&self.url)
    }

    /// No identifiers and no title: the producer has nothing to route to.
    pub fn is_empty(&self) -> bool {
        present(&self.defect_id).is_none() && present(&self.plm_id).is_none() && self.title().is_none()
    }

    /// Pick `(primary, secondary)` identifiers.
    ///
    /// Candidates are considered in `defect_id`, `plm_id` order. The first one
    /// carrying [`DEFECT_ID_PREFIX`] becomes primary, otherwise the first one
    /// present does. Without any identifier the primary is [`UNKNOWN_ID`].
    pub fn select_ids(&self) -> (String, Option<String>) {
        let candidates: Vec<&str> = [present(&self.defect_id), present(&self.plm_id)]
            .into_iter()
            .flatten()
            .collect();

        let primary_idx = candidates
            .iter()
            .position(|id| has_defect_prefix(id))
            .unwrap_or(0);

        match candidates.get(primary_idx) {
            Some(primary) => {
                let secondary = candidates
                    .iter()
                    .enumerate()
                    .find(|(idx, _)| *idx != primary_idx)
                    .map(|(_, id)| id.to_string());
                (primary.to_string(), secondary)
            }
            None => (UNKNOWN_ID.to_string(), None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(defect: Option<&str>, plm: Option<&str>, title: Option<&str>) -> ContextPayload {
        ContextPayload {
            defect_id: defect.map(String::from),
            plm_id: plm.map(String::from),
            title: title.map(String::from),
            url: None,
        }
    }

    #[test]
    fn test_defect_prefix_wins() {
        let p = payload(None, Some("DF200"), None);
        assert_eq!(p.select_ids(), ("DF200".to_string(), None));

        let p = payload(Some("P12345-0001"), Some("df7"), None);
        assert_eq!(p.select_ids(), ("df7".to_string(), Some("P12345-0001".to_string())));
    }

    #[test]
    fn test_defect_field_preferred_without_prefix() {
        let p = payload(Some("K-1"), Some("P12345-0001"), None);
        assert_eq!(p.select_ids(), ("K-1".to_string(), Some("P12345-0001".to_string())));
    }

    #[test]
    fn test_placeholder_when_no_ids() {
        let p = payload(Some("  "), None, Some("Title"));
        assert_eq!(p.select_ids(), (UNKNOWN_ID.to_string(), None));
        assert!(!p.is_empty());
    }

    #[test]
    fn test_empty_payload() {
        assert!(ContextPayload::default().is_empty());
        assert!(payload(Some(""), Some(" "), Some("")).is_empty());
    }

    #[test]
    fn test_deserialize_partial_json() {
        let p: ContextPayload =
            serde_json::from_str(r#"{"plm_id": "P1", "source": "http://x"}"#).unwrap();
        assert_eq!(p.plm_id.as_deref(), Some("P1"));
        assert_eq!(p.source(), Some("http://x"));
        assert!(p.defect_id.is_none());
    }

    #[test]
    fn test_generic_field_names_accepted() {
        let p: ContextPayload =
            serde_json::from_str(r#"{"primary_id": "DF9", "secondary_id": "P9", "raw_title": "Gear"}"#).unwrap();
        assert_eq!(p.select_ids(), ("DF9".to_string(), Some("P9".to_string())));
        assert_eq!(p.title(), Some("Gear"));
    }
}
