//! Per-client `/stream` query parameters.

use serde::Deserialize;

fn bool_flag(v: &str) -> bool {
    matches!(v, "1" | "true" | "yes" | "on")
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct StreamQuery {
    pub key: Option<String>,
    #[serde(default, deserialize_with = "de_bool_flag")]
    pub extra_headers: bool,
    #[serde(default, deserialize_with = "de_bool_flag")]
    pub advance_headers: bool,
    #[serde(default, deserialize_with = "de_bool_flag")]
    pub dual_final_frames: bool,
    #[serde(default, deserialize_with = "de_bool_flag")]
    pub zero_data: bool,
    pub action: Option<String>,
}

fn de_bool_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.map(|s| bool_flag(&s)).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::bool_flag;

    #[test]
    fn recognizes_common_truthy_spellings() {
        for v in ["1", "true", "yes", "on"] {
            assert!(bool_flag(v));
        }
        assert!(!bool_flag("0"));
        assert!(!bool_flag(""));
    }
}
