//! Model name handling: aliases and picking an available model.

/// Short names accepted on the command line and their API model ids.
pub const MODEL_ALIASES: &[(&str, &str)] = &[
    ("gemini-3-flash", "gemini-3-flash-preview"),
    ("gemini-3-pro", "gemini-3-pro-preview"),
    ("gemini-3.1-pro", "gemini-3.1-pro-preview"),
    ("gemini-3-pro-image", "gemini-3-pro-image-preview"),
];

/// Fallback order when the requested model is not served.
pub const PREFERRED_MODELS: &[&str] = &[
    "gemini-3-flash-preview",
    "gemini-3-pro-preview",
    "gemini-3.1-pro-preview",
    "gemini-3-pro-image-preview",
    "gemini-2.0-flash",
    "gemini-2.0-flash-lite",
    "gemini-1.5-flash",
];

/// Strip a `models/` prefix and expand known aliases.
pub fn normalize_model_name(name: &str) -> String {
    let base = name.trim();
    let base = base.strip_prefix("models/").unwrap_or(base);
    MODEL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == base)
        .map(|(_, full)| (*full).to_string())
        .unwrap_or_else(|| base.to_string())
}

/// Choose a model from the ones the provider lists.
///
/// The requested model wins when listed; otherwise the first preferred model
/// that is listed; otherwise the first listed model. An empty listing keeps
/// the requested name.
pub fn pick_model(requested: &str, available: &[String]) -> String {
    let requested = normalize_model_name(requested);
    if available.is_empty() || available.iter().any(|m| *m == requested) {
        return requested;
    }
    PREFERRED_MODELS
        .iter()
        .find(|preferred| available.iter().any(|m| m == *preferred))
        .map(|m| (*m).to_string())
        .unwrap_or_else(|| available[0].clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_and_prefix() {
        assert_eq!(normalize_model_name("gemini-3-flash"), "gemini-3-flash-preview");
        assert_eq!(normalize_model_name("models/gemini-2.0-flash"), "gemini-2.0-flash");
        assert_eq!(normalize_model_name(" custom-model "), "custom-model");
    }

    #[test]
    fn pick_prefers_requested_then_preference_order() {
        let available = vec!["gemini-1.5-flash".to_string(), "gemini-2.0-flash".to_string()];
        assert_eq!(pick_model("gemini-1.5-flash", &available), "gemini-1.5-flash");
        assert_eq!(pick_model("gemini-3-flash", &available), "gemini-2.0-flash");

        let odd = vec!["text-bison".to_string()];
        assert_eq!(pick_model("gemini-3-flash", &odd), "text-bison");
        assert_eq!(pick_model("gemini-3-flash", &[]), "gemini-3-flash-preview");
    }
}
