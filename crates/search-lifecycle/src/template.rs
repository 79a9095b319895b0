//! Index template assembly.
//!
//! A physical index is created from two JSON documents merged together:
//! a shared base (common settings and analysis chain) and a per-type
//! overlay (mappings and type-specific settings). Configured language
//! codes are injected as stemmer filters into the analysis settings so
//! the catch-all field stems every configured language.

use std::fs;

use serde_json::{json, Map, Value};

use crate::error::LifecycleError;

/// Load one template document from disk.
pub fn load(path: &str) -> Result<Value, LifecycleError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| LifecycleError::Template(format!("{path}: {e}")))?;
    serde_json::from_str(&raw).map_err(|e| LifecycleError::Template(format!("{path}: {e}")))
}

/// Recursive object merge; the overlay wins on conflicts, arrays and
/// scalars are replaced wholesale.
pub fn merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Inject one stemmer filter per configured language into the analysis
/// settings, and register them on the `all_text` analyzer when present.
pub fn inject_languages(template: &mut Value, languages: &[String]) {
    if languages.is_empty() {
        return;
    }
    let filters = template
        .pointer_mut("/settings/analysis/filter")
        .and_then(Value::as_object_mut);
    if let Some(filters) = filters {
        for lang in languages {
            if lang.is_empty() {
                continue;
            }
            filters.insert(
                format!("{lang}_stemmer"),
                json!({"type": "stemmer", "language": lang}),
            );
        }
    } else if let Some(analysis) = template
        .pointer_mut("/settings/analysis")
        .and_then(Value::as_object_mut)
    {
        let mut filters = Map::new();
        for lang in languages {
            if lang.is_empty() {
                continue;
            }
            filters.insert(
                format!("{lang}_stemmer"),
                json!({"type": "stemmer", "language": lang}),
            );
        }
        analysis.insert("filter".to_string(), Value::Object(filters));
    }
    if let Some(chain) = template
        .pointer_mut("/settings/analysis/analyzer/all_text/filter")
        .and_then(Value::as_array_mut)
    {
        for lang in languages {
            if lang.is_empty() {
                continue;
            }
            let name = json!(format!("{lang}_stemmer"));
            if !chain.contains(&name) {
                chain.push(name);
            }
        }
    }
}

/// Full template for one physical index: base + overlay + languages.
pub fn assemble(
    base_path: &str,
    type_path: &str,
    languages: &[String],
) -> Result<Value, LifecycleError> {
    let mut template = load(base_path)?;
    let overlay = load(type_path)?;
    merge(&mut template, &overlay);
    inject_languages(&mut template, languages);
    Ok(template)
}
