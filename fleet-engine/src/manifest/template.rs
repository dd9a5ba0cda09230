//! `{{ name }}` placeholder substitution for templates whose content embeds
//! values only known when the registry is built.

use crate::utils::errors::ConfigError;
use std::collections::BTreeMap;

/// Replace every `{{ key }}` in `text` with `params[key]`. An unterminated
/// `{{` is kept literally; a placeholder without a value is an error.
pub fn render(
    template: &str,
    text: &str,
    params: &BTreeMap<String, String>,
) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        let key = rest[start + 2..start + 2 + len].trim();
        let value = params.get(key).ok_or_else(|| ConfigError::UnresolvedPlaceholder {
            template: template.to_string(),
            placeholder: key.to_string(),
        })?;
        out.push_str(&rest[..start]);
        out.push_str(value);
        rest = &rest[start + 2 + len + 2..];
    }

    out.push_str(rest);
    Ok(out)
}
