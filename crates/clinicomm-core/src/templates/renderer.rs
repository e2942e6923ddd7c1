//! Template Renderer - Substitutes `{{variable}}` placeholders
//!
//! Rendering is strict: every placeholder must have a value, otherwise the
//! whole render fails and lists each missing name. Nothing is ever left
//! half-substituted.

use clinicomm_common::types::VariableMap;
use clinicomm_storage::models::Template;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Variables every template may reference
pub const VARIABLE_CATALOG: &[&str] = &[
    "patientName",
    "patientEmail",
    "patientPhone",
    "appointmentDate",
    "appointmentTime",
    "clinicianName",
    "clinicianPhone",
    "confirmationCode",
    "price",
    "paymentLink",
    "videoRoomLink",
    "cancellationPolicy",
    "reschedulingPolicy",
];

/// Rendering failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("Missing template variables: {}", .0.join(", "))]
    MissingVariables(Vec<String>),
}

impl From<RenderError> for clinicomm_common::Error {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::MissingVariables(names) => clinicomm_common::Error::Render(names),
        }
    }
}

/// Rendered subject and body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedTemplate {
    pub subject: Option<String>,
    pub content: String,
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder pattern")
    })
}

/// Names of every placeholder used in `content`
pub fn placeholders(content: &str) -> BTreeSet<String> {
    placeholder_pattern()
        .captures_iter(content)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Whether a variable name belongs to the catalog
pub fn is_known_variable(name: &str) -> bool {
    VARIABLE_CATALOG.contains(&name)
}

/// Replace every placeholder in `content` with its value
pub fn render(content: &str, variables: &VariableMap) -> Result<String, RenderError> {
    let missing = missing_variables(content, variables);
    if !missing.is_empty() {
        return Err(RenderError::MissingVariables(missing.into_iter().collect()));
    }

    Ok(substitute(content, variables))
}

/// Render the subject (when present) and content of a template together.
///
/// Missing names from both parts are reported in a single error.
pub fn render_template(
    template: &Template,
    variables: &VariableMap,
) -> Result<RenderedTemplate, RenderError> {
    let mut missing = missing_variables(&template.content, variables);
    if let Some(subject) = &template.subject {
        missing.extend(missing_variables(subject, variables));
    }
    if !missing.is_empty() {
        return Err(RenderError::MissingVariables(missing.into_iter().collect()));
    }

    Ok(RenderedTemplate {
        subject: template
            .subject
            .as_deref()
            .map(|subject| substitute(subject, variables)),
        content: substitute(&template.content, variables),
    })
}

fn missing_variables(content: &str, variables: &VariableMap) -> BTreeSet<String> {
    placeholders(content)
        .into_iter()
        .filter(|name| !variables.contains_key(name))
        .collect()
}

fn substitute(content: &str, variables: &VariableMap) -> String {
    placeholder_pattern()
        .replace_all(content, |caps: &regex::Captures<'_>| {
            variables.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vars(pairs: &[(&str, &str)]) -> VariableMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_portuguese_reminder() {
        let content = "Olá {{patientName}}, sua consulta é em {{appointmentDate}}";
        let variables = vars(&[("patientName", "Carlos"), ("appointmentDate", "10/03/2025")]);

        let rendered = render(content, &variables).unwrap();
        assert_eq!(rendered, "Olá Carlos, sua consulta é em 10/03/2025");
        assert!(!rendered.contains("{{"));
        assert!(placeholders(&rendered).is_empty());
    }

    #[test]
    fn test_render_is_deterministic() {
        let content = "{{clinicianName}} confirmou {{ appointmentTime }} ({{confirmationCode}})";
        let variables = vars(&[
            ("clinicianName", "Dra. Ana"),
            ("appointmentTime", "14:30"),
            ("confirmationCode", "X1Y2"),
        ]);

        let first = render(content, &variables).unwrap();
        let second = render(content, &variables).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "Dra. Ana confirmou 14:30 (X1Y2)");
    }

    #[test]
    fn test_missing_variables_are_all_reported() {
        let content = "{{price}} {{patientName}} {{paymentLink}} {{price}}";
        let err = render(content, &vars(&[("patientName", "Carlos")])).unwrap_err();

        assert_eq!(
            err,
            RenderError::MissingVariables(vec!["paymentLink".into(), "price".into()])
        );
    }

    #[test]
    fn test_empty_value_counts_as_present() {
        let rendered = render("[{{videoRoomLink}}]", &vars(&[("videoRoomLink", "")])).unwrap();
        assert_eq!(rendered, "[]");
    }

    #[test]
    fn test_values_are_not_reinterpreted() {
        let rendered = render(
            "{{patientName}}",
            &vars(&[("patientName", "{{price}}")]),
        )
        .unwrap();
        assert_eq!(rendered, "{{price}}");
    }

    #[test]
    fn test_placeholders_tolerate_whitespace() {
        let names = placeholders("{{ patientName }} e {{patientPhone}}");
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["patientName".to_string(), "patientPhone".to_string()]
        );
    }

    #[test]
    fn test_catalog_lookup() {
        assert!(is_known_variable("reschedulingPolicy"));
        assert!(!is_known_variable("patient_name"));
    }
}
