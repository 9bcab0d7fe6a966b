//! Criteria predicate parsing.
//!
//! A subscription criteria string has the form
//! `<ResourceType>?<param>[:modifier]=<value>` with exactly one parameter.
//! Parsing resolves the parameter against a built-in parameter table so the
//! matcher never has to reinterpret the raw string.

use std::fmt;

use crate::error::{SubscriptionError, SubscriptionResult};

/// How a criterion value is compared with resource values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    /// Default comparison for the parameter type
    Eq,
    /// `:not` - at least one value present and none equal
    Ne,
    /// `:exact` - case-sensitive full string match
    Exact,
    /// `:contains` - case-insensitive substring match
    Contains,
}

impl Comparator {
    fn parse(modifier: Option<&str>) -> Option<Self> {
        match modifier {
            None => Some(Self::Eq),
            Some("not") => Some(Self::Ne),
            Some("exact") => Some(Self::Exact),
            Some("contains") => Some(Self::Contains),
            Some(_) => None,
        }
    }

    pub fn modifier(&self) -> Option<&'static str> {
        match self {
            Self::Eq => None,
            Self::Ne => Some("not"),
            Self::Exact => Some("exact"),
            Self::Contains => Some("contains"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Token,
    Reference,
    String,
}

/// A supported search parameter and the element paths it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchParam {
    pub name: &'static str,
    pub param_type: ParamType,
    /// Dotted element paths; arrays are flattened at every step
    pub paths: &'static [&'static str],
}

const HUMAN_TYPES: &[&str] = &["Patient", "Practitioner", "RelatedPerson", "Person"];

const fn param(
    name: &'static str,
    param_type: ParamType,
    paths: &'static [&'static str],
) -> SearchParam {
    SearchParam {
        name,
        param_type,
        paths,
    }
}

const PARAMETERS: &[SearchParam] = &[
    param("_id", ParamType::Token, &["id"]),
    param("code", ParamType::Token, &["code"]),
    param("category", ParamType::Token, &["category"]),
    param("status", ParamType::Token, &["status"]),
    param("identifier", ParamType::Token, &["identifier"]),
    param("gender", ParamType::Token, &["gender"]),
    param("subject", ParamType::Reference, &["subject"]),
    param("patient", ParamType::Reference, &["patient", "subject"]),
    param("encounter", ParamType::Reference, &["encounter", "context"]),
    param("performer", ParamType::Reference, &["performer", "performer.actor"]),
    param("name", ParamType::String, &["name"]),
    param("family", ParamType::String, &["name.family"]),
    param("given", ParamType::String, &["name.given"]),
];

/// Look up a search parameter for a resource type.
pub fn search_param(resource_type: &str, name: &str) -> Option<SearchParam> {
    let applies = match name {
        "gender" | "family" | "given" => HUMAN_TYPES.contains(&resource_type),
        "patient" => resource_type != "Patient",
        _ => true,
    };
    if !applies {
        return None;
    }
    PARAMETERS.iter().find(|p| p.name == name).copied()
}

/// Token criterion value (`system|code`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenValue {
    /// `None` = any system, `Some("")` = no system
    pub system: Option<String>,
    /// `None` = any code within `system`
    pub code: Option<String>,
}

impl TokenValue {
    pub fn parse(value: &str) -> Self {
        match value.split_once('|') {
            Some((system, code)) => Self {
                system: Some(system.to_string()),
                code: (!code.is_empty()).then(|| code.to_string()),
            },
            None => Self {
                system: None,
                code: Some(value.to_string()),
            },
        }
    }
}

/// Parsed criterion value, typed by the parameter it targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CriteriaValue {
    Token(TokenValue),
    /// Trailing `Type/id`, or a bare id
    Reference(String),
    /// Lowercased unless the comparator is `Exact`
    Text(String),
}

/// Query parameters that shape the response and never filter.
const RESULT_PARAMETERS: &[&str] = &["_format", "_pretty", "_summary", "_elements"];

/// A parsed, resource-type-scoped filter. Immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct CriteriaPredicate {
    pub resource_type: String,
    pub parameter_name: String,
    /// Percent-decoded value as written in the criteria
    pub parameter_value: String,
    pub comparator: Comparator,
    pub param: SearchParam,
    pub value: CriteriaValue,
}

impl CriteriaPredicate {
    /// Parse `<ResourceType>?<param>[:modifier]=<value>`.
    pub fn parse(criteria: &str) -> SubscriptionResult<Self> {
        let criteria = criteria.trim();
        let (resource_type, query) = criteria.split_once('?').ok_or_else(|| {
            SubscriptionError::validation(format!(
                "Invalid criteria '{criteria}': expected <ResourceType>?<param>=<value>"
            ))
        })?;

        if !is_resource_type_name(resource_type) {
            return Err(SubscriptionError::validation(format!(
                "Invalid resource type '{resource_type}' in criteria"
            )));
        }

        // Output controls such as `_format` do not filter anything.
        let pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
            .filter(|(k, _)| !RESULT_PARAMETERS.contains(&k.as_ref()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let (key, value) = match pairs.as_slice() {
            [single] => single.clone(),
            [] => {
                return Err(SubscriptionError::validation(format!(
                    "Criteria '{criteria}' has no search parameter"
                )));
            }
            _ => {
                return Err(SubscriptionError::validation(format!(
                    "Criteria '{criteria}' must have exactly one search parameter"
                )));
            }
        };

        let (name, modifier) = match key.split_once(':') {
            Some((name, modifier)) => (name, Some(modifier)),
            None => (key.as_str(), None),
        };
        if name.is_empty() {
            return Err(SubscriptionError::validation(format!(
                "Criteria '{criteria}' has an empty parameter name"
            )));
        }
        if value.is_empty() {
            return Err(SubscriptionError::validation(format!(
                "Criteria '{criteria}' has an empty value for '{name}'"
            )));
        }

        let comparator = Comparator::parse(modifier).ok_or_else(|| {
            SubscriptionError::validation(format!(
                "Unsupported modifier ':{}' on parameter '{name}'",
                modifier.unwrap_or_default()
            ))
        })?;
        let param = search_param(resource_type, name).ok_or_else(|| {
            SubscriptionError::validation(format!(
                "Unknown search parameter '{name}' for resource type {resource_type}"
            ))
        })?;

        let value_typed = match (param.param_type, comparator) {
            (ParamType::String, Comparator::Exact) => CriteriaValue::Text(value.clone()),
            (ParamType::String, _) => CriteriaValue::Text(value.to_lowercase()),
            (ParamType::Token, Comparator::Eq | Comparator::Ne) => {
                CriteriaValue::Token(TokenValue::parse(&value))
            }
            (ParamType::Reference, Comparator::Eq | Comparator::Ne) => {
                CriteriaValue::Reference(normalize_reference(&value))
            }
            (_, comparator) => {
                return Err(SubscriptionError::validation(format!(
                    "Modifier ':{}' is not supported on parameter '{name}'",
                    comparator.modifier().unwrap_or_default()
                )));
            }
        };

        Ok(Self {
            resource_type: resource_type.to_string(),
            parameter_name: name.to_string(),
            parameter_value: value,
            comparator,
            param,
            value: value_typed,
        })
    }
}

impl fmt::Display for CriteriaPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}?{}", self.resource_type, self.parameter_name)?;
        if let Some(modifier) = self.comparator.modifier() {
            write!(f, ":{modifier}")?;
        }
        write!(f, "={}", self.parameter_value)
    }
}

fn is_resource_type_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_alphanumeric())
}

/// Reduce a reference to its trailing `Type/id`, or keep a bare id.
pub fn normalize_reference(reference: &str) -> String {
    let trimmed = reference.trim_end_matches('/');
    let without_history = match trimmed.find("/_history/") {
        Some(pos) => &trimmed[..pos],
        None => trimmed,
    };
    let mut segments = without_history.rsplit('/');
    match (segments.next(), segments.next()) {
        (Some(id), Some(resource_type)) if is_resource_type_name(resource_type) => {
            format!("{resource_type}/{id}")
        }
        (Some(id), _) => id.to_string(),
        _ => without_history.to_string(),
    }
}
