//! Predicate evaluation and candidate matching.
//!
//! Evaluation is pure: it reads the resource and the predicate and never
//! mutates either.

use std::sync::Arc;

use serde_json::Value;

use crate::criteria::{
    Comparator, CriteriaPredicate, CriteriaValue, TokenValue, normalize_reference,
};
use crate::registry::SubscriptionRegistry;
use crate::types::SubscriptionRecord;

/// Finds active subscriptions whose criteria match a written resource.
#[derive(Clone)]
pub struct Matcher {
    registry: Arc<SubscriptionRegistry>,
}

impl Matcher {
    /// Create a matcher over `registry`.
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self { registry }
    }

    /// Candidates come from the registry's type index; only those are evaluated.
    pub fn find_matches(&self, resource_type: &str, resource: &Value) -> Vec<Arc<SubscriptionRecord>> {
        self.registry
            .active_for(resource_type)
            .into_iter()
            .filter(|record| matches(&record.criteria, resource))
            .collect()
    }
}

/// Whether `resource` satisfies `predicate`.
///
/// A resource of another type, or one with no value for the parameter, never
/// matches (for `:not` as well).
pub fn matches(predicate: &CriteriaPredicate, resource: &Value) -> bool {
    let resource_type = resource.get("resourceType").and_then(Value::as_str);
    if resource_type != Some(predicate.resource_type.as_str()) {
        return false;
    }

    let values: Vec<&Value> = predicate
        .param
        .paths
        .iter()
        .flat_map(|path| collect_path(resource, path))
        .collect();
    if values.is_empty() {
        return false;
    }

    let any_equal = values
        .iter()
        .any(|value| value_matches(&predicate.value, predicate.comparator, value));
    match predicate.comparator {
        Comparator::Ne => !any_equal,
        _ => any_equal,
    }
}

/// Walk a dotted path, flattening arrays at every step.
fn collect_path<'a>(resource: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut current = vec![resource];
    for segment in path.split('.') {
        let mut next = Vec::new();
        for value in current {
            match value.get(segment) {
                Some(Value::Array(items)) => next.extend(items.iter().filter(|v| !v.is_null())),
                Some(Value::Null) | None => {}
                Some(found) => next.push(found),
            }
        }
        if next.is_empty() {
            return next;
        }
        current = next;
    }
    current
}

/// Positive comparison of one element; `Ne` is negated by the caller.
fn value_matches(criterion: &CriteriaValue, comparator: Comparator, value: &Value) -> bool {
    match criterion {
        CriteriaValue::Token(token) => token_matches(token, value),
        CriteriaValue::Reference(reference) => reference_matches(reference, value),
        CriteriaValue::Text(text) => string_candidates(value)
            .into_iter()
            .any(|candidate| text_matches(text, comparator, candidate)),
    }
}

fn token_matches(token: &TokenValue, value: &Value) -> bool {
    match value {
        // primitive code / string / id
        Value::String(code) => token.system.as_deref().is_none_or(str::is_empty)
            && token.code.as_deref() == Some(code.as_str()),
        Value::Bool(b) => {
            token.system.is_none() && token.code.as_deref() == Some(if *b { "true" } else { "false" })
        }
        Value::Object(object) => {
            // CodeableConcept: any coding
            if let Some(Value::Array(codings)) = object.get("coding") {
                return codings.iter().any(|coding| token_matches(token, coding));
            }
            let code = object
                .get("code")
                .or_else(|| object.get("value"))
                .and_then(Value::as_str);
            let system = object.get("system").and_then(Value::as_str);
            system_matches(token.system.as_deref(), system)
                && match token.code.as_deref() {
                    None => true,
                    Some(expected) => code == Some(expected),
                }
        }
        _ => false,
    }
}

fn system_matches(expected: Option<&str>, actual: Option<&str>) -> bool {
    match expected {
        None => true,
        Some("") => actual.is_none_or(str::is_empty),
        Some(system) => actual == Some(system),
    }
}

fn reference_matches(expected: &str, value: &Value) -> bool {
    let reference = match value {
        Value::Object(object) => object.get("reference").and_then(Value::as_str),
        Value::String(s) => Some(s.as_str()),
        _ => None,
    };
    let Some(reference) = reference else {
        return false;
    };
    let actual = normalize_reference(reference);
    if expected.contains('/') {
        actual == expected
    } else {
        actual.rsplit('/').next() == Some(expected)
    }
}

/// Strings a string parameter compares against; HumanName expands to its parts.
fn string_candidates(value: &Value) -> Vec<&str> {
    match value {
        Value::String(s) => vec![s.as_str()],
        Value::Object(object) => ["family", "given", "text", "prefix", "suffix"]
            .iter()
            .filter_map(|key| object.get(*key))
            .flat_map(|part| match part {
                Value::String(s) => vec![s.as_str()],
                Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                _ => Vec::new(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn text_matches(expected: &str, comparator: Comparator, candidate: &str) -> bool {
    match comparator {
        Comparator::Exact => candidate == expected,
        Comparator::Contains => candidate.to_lowercase().contains(expected),
        Comparator::Eq | Comparator::Ne => candidate.to_lowercase().starts_with(expected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChannelDescriptor, ChannelType, PayloadFormat, SubscriptionStatus};
    use serde_json::json;

    fn predicate(criteria: &str) -> CriteriaPredicate {
        CriteriaPredicate::parse(criteria).unwrap()
    }

    fn observation(system: &str, code: &str) -> Value {
        json!({
            "resourceType": "Observation",
            "status": "final",
            "code": {"coding": [{"system": system, "code": code}]},
            "subject": {"reference": "Patient/123"}
        })
    }

    #[test]
    fn token_on_codeable_concept() {
        let p = predicate("Observation?code=SNOMED-CT|82313006");
        assert!(matches(&p, &observation("SNOMED-CT", "82313006")));
        assert!(!matches(&p, &observation("SNOMED-CT", "8231")));
        assert!(!matches(&p, &observation("http://loinc.org", "82313006")));

        let any_system = predicate("Observation?code=82313006");
        assert!(matches(&any_system, &observation("http://loinc.org", "82313006")));

        let any_code = predicate("Observation?code=SNOMED-CT|");
        assert!(matches(&any_code, &observation("SNOMED-CT", "1")));
    }

    #[test]
    fn no_system_token() {
        let p = predicate("Observation?code=|abc");
        let mut obs = observation("x", "abc");
        assert!(!matches(&p, &obs));
        obs["code"]["coding"][0]
            .as_object_mut()
            .unwrap()
            .remove("system");
        assert!(matches(&p, &obs));
    }

    #[test]
    fn type_mismatch_short_circuits() {
        let p = predicate("Observation?code=82313006");
        let mut condition = observation("SNOMED-CT", "82313006");
        condition["resourceType"] = json!("Condition");
        assert!(!matches(&p, &condition));
    }

    #[test]
    fn missing_value_never_matches() {
        let p = predicate("Observation?category=vital-signs");
        assert!(!matches(&p, &observation("a", "b")));
        let not = predicate("Observation?category:not=vital-signs");
        assert!(!matches(&not, &observation("a", "b")));
    }

    #[test]
    fn not_modifier() {
        let p = predicate("Observation?status:not=final");
        assert!(!matches(&p, &observation("a", "b")));
        let mut amended = observation("a", "b");
        amended["status"] = json!("amended");
        assert!(matches(&p, &amended));
    }

    #[test]
    fn references() {
        assert!(matches(
            &predicate("Observation?subject=Patient/123"),
            &observation("a", "b")
        ));
        assert!(matches(
            &predicate("Observation?patient=123"),
            &observation("a", "b")
        ));
        assert!(matches(
            &predicate("Observation?subject=http://example.org/fhir/Patient/123"),
            &observation("a", "b")
        ));
        assert!(!matches(
            &predicate("Observation?subject=Patient/999"),
            &observation("a", "b")
        ));
    }

    #[test]
    fn strings_and_human_names() {
        let patient = json!({
            "resourceType": "Patient",
            "gender": "male",
            "identifier": [{"system": "urn:mrn", "value": "12345"}],
            "name": [{"family": "Chalmers", "given": ["Peter", "James"]}]
        });
        assert!(matches(&predicate("Patient?name=chal"), &patient));
        assert!(matches(&predicate("Patient?given=jam"), &patient));
        assert!(matches(&predicate("Patient?family:exact=Chalmers"), &patient));
        assert!(!matches(&predicate("Patient?family:exact=chalmers"), &patient));
        assert!(matches(&predicate("Patient?name:contains=ALME"), &patient));
        assert!(matches(&predicate("Patient?gender=male"), &patient));
        assert!(matches(&predicate("Patient?identifier=urn:mrn|12345"), &patient));
        assert!(!matches(&predicate("Patient?identifier=other|12345"), &patient));
    }

    #[test]
    fn id_parameter() {
        let mut obs = observation("a", "b");
        obs["id"] = json!("42");
        assert!(matches(&predicate("Observation?_id=42"), &obs));
    }

    #[test]
    fn find_matches_uses_registry_and_is_idempotent() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let channel = ChannelDescriptor {
            channel_type: ChannelType::WebSocket,
            endpoint: String::new(),
            payload_format: PayloadFormat::IdOnly,
            headers: Vec::new(),
        };
        for (id, criteria) in [
            ("a", "Observation?code=82313006"),
            ("b", "Observation?code=SNOMED-CT|82313006"),
            ("c", "Observation?code=8231"),
            ("d", "Patient?gender=male"),
        ] {
            registry
                .register(SubscriptionRecord::new(id, predicate(criteria), channel.clone()))
                .unwrap();
        }
        registry
            .update_status("b", SubscriptionStatus::Error, None)
            .unwrap();

        let matcher = Matcher::new(registry);
        let obs = observation("SNOMED-CT", "82313006");
        let mut first: Vec<String> = matcher
            .find_matches("Observation", &obs)
            .iter()
            .map(|r| r.id.clone())
            .collect();
        first.sort();
        assert_eq!(first, vec!["a".to_string()]);

        let mut second: Vec<String> = matcher
            .find_matches("Observation", &obs)
            .iter()
            .map(|r| r.id.clone())
            .collect();
        second.sort();
        assert_eq!(first, second);
    }
}
