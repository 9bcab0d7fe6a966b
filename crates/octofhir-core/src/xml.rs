//! FHIR JSON → FHIR XML encoder.
//!
//! Follows the FHIR JSON/XML mapping rules that matter for notification
//! payloads and `_format=xml` responses:
//! - primitives become `<name value="..."/>`, merged with their `_name` sibling
//! - arrays repeat the element
//! - element `id` and extension `url` are attributes
//! - nested resources (`contained`, `entry.resource`) are wrapped in an element
//!   named after their `resourceType`
//! - narrative `div` is emitted verbatim

use serde_json::{Map, Value};

use crate::error::{CoreError, Result};

const FHIR_NS: &str = "http://hl7.org/fhir";

/// Encode a FHIR JSON resource as an XML document string.
pub fn to_fhir_xml(resource: &Value) -> Result<String> {
    let object = resource
        .as_object()
        .ok_or_else(|| CoreError::invalid_resource("resource must be a JSON object"))?;
    let resource_type = object
        .get("resourceType")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::invalid_resource("resource is missing resourceType"))?;

    let mut out = String::with_capacity(256);
    write_resource(&mut out, resource_type, object, true);
    Ok(out)
}

fn write_resource(out: &mut String, resource_type: &str, object: &Map<String, Value>, root: bool) {
    out.push('<');
    out.push_str(resource_type);
    if root {
        out.push_str(" xmlns=\"");
        out.push_str(FHIR_NS);
        out.push('"');
    }
    out.push('>');
    // Resource-level `id` is an element, not an attribute.
    write_children(out, object, false);
    out.push_str("</");
    out.push_str(resource_type);
    out.push('>');
}

fn write_children(out: &mut String, object: &Map<String, Value>, id_is_attribute: bool) {
    for (key, value) in object {
        if key == "resourceType" || key.starts_with('_') {
            continue;
        }
        if id_is_attribute && key == "id" {
            continue;
        }
        if key == "url" && object.contains_key("url") && is_extension_like(object) {
            continue;
        }
        let companion = object.get(&format!("_{key}"));
        write_element(out, key, value, companion);
    }

    // `_name` companions whose primitive value is absent (extension-only primitives).
    for (key, companion) in object {
        if let Some(name) = key.strip_prefix('_') {
            if !object.contains_key(name) {
                write_element(out, name, &Value::Null, Some(companion));
            }
        }
    }
}

fn is_extension_like(object: &Map<String, Value>) -> bool {
    object.keys().any(|k| k.starts_with("value") || k == "extension")
}

fn write_element(out: &mut String, name: &str, value: &Value, companion: Option<&Value>) {
    match value {
        Value::Array(items) => {
            let companions = companion.and_then(Value::as_array);
            for (idx, item) in items.iter().enumerate() {
                let item_companion = companions.and_then(|c| c.get(idx)).filter(|c| !c.is_null());
                write_element(out, name, item, item_companion);
            }
        }
        Value::Object(object) => {
            if name == "div" {
                return;
            }
            if let Some(resource_type) = object.get("resourceType").and_then(Value::as_str) {
                open_tag(out, name, &[]);
                write_resource(out, resource_type, object, false);
                close_tag(out, name);
                return;
            }
            let mut attrs = Vec::new();
            if let Some(id) = object.get("id").and_then(Value::as_str) {
                attrs.push(("id", id.to_string()));
            }
            if is_extension_like(object) {
                if let Some(url) = object.get("url").and_then(Value::as_str) {
                    attrs.push(("url", url.to_string()));
                }
            }
            open_tag(out, name, &attrs);
            write_children(out, object, true);
            close_tag(out, name);
        }
        Value::String(s) if name == "div" => {
            out.push_str(s);
        }
        Value::Null => {
            if let Some(Value::Object(meta)) = companion {
                write_primitive(out, name, None, meta);
            }
        }
        primitive => {
            let text = match primitive {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            match companion {
                Some(Value::Object(meta)) => write_primitive(out, name, Some(&text), meta),
                _ => {
                    out.push('<');
                    out.push_str(name);
                    push_attr(out, "value", &text);
                    out.push_str("/>");
                }
            }
        }
    }
}

fn write_primitive(out: &mut String, name: &str, value: Option<&str>, meta: &Map<String, Value>) {
    out.push('<');
    out.push_str(name);
    if let Some(id) = meta.get("id").and_then(Value::as_str) {
        push_attr(out, "id", id);
    }
    if let Some(v) = value {
        push_attr(out, "value", v);
    }
    out.push('>');
    write_children(out, meta, true);
    close_tag(out, name);
}

fn open_tag(out: &mut String, name: &str, attrs: &[(&str, String)]) {
    out.push('<');
    out.push_str(name);
    for (attr, value) in attrs {
        push_attr(out, attr, value);
    }
    out.push('>');
}

fn close_tag(out: &mut String, name: &str) {
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

fn push_attr(out: &mut String, name: &str, value: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("=\"");
    escape_into(out, value);
    out.push('"');
}

fn escape_into(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(ch),
        }
    }
}
