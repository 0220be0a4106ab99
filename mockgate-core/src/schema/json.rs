//! JSON view of dynamic messages.
//!
//! Serialization and binding go through prost-reflect's protobuf JSON
//! mapping. On top of it a few fixed choices that stored case bodies depend
//! on: 64-bit integers are strings, map keys are emitted in sorted order,
//! and `float` fields render in their shortest decimal form.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use prost_reflect::{
    DeserializeOptions, DynamicMessage, EnumDescriptor, FieldDescriptor, MessageDescriptor,
    ReflectMessage,
    SerializeOptions,
};
use rand::Rng;
use serde_json::{Map, Number, Value as Json};

use super::CodecError;
use super::shape::{FieldShape, ScalarKind};

/// Nested messages deeper than this render as `null` in templates.
const TEMPLATE_MAX_DEPTH: usize = 4;

/// Rendering switches for [`to_json`] and [`template`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonOptions {
    /// Render enum values as numbers instead of names.
    pub enums_as_ints: bool,
    /// Render fields without presence even when unset.
    pub emit_defaults: bool,
    /// Replace zero scalar values with random ones (templates only).
    pub random_defaults: bool,
    /// Key objects by proto field name rather than lowerCamel JSON name.
    pub proto_names: bool,
}

impl Default for JsonOptions {
    fn default() -> Self {
        Self {
            enums_as_ints: false,
            emit_defaults: false,
            random_defaults: false,
            proto_names: true,
        }
    }
}

impl JsonOptions {
    /// Options used to render request payloads for rule evaluation.
    pub fn for_matching(enums_as_ints: bool) -> Self {
        Self {
            enums_as_ints,
            emit_defaults: true,
            random_defaults: false,
            proto_names: true,
        }
    }

    fn serialize_options(&self) -> SerializeOptions {
        SerializeOptions::new()
            .stringify_64_bit_integers(true)
            .use_enum_numbers(self.enums_as_ints)
            .use_proto_field_name(self.proto_names)
            .skip_default_fields(!self.emit_defaults)
    }
}

/// Render a message as a JSON object.
pub fn to_json(message: &DynamicMessage, opts: &JsonOptions) -> Result<Json, CodecError> {
    let mut json =
        message.serialize_with_options(serde_json::value::Serializer, &opts.serialize_options())?;
    normalize(&message.descriptor(), &mut json, opts);
    Ok(json)
}

/// Bind a JSON object to a message of type `desc`. Unknown fields are
/// rejected; proto and lowerCamel names are both accepted.
pub fn bind(desc: &MessageDescriptor, json: &Json) -> Result<DynamicMessage, CodecError> {
    if !json.is_object() {
        return Err(CodecError::ExpectedObject {
            message: desc.full_name().to_string(),
        });
    }
    let opts = DeserializeOptions::new().deny_unknown_fields(true);
    Ok(DynamicMessage::deserialize_with_options(
        desc.clone(),
        json,
        &opts,
    )?)
}

fn field_key(field: &FieldDescriptor, opts: &JsonOptions) -> String {
    if opts.proto_names {
        field.name().to_string()
    } else {
        field.json_name().to_string()
    }
}

/// Walk a serialized message alongside its descriptor, sorting map keys and
/// shortening widened `float` values.
fn normalize(desc: &MessageDescriptor, json: &mut Json, opts: &JsonOptions) {
    let Json::Object(object) = json else {
        return;
    };
    for field in desc.fields() {
        if let Some(value) = object.get_mut(&field_key(&field, opts)) {
            normalize_value(&FieldShape::of(&field), value, opts);
        }
    }
}

fn normalize_value(shape: &FieldShape, json: &mut Json, opts: &JsonOptions) {
    match (shape, json) {
        (FieldShape::Message(desc), json) => normalize(desc, json, opts),
        (FieldShape::Repeated(elem), Json::Array(items)) => {
            for item in items {
                normalize_value(elem, item, opts);
            }
        }
        (FieldShape::Map(key, value_shape), Json::Object(entries)) => {
            let mut sorted: Vec<(String, Json)> = std::mem::take(entries).into_iter().collect();
            if key.is_integer() {
                sorted.sort_by_key(|(k, _)| k.parse::<i128>().unwrap_or_default());
            } else {
                sorted.sort_by(|a, b| a.0.cmp(&b.0));
            }
            for (k, mut v) in sorted {
                normalize_value(value_shape, &mut v, opts);
                entries.insert(k, v);
            }
        }
        (FieldShape::Scalar(ScalarKind::Float), Json::Number(n)) => {
            if let Some(shortest) = n
                .as_f64()
                .and_then(|v| (v as f32).to_string().parse::<f64>().ok())
                .and_then(Number::from_f64)
            {
                *n = shortest;
            }
        }
        _ => {}
    }
}

/// Full JSON skeleton of a message type with every field populated by its
/// default (or a random value when `random_defaults` is set).
pub fn template(desc: &MessageDescriptor, opts: &JsonOptions) -> Json {
    template_at(desc, opts, 0)
}

fn template_at(desc: &MessageDescriptor, opts: &JsonOptions, depth: usize) -> Json {
    let mut out = Map::new();
    for field in desc.fields() {
        let value = match FieldShape::of(&field) {
            FieldShape::Repeated(_) => Json::Array(Vec::new()),
            FieldShape::Map(..) => Json::Object(Map::new()),
            FieldShape::Message(nested) if depth < TEMPLATE_MAX_DEPTH => {
                template_at(&nested, opts, depth + 1)
            }
            FieldShape::Message(_) => Json::Null,
            FieldShape::Enum(e) => default_enum(&e, opts),
            FieldShape::Scalar(kind) if opts.random_defaults => random_scalar(kind),
            FieldShape::Scalar(kind) => default_scalar(kind),
        };
        out.insert(field_key(&field, opts), value);
    }
    Json::Object(out)
}

fn default_enum(e: &EnumDescriptor, opts: &JsonOptions) -> Json {
    let value = e.default_value();
    if opts.enums_as_ints {
        Json::from(value.number())
    } else {
        Json::String(value.name().to_string())
    }
}

fn default_scalar(kind: ScalarKind) -> Json {
    match kind {
        ScalarKind::Bool => Json::Bool(false),
        ScalarKind::String | ScalarKind::Bytes => Json::String(String::new()),
        ScalarKind::Double | ScalarKind::Float => Json::from(0.0),
        kind if kind.is_64_bit() => Json::String("0".to_string()),
        _ => Json::from(0),
    }
}

fn random_scalar(kind: ScalarKind) -> Json {
    let mut rng = rand::rng();
    match kind {
        ScalarKind::Bool => Json::Bool(rng.random_bool(0.5)),
        ScalarKind::String => Json::String(random_letters(&mut rng, 5)),
        ScalarKind::Bytes => Json::String(STANDARD.encode(random_letters(&mut rng, 5))),
        ScalarKind::Double | ScalarKind::Float => {
            Json::from(f64::from(rng.random_range(0..1000i32)))
        }
        kind if kind.is_64_bit() => Json::String(rng.random_range(0..1000i32).to_string()),
        _ => Json::from(rng.random_range(0..1000i32)),
    }
}

fn random_letters(rng: &mut impl Rng, len: usize) -> String {
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
    (0..len)
        .map(|_| LETTERS[rng.random_range(0..LETTERS.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::shape::build_services;
    use crate::schema::shape::fixtures::pkg_file;
    use prost_reflect::Value;
    use serde_json::json;

    fn method_types() -> (MessageDescriptor, MessageDescriptor, MessageDescriptor) {
        let services = build_services(&[pkg_file()], |_| false).unwrap();
        let get = &services[0].methods[0];
        let walk = &services[0].methods[1];
        (get.input.clone(), get.output.clone(), walk.input.clone())
    }

    fn render(message: &DynamicMessage, opts: &JsonOptions) -> Json {
        to_json(message, opts).unwrap()
    }

    #[test]
    fn test_sixty_four_bit_integers_render_as_strings() {
        let (request, _, _) = method_types();
        let message = bind(&request, &json!({"id": 7, "big": 9007199254740993i64})).unwrap();
        let rendered = render(&message, &JsonOptions::default());
        assert_eq!(rendered, json!({"id": 7, "big": "9007199254740993"}));
    }

    #[test]
    fn test_integers_accept_strings() {
        let (request, _, _) = method_types();
        let message = bind(&request, &json!({"id": "12", "big": "-4"})).unwrap();
        assert_eq!(message.get_field_by_name("id").unwrap().as_i32(), Some(12));
        assert_eq!(message.get_field_by_name("big").unwrap().as_i64(), Some(-4));
    }

    #[test]
    fn test_enum_rendering_by_name_and_number() {
        let (request, _, _) = method_types();
        let message = bind(&request, &json!({"color": "RED"})).unwrap();
        assert_eq!(render(&message, &JsonOptions::default())["color"], json!("RED"));

        let opts = JsonOptions {
            enums_as_ints: true,
            ..JsonOptions::default()
        };
        assert_eq!(render(&message, &opts)["color"], json!(1));
    }

    #[test]
    fn test_unknown_enum_number_falls_back_to_integer() {
        let (request, _, _) = method_types();
        let mut message = DynamicMessage::new(request);
        message.set_field_by_name("color", Value::EnumNumber(42));
        assert_eq!(render(&message, &JsonOptions::default())["color"], json!(42));
    }

    #[test]
    fn test_emit_defaults_fills_unset_fields() {
        let (request, _, _) = method_types();
        let message = DynamicMessage::new(request);
        let rendered = render(&message, &JsonOptions::for_matching(true));
        assert_eq!(
            rendered,
            json!({"id": 0, "user_name": "", "big": "0", "color": 0, "tags": []})
        );
    }

    #[test]
    fn test_json_names_are_accepted_and_rendered() {
        let (request, _, _) = method_types();
        let message = bind(&request, &json!({"userName": "ann"})).unwrap();
        let opts = JsonOptions {
            proto_names: false,
            ..JsonOptions::default()
        };
        assert_eq!(render(&message, &opts), json!({"userName": "ann"}));
        assert_eq!(render(&message, &JsonOptions::default()), json!({"user_name": "ann"}));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let (_, reply, _) = method_types();
        let err = bind(&reply, &json!({"ok": true, "bogus": 1})).unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }

    #[test]
    fn test_type_mismatch_is_rejected() {
        let (_, reply, _) = method_types();
        assert!(bind(&reply, &json!({"ok": "maybe"})).is_err());
        assert!(matches!(
            bind(&reply, &json!([1, 2])),
            Err(CodecError::ExpectedObject { .. })
        ));
    }

    #[test]
    fn test_map_keys_sorted_and_bytes_base64() {
        let (_, _, node) = method_types();
        let message = bind(
            &node,
            &json!({"labels": {"d": 4, "b": 2, "c": 3, "a": 1}, "payload": "aGk="}),
        )
        .unwrap();
        let rendered = render(&message, &JsonOptions::default());
        let keys: Vec<_> = rendered["labels"].as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b", "c", "d"]);
        assert_eq!(rendered["payload"], json!("aGk="));
    }

    #[test]
    fn test_nested_maps_are_sorted_too() {
        let (_, _, node) = method_types();
        let message = bind(
            &node,
            &json!({"children": [{"labels": {"z": 1, "y": 2}}], "parent": {"labels": {"q": 1, "p": 2}}}),
        )
        .unwrap();
        let rendered = render(&message, &JsonOptions::default());
        let child: Vec<_> = rendered["children"][0]["labels"]
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        assert_eq!(child, vec!["y", "z"]);
        let parent: Vec<_> = rendered["parent"]["labels"].as_object().unwrap().keys().cloned().collect();
        assert_eq!(parent, vec!["p", "q"]);
    }

    #[test]
    fn test_non_finite_floats_render_as_strings() {
        let (_, reply, _) = method_types();
        for text in ["NaN", "Infinity", "-Infinity"] {
            let message = bind(&reply, &json!({ "score": text })).unwrap();
            assert_eq!(render(&message, &JsonOptions::default())["score"], json!(text));
        }
    }

    #[test]
    fn test_float_renders_shortest_form() {
        let (_, _, node) = method_types();
        let message = bind(&node, &json!({"ratio": 0.1})).unwrap();
        assert_eq!(render(&message, &JsonOptions::default())["ratio"], json!(0.1));
    }

    #[test]
    fn test_template_terminates_on_recursive_types() {
        let (_, _, node) = method_types();
        let rendered = template(&node, &JsonOptions::default());
        let mut depth = 0;
        let mut cursor = &rendered;
        while let Some(parent) = cursor.get("parent").filter(|p| p.is_object()) {
            depth += 1;
            cursor = parent;
        }
        assert_eq!(depth, TEMPLATE_MAX_DEPTH);
        assert_eq!(cursor["parent"], Json::Null);
    }

    #[test]
    fn test_template_defaults() {
        let (request, _, _) = method_types();
        let rendered = template(&request, &JsonOptions::default());
        assert_eq!(
            rendered,
            json!({"id": 0, "user_name": "", "big": "0", "color": "COLOR_UNSPECIFIED", "tags": []})
        );
    }

    #[test]
    fn test_random_defaults_replace_zero_values() {
        let (request, _, _) = method_types();
        let opts = JsonOptions {
            random_defaults: true,
            ..JsonOptions::default()
        };
        let rendered = template(&request, &opts);
        let name = rendered["user_name"].as_str().unwrap();
        assert_eq!(name.len(), 5);
        assert!(name.chars().all(|c| c.is_ascii_alphabetic()));
        let id = rendered["id"].as_i64().unwrap();
        assert!((0..1000).contains(&id));
        let big: i64 = rendered["big"].as_str().unwrap().parse().unwrap();
        assert!((0..1000).contains(&big));
    }
}
