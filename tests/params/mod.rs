use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use scripthub::config::JsonStyle;
use scripthub::error::HubError;
use scripthub::model::ParamMode;
use scripthub::params::translate;
use serde_json::{Map, Value, json};

const VALUE_CHARS: &[char] = &[
    'a', 'b', 'Z', '0', '7', ' ', '=', '"', '\'', '\\', '-', '/', ':', 'é', '\t',
];
const KEY_CHARS: &[char] = &['a', 'k', 'x', '_', '1', '9'];
const PAIR_SEPARATORS: &[&str] = &[" ", "\n", "\r\n", "\t", "  \n"];

fn random_string(rng: &mut StdRng, alphabet: &[char], min: usize, max: usize) -> String {
    let len = rng.random_range(min..=max);
    (0..len)
        .map(|_| alphabet[rng.random_range(0..alphabet.len())])
        .collect()
}

#[test]
fn empty_input_is_empty_set_in_every_mode() {
    for mode in [ParamMode::Positional, ParamMode::KeyValue, ParamMode::Json] {
        for raw in ["", "   ", "\n\t"] {
            let set = translate(raw, mode).expect("blank input");
            assert!(set.is_empty(), "{mode} {raw:?}");
            assert_eq!(set.mode(), mode);
            assert!(set.to_args(JsonStyle::Flags).is_empty());
        }
    }
}

#[test]
fn positional_keeps_order_and_quoted_segments() {
    let set = translate(r#"https://example.com "My Company" quick"#, ParamMode::Positional)
        .expect("positional");
    assert_eq!(
        set.to_args(JsonStyle::Flags),
        vec!["https://example.com", "My Company", "quick"]
    );
    assert_eq!(set.get("1"), Some("My Company"));
}

#[test]
fn key_value_splits_on_first_equals() {
    let set = translate("query=a=b url=https://x.test/?q=1", ParamMode::KeyValue).expect("kv");
    assert_eq!(set.get("query"), Some("a=b"));
    assert_eq!(set.get("url"), Some("https://x.test/?q=1"));
}

#[test]
fn key_value_duplicate_keys_last_wins() {
    let set = translate("depth=quick topic=ai depth=deep", ParamMode::KeyValue).expect("kv");
    assert_eq!(set.len(), 2);
    assert_eq!(set.get("depth"), Some("deep"));
    assert_eq!(
        set.to_args(JsonStyle::Flags),
        vec!["--depth", "deep", "--topic", "ai"]
    );
}

#[test]
fn key_value_pairs_may_span_lines() {
    let set = translate("topic=ai\ndepth=quick\r\nformat=\"plain text\"\n", ParamMode::KeyValue)
        .expect("kv");
    assert_eq!(set.len(), 3);
    assert_eq!(set.get("depth"), Some("quick"));
    assert_eq!(set.get("format"), Some("plain text"));
}

#[test]
fn key_value_allows_empty_values() {
    let set = translate("name=", ParamMode::KeyValue).expect("kv");
    assert_eq!(set.get("name"), Some(""));
}

#[test]
fn key_value_rejects_malformed_tokens() {
    assert!(matches!(
        translate("depth=quick loose", ParamMode::KeyValue),
        Err(HubError::Parse(_))
    ));
    assert!(matches!(
        translate("=value", ParamMode::KeyValue),
        Err(HubError::Parse(_))
    ));
    assert!(matches!(
        translate("name=\"open", ParamMode::KeyValue),
        Err(HubError::Parse(_))
    ));
}

#[test]
fn json_must_be_an_object() {
    for raw in ["[1, 2]", "\"text\"", "42", "{not json", "{\"a\": 1"] {
        assert!(
            matches!(translate(raw, ParamMode::Json), Err(HubError::Parse(_))),
            "{raw}"
        );
    }
}

#[test]
fn json_non_string_values_pass_as_json_text() {
    let set = translate(
        r#"{"count": 3, "deep": true, "tags": ["a", "b"], "name": "acme"}"#,
        ParamMode::Json,
    )
    .expect("json");
    assert_eq!(set.get("count"), Some("3"));
    assert_eq!(set.get("deep"), Some("true"));
    assert_eq!(set.get("tags"), Some(r#"["a","b"]"#));
    assert_eq!(set.get("name"), Some("acme"));
}

#[test]
fn json_payload_style_emits_single_flag() {
    let set = translate(r#"{"b": "2", "a": "1"}"#, ParamMode::Json).expect("json");
    assert_eq!(
        set.to_args(JsonStyle::Payload),
        vec!["--json".to_string(), r#"{"a":"1","b":"2"}"#.to_string()]
    );
    assert_eq!(
        set.to_args(JsonStyle::Flags),
        vec!["--a", "1", "--b", "2"]
    );
}

#[test]
fn key_value_rendering_is_idempotent() {
    let mut rng = StdRng::seed_from_u64(0x5c21_7a0b);

    for case in 0..300 {
        let count = rng.random_range(0..6);
        let mut raw = String::new();
        for _ in 0..count {
            let key = random_string(&mut rng, KEY_CHARS, 1, 6);
            let value = random_string(&mut rng, VALUE_CHARS, 0, 10);
            raw.push_str(&scripthub::params::quote_token(&format!("{key}={value}")));
            raw.push_str(PAIR_SEPARATORS[rng.random_range(0..PAIR_SEPARATORS.len())]);
        }

        let first = translate(&raw, ParamMode::KeyValue).expect("first parse");
        let again = translate(&first.to_key_value_input(), ParamMode::KeyValue)
            .expect("second parse");
        assert_eq!(first, again, "case {case}: {raw:?}");
    }
}

#[test]
fn positional_rendering_is_idempotent() {
    let mut rng = StdRng::seed_from_u64(0x0b5e_55ed);

    for case in 0..300 {
        let values: Vec<String> = (0..rng.random_range(1..5))
            .map(|_| random_string(&mut rng, VALUE_CHARS, 0, 8))
            .collect();
        let raw = values
            .iter()
            .map(|v| scripthub::params::quote_token(v))
            .collect::<Vec<_>>()
            .join(" ");

        let set = translate(&raw, ParamMode::Positional).expect("positional");
        let args = set.to_args(JsonStyle::Flags);
        assert_eq!(args, values, "case {case}: {raw:?}");

        let again = translate(&set.to_positional_input(), ParamMode::Positional)
            .expect("reparse");
        assert_eq!(set, again, "case {case}");
    }
}

#[test]
fn json_string_objects_round_trip() {
    let mut rng = StdRng::seed_from_u64(0x1d5e_a5e5);

    for case in 0..300 {
        let mut map = Map::new();
        for _ in 0..rng.random_range(1..6) {
            let key = random_string(&mut rng, VALUE_CHARS, 1, 6);
            let value = random_string(&mut rng, VALUE_CHARS, 0, 10);
            map.insert(key, Value::String(value));
        }
        let original = Value::Object(map);

        let set = translate(&original.to_string(), ParamMode::Json).expect("json");
        assert_eq!(set.to_json(), original, "case {case}");
    }
}

#[test]
fn json_empty_object_has_no_arguments() {
    let set = translate("{}", ParamMode::Json).expect("json");
    assert!(set.is_empty());
    assert!(set.to_args(JsonStyle::Payload).is_empty());
    assert_eq!(set.to_json(), json!({}));
}
