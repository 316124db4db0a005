use crate::config::JsonStyle;
use crate::error::HubError;
use crate::model::{ParamMode, ParameterSet};
use serde_json::{Map, Value};

/// Turns raw user input into a [`ParameterSet`].
///
/// Pure: nothing is spawned and nothing is written. Blank input is valid for
/// every mode and yields an empty set.
pub fn translate(raw: &str, mode: ParamMode) -> Result<ParameterSet, HubError> {
    if raw.trim().is_empty() {
        return Ok(ParameterSet::empty(mode));
    }

    let entries = match mode {
        ParamMode::Positional => split_tokens(raw)?
            .into_iter()
            .enumerate()
            .map(|(idx, token)| (idx.to_string(), token))
            .collect(),
        ParamMode::KeyValue => parse_key_values(raw)?,
        ParamMode::Json => parse_json_object(raw)?,
    };

    Ok(ParameterSet::from_entries(mode, entries))
}

/// Splits on whitespace, keeping quoted segments together.
///
/// Single quotes are literal. Inside double quotes a backslash escapes `"`
/// and `\`; outside quotes it escapes any character.
pub fn split_tokens(input: &str) -> Result<Vec<String>, HubError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        match ch {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err(HubError::parse("unterminated single quote")),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err(HubError::parse("unterminated double quote")),
                        },
                        Some(c) => current.push(c),
                        None => return Err(HubError::parse("unterminated double quote")),
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => current.push('\\'),
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }

    if in_token {
        tokens.push(current);
    }

    Ok(tokens)
}

fn parse_key_values(raw: &str) -> Result<Vec<(String, String)>, HubError> {
    let mut entries: Vec<(String, String)> = Vec::new();

    for token in split_tokens(raw)? {
        let Some((key, value)) = token.split_once('=') else {
            return Err(HubError::parse(format!(
                "expected key=value, got {token:?}"
            )));
        };

        let key = key.trim();
        if key.is_empty() {
            return Err(HubError::parse(format!("missing key in {token:?}")));
        }

        match entries.iter_mut().find(|(existing, _)| existing == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => entries.push((key.to_string(), value.to_string())),
        }
    }

    Ok(entries)
}

fn parse_json_object(raw: &str) -> Result<Vec<(String, String)>, HubError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| HubError::parse(format!("invalid json: {e}")))?;

    let Value::Object(map) = value else {
        return Err(HubError::parse("json parameters must be an object"));
    };

    Ok(map
        .into_iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (key, text)
        })
        .collect())
}

impl ParameterSet {
    /// Command line arguments for this set.
    ///
    /// Positional values are appended in order; named values become
    /// `--key value` flags, or one `--json <payload>` flag for JSON input
    /// when `json_style` asks for it.
    pub fn to_args(&self, json_style: JsonStyle) -> Vec<String> {
        match self.mode() {
            ParamMode::Positional => self.values().map(str::to_string).collect(),
            ParamMode::Json if json_style == JsonStyle::Payload => {
                if self.is_empty() {
                    Vec::new()
                } else {
                    vec!["--json".to_string(), self.to_json().to_string()]
                }
            }
            ParamMode::KeyValue | ParamMode::Json => self
                .iter()
                .flat_map(|(key, value)| [format!("--{key}"), value.to_string()])
                .collect(),
        }
    }

    /// Renders the set back as `key=value` input accepted by [`translate`].
    pub fn to_key_value_input(&self) -> String {
        self.iter()
            .map(|(key, value)| quote_token(&format!("{key}={value}")))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Renders the values back as positional input accepted by [`translate`].
    pub fn to_positional_input(&self) -> String {
        self.values().map(quote_token).collect::<Vec<_>>().join(" ")
    }

    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .iter()
            .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
            .collect();
        Value::Object(map)
    }
}

/// Quotes a token so [`split_tokens`] reads it back unchanged.
pub fn quote_token(token: &str) -> String {
    let plain = !token.is_empty()
        && !token
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '\'' | '"' | '\\'));
    if plain {
        return token.to_string();
    }

    let mut out = String::with_capacity(token.len() + 2);
    out.push('"');
    for c in token.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
