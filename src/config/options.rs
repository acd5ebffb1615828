//! Command-line overrides of the form `key[:sub[:...]]=value`.

use crate::error::ConfigError;
use log::{debug, info};
use serde_json::{Map, Number, Value};

/// Cast option text to the first type it matches: bool, integer, float, string.
pub fn cast(text: &str) -> Value {
    match text {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }

    if let Ok(n) = text.parse::<i64>() {
        return Value::Number(n.into());
    }

    // Non-finite floats have no JSON representation and stay strings.
    if let Some(n) = text.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(n);
    }

    Value::String(text.to_string())
}

/// Add option strings into a configuration mapping.
///
/// Every key before the last must name an existing object.
pub fn apply_options<S: AsRef<str>>(
    config: &mut Map<String, Value>,
    options: &[S],
) -> Result<(), ConfigError> {
    for option in options {
        let option = option.as_ref();
        debug!("parsing option {}", option);

        let (keys, value) = match option.split('=').collect::<Vec<_>>()[..] {
            [keys, value] => (keys, value),
            _ => {
                return Err(ConfigError::Format(format!(
                    "option \"{}\" has invalid format",
                    option
                )))
            }
        };

        let mut keys: Vec<&str> = keys.split(':').collect();
        let last = keys.pop().unwrap_or_default();

        let mut sub = &mut *config;
        let mut walked = Vec::with_capacity(keys.len());
        for key in keys {
            walked.push(key);
            sub = match sub.get_mut(key) {
                Some(Value::Object(map)) => map,
                _ => return Err(ConfigError::MissingKey(walked.join(":"))),
            };
        }

        sub.insert(last.to_string(), cast(value));
        info!("added configuration option \"{}\"", option);
    }

    Ok(())
}
