//! Named-placeholder templates such as `"{name}.{epoch:05d}.ckpt"`.
//!
//! Supports `{key}`, `{key:spec}` with an optional zero flag, width and
//! type `d` or `s`, and `{{`/`}}` escapes.

use crate::error::ConfigError;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static PLACEHOLDER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{|\}\}|\{([A-Za-z_][A-Za-z0-9_]*)(?::([^{}]*))?\}")
        .expect("Invalid placeholder regex")
});

static SPEC_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(0)?([0-9]*)([ds]?)$").expect("Invalid format spec regex")
});

/// Value substituted for a placeholder.
#[derive(Debug, Clone, Copy)]
pub enum Field<'a> {
    Str(&'a str),
    Int(u64),
}

fn render(field: Field<'_>, spec: Option<&str>) -> Result<String, String> {
    let spec = spec.unwrap_or("");
    let caps = SPEC_REGEX
        .captures(spec)
        .ok_or_else(|| format!("unsupported format spec \"{}\"", spec))?;
    let zero = caps.get(1).is_some();
    let width: usize = match caps.get(2).map(|m| m.as_str()) {
        Some("") | None => 0,
        Some(w) => w.parse().map_err(|_| format!("invalid width \"{}\"", w))?,
    };
    let kind = caps.get(3).map_or("", |m| m.as_str());

    match field {
        Field::Int(n) if kind != "s" => Ok(if zero {
            format!("{:0width$}", n, width = width)
        } else {
            format!("{:>width$}", n, width = width)
        }),
        Field::Str(s) if kind != "d" && !zero => Ok(format!("{:<width$}", s, width = width)),
        Field::Int(_) => Err("integer field formatted with type s".to_string()),
        Field::Str(_) => Err(format!("string field formatted with spec \"{}\"", spec)),
    }
}

/// Substitute named fields into `template`.
pub fn format_template(template: &str, fields: &[(&str, Field<'_>)]) -> Result<String, ConfigError> {
    let mut error = None;
    let out = PLACEHOLDER_REGEX.replace_all(template, |caps: &Captures<'_>| {
        let whole = &caps[0];
        if whole == "{{" {
            return "{".to_string();
        }
        if whole == "}}" {
            return "}".to_string();
        }

        let key = &caps[1];
        let result = fields
            .iter()
            .find(|(name, _)| *name == key)
            .ok_or_else(|| format!("unknown placeholder \"{}\"", key))
            .and_then(|(_, field)| render(*field, caps.get(2).map(|m| m.as_str())));
        match result {
            Ok(text) => text,
            Err(reason) => {
                error.get_or_insert(reason);
                String::new()
            }
        }
    });

    match error {
        Some(reason) => Err(ConfigError::Format(format!(
            "template \"{}\": {}",
            template, reason
        ))),
        None => Ok(out.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_placeholders() {
        let out = format_template(
            "{name}.{epoch}.ckpt",
            &[("name", Field::Str("run")), ("epoch", Field::Int(7))],
        )
        .unwrap();
        assert_eq!(out, "run.7.ckpt");
    }

    #[test]
    fn test_zero_padding() {
        let out = format_template("{epoch:05d}", &[("epoch", Field::Int(42))]).unwrap();
        assert_eq!(out, "00042");
        let out = format_template("{epoch:03}", &[("epoch", Field::Int(12345))]).unwrap();
        assert_eq!(out, "12345");
    }

    #[test]
    fn test_escapes_and_wildcards() {
        let out = format_template("{{{name}}}.*", &[("name", Field::Str("x"))]).unwrap();
        assert_eq!(out, "{x}.*");
    }

    #[test]
    fn test_unknown_placeholder() {
        let result = format_template("{missing}", &[("name", Field::Str("x"))]);
        assert!(matches!(result, Err(ConfigError::Format(_))));
    }

    #[test]
    fn test_bad_spec() {
        let result = format_template("{epoch:.2f}", &[("epoch", Field::Int(1))]);
        assert!(matches!(result, Err(ConfigError::Format(_))));
    }
}
