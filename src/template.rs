/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! `{field}` substitution for argument and command templates.

use crate::error::ExperimentError;
use anyhow::anyhow;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Serializes `value` and flattens its top-level fields into strings. Nulls are skipped so a
/// template that refers to them fails loudly instead of rendering "null".
pub fn fields_of<T: Serialize>(value: &T) -> anyhow::Result<BTreeMap<String, String>> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map
            .into_iter()
            .filter_map(|(key, value)| {
                let rendered = match value {
                    Value::Null => return None,
                    Value::String(s) => s,
                    Value::Bool(b) => b.to_string(),
                    Value::Number(n) => n.to_string(),
                    other => other.to_string(),
                };
                Some((key, rendered))
            })
            .collect()),
        _ => Err(anyhow!("only structs can be used as template sources")),
    }
}

/// Replaces every `{key}` in `template` with `fields[key]`.
pub fn render(template: &str, fields: &BTreeMap<String, String>) -> anyhow::Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            ExperimentError::precondition(format!("unterminated placeholder in \"{}\"", template))
        })?;
        let key = &after[..close];
        let value = fields.get(key).ok_or_else(|| {
            ExperimentError::precondition(format!(
                "template \"{}\" refers to unknown field {}",
                template, key
            ))
        })?;
        out.push_str(value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Sample {
        ip: String,
        port: Option<u16>,
        threads: usize,
        mpps: f64,
        warmup: bool,
    }

    fn sample() -> Sample {
        Sample {
            ip: "192.168.18.100".to_string(),
            port: None,
            threads: 4,
            mpps: 0.7,
            warmup: true,
        }
    }

    #[test]
    fn renders_every_placeholder() -> anyhow::Result<()> {
        let fields = fields_of(&sample())?;
        let out = render("{ip} -t {threads} --mpps={mpps} {warmup}", &fields)?;
        assert_eq!(out, "192.168.18.100 -t 4 --mpps=0.7 true");
        Ok(())
    }

    #[test]
    fn null_fields_are_not_renderable() -> anyhow::Result<()> {
        let fields = fields_of(&sample())?;
        assert!(!fields.contains_key("port"));
        assert!(render("{ip}:{port}", &fields).is_err());
        Ok(())
    }

    #[test]
    fn shell_suffixes_pass_through() -> anyhow::Result<()> {
        let fields = fields_of(&sample())?;
        let out = render("-nt {threads} 2>&1 | ts %s", &fields)?;
        assert_eq!(out, "-nt 4 2>&1 | ts %s");
        Ok(())
    }

    #[test]
    fn unterminated_placeholder_is_an_error() -> anyhow::Result<()> {
        let fields = fields_of(&sample())?;
        assert!(render("{ip", &fields).is_err());
        Ok(())
    }
}
