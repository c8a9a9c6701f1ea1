use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TemplateError {
    #[error("no value for placeholder ${0}")]
    MissingKey(String),

    #[error("invalid placeholder at byte {0}")]
    InvalidPlaceholder(usize),
}

fn is_identifier_start(c: char) -> bool {
    c == '_' || c.is_ascii_alphabetic()
}

fn is_identifier_char(c: char) -> bool {
    c == '_' || c.is_ascii_alphanumeric()
}

/// `$`-style template substitution: `$name` and `${name}` are replaced by
/// their value, `$$` is a literal `$`. Every placeholder must have a value.
pub fn substitute(template: &str, values: &HashMap<&str, &str>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let (name, consumed) = if let Some(stripped) = after.strip_prefix('$') {
            out.push('$');
            rest = stripped;
            offset += pos + 2;
            continue;
        } else if let Some(braced) = after.strip_prefix('{') {
            let end = braced
                .find('}')
                .ok_or(TemplateError::InvalidPlaceholder(offset + pos))?;
            let name = &braced[..end];
            let valid = name.chars().next().is_some_and(is_identifier_start)
                && name.chars().all(is_identifier_char);
            if !valid {
                return Err(TemplateError::InvalidPlaceholder(offset + pos));
            }
            (name, end + 2)
        } else {
            if !after.chars().next().is_some_and(is_identifier_start) {
                return Err(TemplateError::InvalidPlaceholder(offset + pos));
            }
            let len = after
                .find(|c: char| !is_identifier_char(c))
                .unwrap_or(after.len());
            (&after[..len], len)
        };

        let value = values
            .get(name)
            .ok_or_else(|| TemplateError::MissingKey(name.to_owned()))?;
        out.push_str(value);
        rest = &after[consumed..];
        offset += pos + 1 + consumed;
    }
    out.push_str(rest);
    Ok(out)
}
