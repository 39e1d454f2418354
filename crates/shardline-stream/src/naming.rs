//! Expansion of stream naming patterns.
//!
//! A pattern such as `{realm}-{streamName}` is expanded with the fields of
//! an [`AppId`]. The realm itself is a pattern (by default
//! `{project}-{env}-{family}-{group}`), expanded when referenced.

use crate::config::{AppId, DEFAULT_REALM_PATTERN, NamingSettings};
use crate::error::{Error, Result};
use crate::id::Stream;

/// Expands the full stream name for `stream_name` owned by `app_id`.
///
/// # Errors
///
/// Returns an invalid input error for unknown placeholders, unterminated
/// placeholders, or placeholders referring to empty fields.
pub fn stream_name(app_id: &AppId, naming: &NamingSettings, stream_name: &str) -> Result<Stream> {
    let name = expand(&naming.pattern, |placeholder| match placeholder {
        "realm" => realm(app_id),
        "streamName" => non_empty("streamName", stream_name),
        other => lookup(app_id, other),
    })?;

    Ok(Stream::new(name))
}

fn realm(app_id: &AppId) -> Result<String> {
    let pattern = app_id.realm.as_deref().unwrap_or(DEFAULT_REALM_PATTERN);
    expand(pattern, |placeholder| match placeholder {
        "realm" => Err(invalid("realm pattern can not reference {realm}")),
        other => lookup(app_id, other),
    })
}

fn lookup(app_id: &AppId, placeholder: &str) -> Result<String> {
    match placeholder {
        "project" => non_empty(placeholder, &app_id.project),
        "env" => non_empty(placeholder, &app_id.environment),
        "family" => non_empty(placeholder, &app_id.family),
        "group" => non_empty(placeholder, &app_id.group),
        "app" => non_empty(placeholder, &app_id.application),
        other => Err(invalid(format!("unknown naming placeholder {{{other}}}"))),
    }
}

fn non_empty(name: &str, value: &str) -> Result<String> {
    if value.is_empty() {
        return Err(invalid(format!("naming placeholder {{{name}}} refers to an empty value")));
    }
    Ok(value.to_string())
}

fn expand<F>(pattern: &str, mut resolve: F) -> Result<String>
where
    F: FnMut(&str) -> Result<String>,
{
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| invalid(format!("unterminated placeholder in naming pattern '{pattern}'")))?;
        out.push_str(&resolve(&after[..end])?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Ok(out)
}

fn invalid(message: impl Into<String>) -> Error {
    Error::Core(shardline_core::Error::InvalidInput(message.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_id() -> AppId {
        AppId::new("acme", "test", "analytics", "grp", "consumer")
    }

    #[test]
    fn test_default_pattern() {
        let name = stream_name(&app_id(), &NamingSettings::default(), "events")
            .expect("naming should succeed");

        assert_eq!(name.as_str(), "acme-test-analytics-grp-events");
    }

    #[test]
    fn test_custom_realm_and_pattern() {
        let app_id = AppId {
            realm: Some("{project}-{env}".to_string()),
            ..app_id()
        };
        let naming = NamingSettings {
            pattern: "{realm}.{app}.{streamName}".to_string(),
        };

        let name = stream_name(&app_id, &naming, "events").expect("naming should succeed");

        assert_eq!(name.as_str(), "acme-test.consumer.events");
    }

    #[test]
    fn test_unknown_placeholder_is_rejected() {
        let naming = NamingSettings {
            pattern: "{realm}-{region}-{streamName}".to_string(),
        };

        let err = stream_name(&app_id(), &naming, "events").expect_err("naming should fail");
        assert!(err.to_string().contains("{region}"));
    }

    #[test]
    fn test_empty_field_is_rejected() {
        let app_id = AppId {
            group: String::new(),
            ..app_id()
        };

        assert!(stream_name(&app_id, &NamingSettings::default(), "events").is_err());
        assert!(stream_name(&self::app_id(), &NamingSettings::default(), "").is_err());
    }

    #[test]
    fn test_unterminated_placeholder_is_rejected() {
        let naming = NamingSettings {
            pattern: "{realm-{streamName}".to_string(),
        };

        assert!(stream_name(&app_id(), &naming, "events").is_err());
    }
}
