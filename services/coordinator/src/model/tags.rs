use std::sync::LazyLock;

use regex::Regex;

use super::ModelError;

static TAG_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]+$").expect("tag key regex")
});

static TAG_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9_.-]*$").expect("tag value regex")
});

pub fn validate_tag_key(key: &str) -> Result<(), ModelError> {
    if TAG_KEY.is_match(key) {
        Ok(())
    } else {
        Err(ModelError::InvalidTagKey(key.to_string()))
    }
}

/// Empty values are valid; they mean "remove" in tag updates.
pub fn validate_tag_value(key: &str, value: &str) -> Result<(), ModelError> {
    if TAG_VALUE.is_match(value) {
        Ok(())
    } else {
        Err(ModelError::InvalidTagValue {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}
