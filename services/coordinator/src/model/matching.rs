use std::fmt;

use labhub_proto::coordinator::v1 as pb;
use regex::Regex;

use super::{ModelError, ResourcePath};

/// One fnmatch-style path component (`*`, `?`, `[seq]`, `[!seq]`).
#[derive(Debug, Clone)]
struct Pattern {
    raw: String,
    regex: Regex,
}

impl Pattern {
    fn parse(raw: &str, full: &str) -> Result<Self, ModelError> {
        let regex = Regex::new(&translate(raw)).map_err(|_| ModelError::InvalidPattern {
            pattern: full.to_string(),
            reason: "component does not compile",
        })?;
        Ok(Self {
            raw: raw.to_string(),
            regex,
        })
    }

    fn is_match(&self, value: &str) -> bool {
        self.regex.is_match(value)
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Pattern {}

/// Translate a shell glob into an anchored regex.
fn translate(glob: &str) -> String {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut j = i + 1;
                if j < chars.len() && chars[j] == '!' {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ']' {
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                if j >= chars.len() {
                    // unterminated, match a literal bracket
                    out.push_str(r"\[");
                } else {
                    let mut class = String::from("[");
                    let mut k = i + 1;
                    if chars[k] == '!' {
                        class.push('^');
                        k += 1;
                    }
                    for &c in &chars[k..j] {
                        if matches!(c, '\\' | '[' | ']' | '^' | '&' | '~') {
                            class.push('\\');
                        }
                        class.push(c);
                    }
                    class.push(']');
                    out.push_str(&class);
                    i = j;
                }
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push('$');
    out
}

/// A place's claim on resources: `exporter/group/cls[/name]`.
///
/// Without a name component the match claims every resource of the class in
/// that group. `rename` is carried along for clients and does not take part
/// in equality.
#[derive(Debug, Clone)]
pub struct ResourceMatch {
    exporter: Pattern,
    group: Pattern,
    cls: Pattern,
    name: Option<Pattern>,
    pub rename: Option<String>,
}

impl ResourceMatch {
    pub fn parse(pattern: &str, rename: Option<String>) -> Result<Self, ModelError> {
        let parts: Vec<&str> = pattern.split('/').collect();
        if !(3..=4).contains(&parts.len()) {
            return Err(ModelError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "expected exporter/group/cls or exporter/group/cls/name",
            });
        }
        if parts.iter().any(|p| p.is_empty()) {
            return Err(ModelError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "empty component",
            });
        }
        let rename = rename.filter(|r| !r.is_empty());
        Ok(Self {
            exporter: Pattern::parse(parts[0], pattern)?,
            group: Pattern::parse(parts[1], pattern)?,
            cls: Pattern::parse(parts[2], pattern)?,
            name: parts
                .get(3)
                .map(|p| Pattern::parse(p, pattern))
                .transpose()?,
            rename,
        })
    }

    pub fn from_proto(m: &pb::ResourceMatch) -> Result<Self, ModelError> {
        let mut pattern = format!("{}/{}/{}", m.exporter, m.group, m.cls);
        if let Some(name) = &m.name {
            pattern.push('/');
            pattern.push_str(name);
        }
        Self::parse(&pattern, m.rename.clone())
    }

    pub fn matches(&self, path: &ResourcePath) -> bool {
        self.exporter.is_match(&path.exporter)
            && self.group.is_match(&path.group)
            && self.cls.is_match(&path.cls)
            && self
                .name
                .as_ref()
                .is_none_or(|name| name.is_match(&path.name))
    }

    pub fn to_proto(&self) -> pb::ResourceMatch {
        pb::ResourceMatch {
            exporter: self.exporter.raw.clone(),
            group: self.group.raw.clone(),
            cls: self.cls.raw.clone(),
            name: self.name.as_ref().map(|n| n.raw.clone()),
            rename: self.rename.clone(),
        }
    }
}

impl PartialEq for ResourceMatch {
    fn eq(&self, other: &Self) -> bool {
        self.exporter == other.exporter
            && self.group == other.group
            && self.cls == other.cls
            && self.name == other.name
    }
}

impl Eq for ResourceMatch {}

impl fmt::Display for ResourceMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.exporter.raw, self.group.raw, self.cls.raw)?;
        if let Some(name) = &self.name {
            write!(f, "/{}", name.raw)?;
        }
        Ok(())
    }
}
