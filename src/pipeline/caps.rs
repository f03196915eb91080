//! Structured format constraints ("caps")
//!
//! Caps describe what a port can carry: a media type such as `video/x-raw`
//! plus optional fixed fields (`width=1280`, `framerate=25/1`). Two ports can be
//! linked when their caps intersect.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
#[error("cannot parse caps '{text}': {reason}")]
pub struct CapsParseError {
    pub text: String,
    pub reason: String,
}

/// A single fixed field value
#[derive(Debug, Clone)]
pub enum CapsValue {
    Int(i64),
    Fraction(i64, i64),
    Bool(bool),
    Str(String),
}

impl PartialEq for CapsValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CapsValue::Int(a), CapsValue::Int(b)) => a == b,
            // 50/2 == 25/1
            (CapsValue::Fraction(an, ad), CapsValue::Fraction(bn, bd)) => {
                (*an as i128) * (*bd as i128) == (*bn as i128) * (*ad as i128)
            }
            (CapsValue::Bool(a), CapsValue::Bool(b)) => a == b,
            (CapsValue::Str(a), CapsValue::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for CapsValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapsValue::Int(v) => write!(f, "{}", v),
            CapsValue::Fraction(n, d) => write!(f, "{}/{}", n, d),
            CapsValue::Bool(v) => write!(f, "{}", v),
            CapsValue::Str(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for CapsValue {
    fn from(v: i64) -> Self {
        CapsValue::Int(v)
    }
}

impl From<i32> for CapsValue {
    fn from(v: i32) -> Self {
        CapsValue::Int(v as i64)
    }
}

impl From<u32> for CapsValue {
    fn from(v: u32) -> Self {
        CapsValue::Int(v as i64)
    }
}

impl From<bool> for CapsValue {
    fn from(v: bool) -> Self {
        CapsValue::Bool(v)
    }
}

impl From<&str> for CapsValue {
    fn from(v: &str) -> Self {
        CapsValue::Str(v.to_string())
    }
}

/// Format constraint for a port
///
/// `media_type == None` means ANY: the port accepts whatever its peer offers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Caps {
    media_type: Option<String>,
    fields: BTreeMap<String, CapsValue>,
}

impl Caps {
    /// Caps that intersect with everything
    pub fn any() -> Self {
        Self::default()
    }

    /// Caps with a media type and no fixed fields
    pub fn new_simple(media_type: &str) -> Self {
        Self {
            media_type: Some(media_type.to_string()),
            fields: BTreeMap::new(),
        }
    }

    pub fn builder(media_type: &str) -> CapsBuilder {
        CapsBuilder {
            caps: Self::new_simple(media_type),
        }
    }

    pub fn is_any(&self) -> bool {
        self.media_type.is_none()
    }

    pub fn media_type(&self) -> Option<&str> {
        self.media_type.as_deref()
    }

    pub fn get(&self, field: &str) -> Option<&CapsValue> {
        self.fields.get(field)
    }

    /// Is this a raw (unencoded) audio or video format
    pub fn is_raw(&self) -> bool {
        matches!(self.media_type(), Some("video/x-raw") | Some("audio/x-raw"))
    }

    /// Common subset of two constraints, `None` when they cannot agree
    pub fn intersect(&self, other: &Caps) -> Option<Caps> {
        let media_type = match (&self.media_type, &other.media_type) {
            (None, None) => None,
            (Some(a), None) | (None, Some(a)) => Some(a.clone()),
            (Some(a), Some(b)) if a == b => Some(a.clone()),
            _ => return None,
        };

        let mut fields = self.fields.clone();
        for (key, value) in &other.fields {
            match fields.get(key) {
                Some(existing) if existing != value => return None,
                Some(_) => {}
                None => {
                    fields.insert(key.clone(), value.clone());
                }
            }
        }

        Some(Caps { media_type, fields })
    }

    pub fn can_intersect(&self, other: &Caps) -> bool {
        self.intersect(other).is_some()
    }

    /// Same caps with `names` left unconstrained
    pub fn without_fields(&self, names: &[&str]) -> Caps {
        let mut caps = self.clone();
        caps.fields.retain(|key, _| !names.contains(&key.as_str()));
        caps
    }

    /// Integer field, if fixed
    pub fn get_int(&self, field: &str) -> Option<i64> {
        match self.fields.get(field) {
            Some(CapsValue::Int(v)) => Some(*v),
            _ => None,
        }
    }
}

pub struct CapsBuilder {
    caps: Caps,
}

impl CapsBuilder {
    pub fn field(mut self, key: &str, value: impl Into<CapsValue>) -> Self {
        self.caps.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn fraction(mut self, key: &str, num: i64, den: i64) -> Self {
        self.caps
            .fields
            .insert(key.to_string(), CapsValue::Fraction(num, den));
        self
    }

    pub fn build(self) -> Caps {
        self.caps
    }
}

impl fmt::Display for Caps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.media_type {
            None => write!(f, "ANY"),
            Some(media_type) => {
                write!(f, "{}", media_type)?;
                for (key, value) in &self.fields {
                    write!(f, ", {}={}", key, value)?;
                }
                Ok(())
            }
        }
    }
}

impl FromStr for Caps {
    type Err = CapsParseError;

    /// Parses `media/type, key=value, ...`; values may carry a `(type)` prefix
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let fail = |reason: &str| CapsParseError {
            text: text.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = text.split(',').map(str::trim);
        let media_type = parts.next().unwrap_or_default();
        if media_type.eq_ignore_ascii_case("ANY") {
            return Ok(Caps::any());
        }
        if media_type.is_empty() || !media_type.contains('/') {
            return Err(fail("expected a media type like video/x-raw"));
        }

        let mut caps = Caps::new_simple(media_type);
        for part in parts {
            if part.is_empty() {
                continue;
            }
            let (key, raw) = part
                .split_once('=')
                .ok_or_else(|| fail(&format!("field '{}' has no value", part)))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(fail("empty field name"));
            }
            let value = parse_value(raw.trim()).ok_or_else(|| fail(&format!("bad value for '{}'", key)))?;
            caps.fields.insert(key.to_string(), value);
        }
        Ok(caps)
    }
}

fn parse_value(raw: &str) -> Option<CapsValue> {
    // Drop an explicit type annotation, e.g. "(int)1280"
    let raw = match raw.strip_prefix('(') {
        Some(rest) => rest.split_once(')')?.1.trim(),
        None => raw,
    };
    if raw.is_empty() {
        return None;
    }
    if let Ok(v) = raw.parse::<i64>() {
        return Some(CapsValue::Int(v));
    }
    if let Some((num, den)) = raw.split_once('/')
        && let (Ok(num), Ok(den)) = (num.trim().parse::<i64>(), den.trim().parse::<i64>())
    {
        if den == 0 {
            return None;
        }
        return Some(CapsValue::Fraction(num, den));
    }
    match raw {
        "true" => Some(CapsValue::Bool(true)),
        "false" => Some(CapsValue::Bool(false)),
        _ => Some(CapsValue::Str(raw.trim_matches('"').to_string())),
    }
}
