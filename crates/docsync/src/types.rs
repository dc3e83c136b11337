use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Separator between the components of a channel name
pub const SEPARATOR: char = ':';

/// Suffix of the per-document lock key
const LOCK_SUFFIX: &str = "lock";

/// Identifier of one running server process
///
/// Human-readable format: "host-<uuid v4>". The separator is never part of an
/// identifier, so the identifier is always the last component of a publish
/// key and can be recovered from a channel name even when the prefix or the
/// document name contain separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generate a fresh random identifier for this process
    pub fn generate() -> Self {
        Self(format!("host-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for InstanceId {
    type Err = InstanceIdError;

    /// Separators are stripped, mirroring how publish keys are formed
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.chars().filter(|c| *c != SEPARATOR).collect();
        if cleaned.is_empty() {
            return Err(InstanceIdError::Empty);
        }
        if cleaned == LOCK_SUFFIX {
            return Err(InstanceIdError::Reserved(cleaned));
        }
        Ok(Self(cleaned))
    }
}

/// Errors that can occur when parsing an InstanceId
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceIdError {
    Empty,
    Reserved(String),
}

impl fmt::Display for InstanceIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceIdError::Empty => write!(f, "Instance identifier is empty"),
            InstanceIdError::Reserved(id) => {
                write!(f, "Instance identifier {:?} is reserved", id)
            }
        }
    }
}

impl std::error::Error for InstanceIdError {}

/// Channel and key names derived from the configured prefix
///
/// - publish key: `{prefix}:{document}:{instance}`
/// - subscribe pattern: `{prefix}:{document}:*` (glob-escaped)
/// - lock key: `{prefix}:{document}:lock`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelKeys {
    prefix: String,
}

impl ChannelKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn base(&self, document_name: &str) -> String {
        format!("{}{}{}", self.prefix, SEPARATOR, document_name)
    }

    pub fn publish_key(&self, document_name: &str, instance: &InstanceId) -> String {
        format!("{}{}{}", self.base(document_name), SEPARATOR, instance)
    }

    pub fn subscribe_pattern(&self, document_name: &str) -> String {
        format!("{}{}*", escape_glob(&self.base(document_name)), SEPARATOR)
    }

    pub fn lock_key(&self, document_name: &str) -> String {
        format!("{}{}{}", self.base(document_name), SEPARATOR, LOCK_SUFFIX)
    }

    /// Split a channel name into document name and publishing instance
    ///
    /// The known prefix is stripped from the front and the instance id is
    /// taken from the last separator, so separators inside the prefix or the
    /// document name are never ambiguous.
    pub fn parse<'a>(&self, channel: &'a str) -> Option<ChannelName<'a>> {
        let rest = channel
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix(SEPARATOR)?;
        let (document_name, instance_id) = rest.rsplit_once(SEPARATOR)?;
        if instance_id.is_empty() {
            return None;
        }
        Some(ChannelName {
            document_name,
            instance_id,
        })
    }
}

/// Components recovered from a publish key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelName<'a> {
    pub document_name: &'a str,
    pub instance_id: &'a str,
}

/// True when the channel was published by `own`
pub fn is_echo(channel: &ChannelName<'_>, own: &InstanceId) -> bool {
    channel.instance_id == own.as_str()
}

/// Escape glob metacharacters so `s` only matches itself
pub fn escape_glob(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Glob matching with the semantics of Redis pattern subscriptions
///
/// Supports `*`, `?`, `[abc]`, `[^abc]`, `[a-z]` and `\` escapes.
pub fn glob_match(pattern: &str, subject: &str) -> bool {
    matches(pattern.as_bytes(), subject.as_bytes())
}

fn matches(mut p: &[u8], mut s: &[u8]) -> bool {
    while let Some(&c) = p.first() {
        match c {
            b'*' => {
                while p.first() == Some(&b'*') {
                    p = &p[1..];
                }
                if p.is_empty() {
                    return true;
                }
                return (0..=s.len()).any(|i| matches(p, &s[i..]));
            }
            b'?' => {
                if s.is_empty() {
                    return false;
                }
                p = &p[1..];
                s = &s[1..];
            }
            b'[' => {
                let Some((&ch, rest)) = s.split_first() else {
                    return false;
                };
                let (matched, consumed) = match_class(&p[1..], ch);
                if !matched {
                    return false;
                }
                p = &p[1 + consumed..];
                s = rest;
            }
            b'\\' if p.len() >= 2 => {
                if s.first() != Some(&p[1]) {
                    return false;
                }
                p = &p[2..];
                s = &s[1..];
            }
            _ => {
                if s.first() != Some(&c) {
                    return false;
                }
                p = &p[1..];
                s = &s[1..];
            }
        }
    }
    s.is_empty()
}

/// Match `ch` against a class body (the bytes after `[`)
///
/// Returns whether it matched and how many body bytes were consumed,
/// including the closing `]`. An unterminated class runs to the end of the
/// pattern.
fn match_class(body: &[u8], ch: u8) -> (bool, usize) {
    let mut i = 0;
    let negate = body.first() == Some(&b'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < body.len() && body[i] != b']' {
        if body[i] == b'\\' && i + 1 < body.len() {
            matched |= body[i + 1] == ch;
            i += 2;
        } else if i + 2 < body.len() && body[i + 1] == b'-' && body[i + 2] != b']' {
            let (lo, hi) = if body[i] <= body[i + 2] {
                (body[i], body[i + 2])
            } else {
                (body[i + 2], body[i])
            };
            matched |= lo <= ch && ch <= hi;
            i += 3;
        } else {
            matched |= body[i] == ch;
            i += 1;
        }
    }

    let consumed = if i < body.len() { i + 1 } else { i };
    (matched != negate, consumed)
}
