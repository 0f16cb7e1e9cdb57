//! RFC 7235 challenge parsing.
//!
//! `WWW-Authenticate` and `Proxy-Authenticate` carry a comma-separated
//! list of challenges, each a scheme name optionally followed by either a
//! token68 blob or its own comma-separated auth params. The two levels of
//! comma make the grammar ambiguous for naive splitting, so the parser
//! tracks quoted strings and decides per segment whether it opens a new
//! challenge or extends the current one.

use http::HeaderValue;

/// One parsed authentication challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    /// Lowercased scheme name, e.g. `basic`.
    pub scheme: String,
    /// Auth params in order of appearance, names lowercased, values
    /// unquoted.
    pub params: Vec<(String, String)>,
    /// The token68 form, for schemes that use it instead of params.
    pub token68: Option<String>,
}

impl Challenge {
    fn new(scheme: &str) -> Challenge {
        Challenge {
            scheme: scheme.to_ascii_lowercase(),
            params: Vec::new(),
            token68: None,
        }
    }

    /// Look up a param by (case-insensitive) name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The challenge realm, when present.
    pub fn realm(&self) -> Option<&str> {
        self.param("realm")
    }
}

/// Parse every challenge carried by the given header values.
///
/// Malformed segments are skipped rather than failing the whole header;
/// servers in the wild disagree on quoting more than on anything else.
pub(crate) fn parse_challenges<'a, I>(values: I) -> Vec<Challenge>
where
    I: IntoIterator<Item = &'a HeaderValue>,
{
    let mut challenges = Vec::new();

    for value in values {
        let Ok(text) = value.to_str() else { continue };
        for segment in split_unquoted_commas(text) {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            match classify(segment) {
                Segment::Scheme(name) => challenges.push(Challenge::new(name)),
                Segment::SchemeWithParam(name, key, value) => {
                    let mut challenge = Challenge::new(name);
                    challenge.params.push((key, value));
                    challenges.push(challenge);
                }
                Segment::SchemeWithToken68(name, token) => {
                    let mut challenge = Challenge::new(name);
                    challenge.token68 = Some(token.to_owned());
                    challenges.push(challenge);
                }
                Segment::Param(key, value) => {
                    if let Some(current) = challenges.last_mut() {
                        current.params.push((key, value));
                    }
                }
                Segment::Junk => {}
            }
        }
    }

    challenges
}

enum Segment<'a> {
    Scheme(&'a str),
    SchemeWithParam(&'a str, String, String),
    SchemeWithToken68(&'a str, String),
    Param(String, String),
    Junk,
}

fn classify(segment: &str) -> Segment<'_> {
    match segment.split_once(char::is_whitespace) {
        Some((first, rest)) => {
            let rest = rest.trim();
            if !is_token(first) {
                return Segment::Junk;
            }
            if let Some((key, value)) = parse_param(rest) {
                Segment::SchemeWithParam(first, key, value)
            } else if is_token68(rest) {
                Segment::SchemeWithToken68(first, rest.to_owned())
            } else {
                Segment::Junk
            }
        }
        None => {
            if let Some((key, value)) = parse_param(segment) {
                Segment::Param(key, value)
            } else if is_token(segment) {
                Segment::Scheme(segment)
            } else {
                Segment::Junk
            }
        }
    }
}

fn parse_param(text: &str) -> Option<(String, String)> {
    let (key, value) = text.split_once('=')?;
    let key = key.trim();
    if !is_token(key) {
        return None;
    }
    let value = value.trim();
    let value = if value.starts_with('"') {
        unquote(value)?
    } else {
        if value.is_empty() || !is_token(value) {
            return None;
        }
        value.to_owned()
    };
    Some((key.to_ascii_lowercase(), value))
}

fn unquote(text: &str) -> Option<String> {
    let inner = text.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    if escaped {
        return None;
    }
    Some(out)
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

fn is_token68(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    let trimmed = s.trim_end_matches('=');
    !trimmed.is_empty()
        && trimmed
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-._~+/".contains(&b))
}

/// Split on commas that sit outside quoted strings.
fn split_unquoted_commas(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;

    for (idx, c) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&text[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}
