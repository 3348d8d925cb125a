//! The boundary between received events and whatever renders them.
//!
//! Subscribers fold every received event into an [`EventState`] and hand
//! that state to a [`Format`], which returns the display string. The core
//! only promises to call the format in receipt order; what the string looks
//! like is the format's business.
//!
//! [`Template`] is the built-in format. Placeholders:
//!
//! | placeholder   | expands to                                             |
//! |---------------|--------------------------------------------------------|
//! | `{type}`      | type of the latest event                               |
//! | `{id}`        | id of the latest event                                 |
//! | `{args}`      | args of the latest event, space separated              |
//! | `{N}`         | arg `N` (0-based) of the latest event                  |
//! | `{@TYPE}`     | args of the most recent event of `TYPE`, or empty      |
//! | `{@TYPE/ID}`  | args of the event keyed `(TYPE, ID)`, or empty         |
//!
//! `{{` and `}}` produce literal braces.

use std::collections::HashMap;

use thiserror::Error;

use hh_types::event::Event;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("unclosed '{{' at byte {0} in template")]
    Unclosed(usize),
    #[error("stray '}}' at byte {0} in template")]
    Stray(usize),
    #[error("unknown placeholder {{{0}}}")]
    UnknownPlaceholder(String),
    #[error("event has no argument {index} (it has {available})")]
    MissingArg { index: usize, available: usize },
}

/// Maps accumulated event state to a display string.
pub trait Format: Send + Sync {
    fn render(&self, state: &EventState) -> Result<String, FormatError>;
}

impl<F> Format for F
where
    F: Fn(&EventState) -> Result<String, FormatError> + Send + Sync,
{
    fn render(&self, state: &EventState) -> Result<String, FormatError> {
        self(state)
    }
}

/// Last-seen event per `(type, id)` key, plus the most recent event overall.
///
/// A newer event for a key replaces the older one outright.
#[derive(Debug, Default, Clone)]
pub struct EventState {
    latest: Option<Event>,
    by_key: HashMap<(String, String), Event>,
    /// Most recently updated id for each type.
    last_id: HashMap<String, String>,
}

impl EventState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `event`, returning the value it replaced for its key.
    pub fn apply(&mut self, event: Event) -> Option<Event> {
        let key = (event.kind().to_string(), event.id().to_string());
        self.last_id
            .insert(event.kind().to_string(), event.id().to_string());
        self.latest = Some(event.clone());
        self.by_key.insert(key, event)
    }

    pub fn latest(&self) -> Option<&Event> {
        self.latest.as_ref()
    }

    pub fn get(&self, kind: &str, id: &str) -> Option<&Event> {
        self.by_key.get(&(kind.to_string(), id.to_string()))
    }

    /// The most recently updated event of `kind`, whatever its id.
    pub fn latest_of(&self, kind: &str) -> Option<&Event> {
        let id = self.last_id.get(kind)?;
        self.get(kind, id)
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Type,
    Id,
    Args,
    Arg(usize),
    Latest(String),
    Keyed(String, String),
}

/// A parsed placeholder template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, FormatError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    literal.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(FormatError::Stray(pos)),
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some((_, '}')) => break,
                            Some((_, ch)) => name.push(ch),
                            None => return Err(FormatError::Unclosed(pos)),
                        }
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(placeholder(&name)?);
                }
                _ => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self { segments })
    }
}

fn placeholder(name: &str) -> Result<Segment, FormatError> {
    let segment = match name {
        "type" => Segment::Type,
        "id" => Segment::Id,
        "args" => Segment::Args,
        _ if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) => {
            let index = name
                .parse()
                .map_err(|_| FormatError::UnknownPlaceholder(name.to_string()))?;
            Segment::Arg(index)
        }
        _ => match name.strip_prefix('@') {
            Some(rest) if !rest.is_empty() => match rest.split_once('/') {
                Some((kind, id)) => Segment::Keyed(kind.to_string(), id.to_string()),
                None => Segment::Latest(rest.to_string()),
            },
            _ => return Err(FormatError::UnknownPlaceholder(name.to_string())),
        },
    };
    Ok(segment)
}

impl std::str::FromStr for Template {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Template::parse(s)
    }
}

impl Format for Template {
    fn render(&self, state: &EventState) -> Result<String, FormatError> {
        let latest = state.latest();
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Type => out.push_str(latest.map(Event::kind).unwrap_or_default()),
                Segment::Id => out.push_str(latest.map(Event::id).unwrap_or_default()),
                Segment::Args => {
                    if let Some(e) = latest {
                        out.push_str(&e.args().join(" "));
                    }
                }
                Segment::Arg(index) => {
                    let args = latest.map(Event::args).unwrap_or_default();
                    let arg = args.get(*index).ok_or(FormatError::MissingArg {
                        index: *index,
                        available: args.len(),
                    })?;
                    out.push_str(arg);
                }
                Segment::Latest(kind) => {
                    if let Some(e) = state.latest_of(kind) {
                        out.push_str(&e.args().join(" "));
                    }
                }
                Segment::Keyed(kind, id) => {
                    if let Some(e) = state.get(kind, id) {
                        out.push_str(&e.args().join(" "));
                    }
                }
            }
        }
        Ok(out)
    }
}
