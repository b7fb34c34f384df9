//! Extension negotiation and the per-frame transform pipeline.
//!
//! The client offers every installed extension in `Sec-WebSocket-Extensions`. Once the server
//! answers, [`negotiate`] keeps the installed extensions the server echoed, in the order the
//! server listed them, and gives each its own [`ExtensionContext`].

use crate::{Error, Frame};
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt::{self, Debug},
    sync::Arc,
};
use tracing::{debug, warn};

/// A `name` or `name=value` pair from an extension token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionParameter {
    pub name: String,
    pub value: Option<String>,
}

impl ExtensionParameter {
    pub fn new(name: impl Into<String>, value: Option<&str>) -> Self {
        ExtensionParameter {
            name: name.into(),
            value: value.map(String::from),
        }
    }
}

/// One comma-separated entry of a `Sec-WebSocket-Extensions` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionToken {
    pub name: String,
    pub parameters: Vec<ExtensionParameter>,
}

impl fmt::Display for ExtensionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for parameter in &self.parameters {
            match &parameter.value {
                Some(value) => write!(f, "; {}={}", parameter.name, value)?,
                None => write!(f, "; {}", parameter.name)?,
            }
        }
        Ok(())
    }
}

/// Parses every value of the `Sec-WebSocket-Extensions` header.
///
/// Quoted parameter values are unquoted. Empty entries are skipped.
pub fn parse_header<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<ExtensionToken> {
    let mut tokens = Vec::new();
    for value in values {
        for entry in split_outside_quotes(value, ',') {
            let mut parts = split_outside_quotes(entry, ';').into_iter();
            let Some(name) = parts.next().map(str::trim).filter(|name| !name.is_empty()) else {
                continue;
            };

            let parameters = parts
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| match part.split_once('=') {
                    Some((name, value)) => ExtensionParameter {
                        name: name.trim().into(),
                        value: Some(value.trim().trim_matches('"').into()),
                    },
                    None => ExtensionParameter {
                        name: part.into(),
                        value: None,
                    },
                })
                .collect();

            tokens.push(ExtensionToken {
                name: name.into(),
                parameters,
            });
        }
    }
    tokens
}

fn split_outside_quotes(value: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quoted = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            '"' => quoted = !quoted,
            c if c == separator && !quoted => {
                parts.push(&value[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}

/// Per-connection state owned by one negotiated extension.
///
/// Values are keyed by type, so an extension stores whatever it needs without string keys.
pub struct ExtensionContext {
    properties: HashMap<TypeId, Box<dyn Any + Send>>,
    max_message_size: usize,
}

impl Default for ExtensionContext {
    fn default() -> Self {
        ExtensionContext::new(usize::MAX)
    }
}

impl ExtensionContext {
    pub fn new(max_message_size: usize) -> Self {
        ExtensionContext {
            properties: HashMap::new(),
            max_message_size,
        }
    }

    /// Largest message the connection accepts. Transforms that expand payloads stay within it.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn insert<T: Any + Send>(&mut self, value: T) -> Option<T> {
        self.properties
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast().ok().map(|old| *old))
    }

    pub fn get<T: Any + Send>(&self) -> Option<&T> {
        self.properties
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref())
    }

    pub fn get_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.properties
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut())
    }

    pub fn remove<T: Any + Send>(&mut self) -> Option<T> {
        self.properties
            .remove(&TypeId::of::<T>())
            .and_then(|old| old.downcast().ok().map(|old| *old))
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

impl Debug for ExtensionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionContext")
            .field("entries", &self.properties.len())
            .finish()
    }
}

/// A negotiable frame transform.
///
/// Only `name` is required. An extension that only needs to be negotiated leaves the
/// transform hooks at their pass-through defaults.
pub trait Extension: Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Parameters offered in the upgrade request.
    fn parameters(&self) -> Vec<ExtensionParameter> {
        Vec::new()
    }

    /// RSV bits (1, 2 or 3) this extension sets on the wire.
    fn reserved_bits(&self) -> Vec<u8> {
        Vec::new()
    }

    /// Called once with the parameters the server accepted, before any frame flows.
    fn on_handshake_response(
        &self,
        _context: &mut ExtensionContext,
        _parameters: &[ExtensionParameter],
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Rewrites a frame from the peer. `Ok(None)` leaves it as it is.
    fn process_incoming(
        &self,
        _context: &mut ExtensionContext,
        _frame: &Frame,
    ) -> Result<Option<Frame>, Error> {
        Ok(None)
    }

    /// Rewrites a frame about to be sent. `Ok(None)` leaves it as it is.
    fn process_outgoing(
        &self,
        _context: &mut ExtensionContext,
        _frame: &Frame,
    ) -> Result<Option<Frame>, Error> {
        Ok(None)
    }

    /// Called exactly once when the connection closes.
    fn destroy(&self, _context: &mut ExtensionContext) {}
}

/// The request token offered for an installed extension.
pub fn offer(extension: &dyn Extension) -> ExtensionToken {
    ExtensionToken {
        name: extension.name().into(),
        parameters: extension.parameters(),
    }
}

struct Negotiated {
    extension: Arc<dyn Extension>,
    context: ExtensionContext,
}

/// Extensions both sides agreed on, in negotiated order.
#[derive(Default)]
pub struct NegotiatedExtensions {
    entries: Vec<Negotiated>,
    destroyed: bool,
}

impl Debug for NegotiatedExtensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Matches the server's tokens against `installed`.
///
/// For each response token in order, the first installed extension with the same name is
/// selected unless one by that name was already selected. Tokens naming nothing installed are
/// ignored. Every context is created with `max_message_size`.
pub fn negotiate(
    response: &[ExtensionToken],
    installed: &[Arc<dyn Extension>],
    max_message_size: usize,
) -> Result<NegotiatedExtensions, Error> {
    let mut negotiated = NegotiatedExtensions::default();

    for token in response {
        if negotiated.names().any(|name| name == token.name) {
            debug!(extension = %token.name, "duplicate extension in response ignored");
            continue;
        }

        let Some(extension) = installed
            .iter()
            .find(|extension| extension.name() == token.name)
        else {
            debug!(extension = %token.name, "server returned an extension that is not installed");
            continue;
        };

        let mut context = ExtensionContext::new(max_message_size);
        extension.on_handshake_response(&mut context, &token.parameters)?;
        debug!(extension = %token.name, "installed extension");
        negotiated.entries.push(Negotiated {
            extension: Arc::clone(extension),
            context,
        });
    }

    Ok(negotiated)
}

impl NegotiatedExtensions {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.extension.name())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn reserved_bits(&self) -> impl Iterator<Item = u8> + '_ {
        self.entries
            .iter()
            .flat_map(|entry| entry.extension.reserved_bits())
    }

    /// Runs every extension's incoming transform in negotiated order.
    ///
    /// A failing extension is skipped for this frame, except on [`Error::BufferOverflow`],
    /// which ends the pipeline.
    pub fn incoming(&mut self, mut frame: Frame) -> Result<Frame, Error> {
        for entry in &mut self.entries {
            let result = entry.extension.process_incoming(&mut entry.context, &frame);
            frame = apply(entry.extension.name(), "incoming", frame, result)?;
        }
        Ok(frame)
    }

    /// Runs every extension's outgoing transform in negotiated order.
    pub fn outgoing(&mut self, mut frame: Frame) -> Result<Frame, Error> {
        for entry in &mut self.entries {
            let result = entry.extension.process_outgoing(&mut entry.context, &frame);
            frame = apply(entry.extension.name(), "outgoing", frame, result)?;
        }
        Ok(frame)
    }

    /// Tells every extension the connection is gone. Later calls do nothing.
    pub fn destroy(&mut self) {
        if std::mem::replace(&mut self.destroyed, true) {
            return;
        }
        for entry in &mut self.entries {
            entry.extension.destroy(&mut entry.context);
        }
    }
}

fn apply(
    extension: &str,
    direction: &'static str,
    frame: Frame,
    result: Result<Option<Frame>, Error>,
) -> Result<Frame, Error> {
    match result {
        Ok(Some(rewritten)) => Ok(rewritten),
        Ok(None) => Ok(frame),
        Err(err @ Error::BufferOverflow { .. }) => Err(err),
        Err(err) => {
            warn!(extension, direction, %err, "extension transform failed, passing frame through");
            Ok(frame)
        }
    }
}

impl Drop for NegotiatedExtensions {
    fn drop(&mut self) {
        self.destroy();
    }
}
