//! Application-protocol negotiation.
//!
//! # Wire format
//! ```text
//! +--------+-------------------+--------+-------------------+----
//! | len u8 | len bytes (ASCII) | len u8 | len bytes (ASCII) | ...
//! +--------+-------------------+--------+-------------------+----
//! ```
//!
//! The selecting side walks its own preference list in order and, for each
//! entry, scans the offered list for an exact byte match. The first
//! preference that appears anywhere in the offered list wins, regardless of
//! where it sits in the offered list. No match means the handshake goes on
//! without an application protocol.
//!
//! The server advertises its list and the client's preference order
//! decides. Under ALPN the listener sees the client's list in the
//! ClientHello, so it applies [`select_next_protocol`] with its own list as
//! the offer and the client's list as the preferences, which gives the same
//! answer the client would have picked.

use std::fmt;

use crate::error::{Result, TransportError};

/// Longest protocol name a one-byte length prefix can carry.
pub const MAX_PROTOCOL_NAME_LEN: usize = u8::MAX as usize;

/// Attribute name under which the negotiated protocol is published.
pub const NEGOTIATED_PROTOCOL: &str = "negotiated-protocol";

/// A length-prefixed protocol list in its exact wire encoding.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ProtocolList {
    wire: Vec<u8>,
}

impl ProtocolList {
    /// Encode protocol names. Empty names and names longer than
    /// [`MAX_PROTOCOL_NAME_LEN`] are rejected.
    pub fn encode<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let mut wire = Vec::new();
        for name in names {
            let name = name.as_ref();
            if name.is_empty() {
                return Err(TransportError::config("empty protocol name"));
            }
            if name.len() > MAX_PROTOCOL_NAME_LEN {
                return Err(TransportError::config(format!(
                    "protocol name of {} bytes exceeds {}",
                    name.len(),
                    MAX_PROTOCOL_NAME_LEN
                )));
            }
            wire.push(name.len() as u8);
            wire.extend_from_slice(name);
        }
        Ok(Self { wire })
    }

    /// Wrap bytes received from a peer without validating them.
    ///
    /// Malformed input is detected lazily by [`ProtocolList::entries`].
    pub fn from_wire(wire: impl Into<Vec<u8>>) -> Self {
        Self { wire: wire.into() }
    }

    pub fn as_wire(&self) -> &[u8] {
        &self.wire
    }

    pub fn is_empty(&self) -> bool {
        self.wire.is_empty()
    }

    /// Iterate entries. Yields `Err(Malformed)` once and then stops when an
    /// entry is zero-length or claims more bytes than remain.
    pub fn entries(&self) -> Entries<'_> {
        Entries {
            rest: &self.wire,
            failed: false,
        }
    }

    /// Decode every entry, or `None` if the list is malformed.
    pub fn to_vec(&self) -> Option<Vec<Vec<u8>>> {
        self.entries()
            .map(|entry| entry.map(<[u8]>::to_vec))
            .collect::<std::result::Result<Vec<_>, _>>()
            .ok()
    }
}

impl fmt::Debug for ProtocolList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for entry in self.entries() {
            match entry {
                Ok(name) => list.entry(&String::from_utf8_lossy(name)),
                Err(_) => list.entry(&"<malformed>"),
            };
        }
        list.finish()
    }
}

/// Marker for a length prefix that does not fit the remaining buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Malformed;

/// Bounds-checked iterator over a [`ProtocolList`].
pub struct Entries<'a> {
    rest: &'a [u8],
    failed: bool,
}

impl<'a> Iterator for Entries<'a> {
    type Item = std::result::Result<&'a [u8], Malformed>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let (&len, tail) = self.rest.split_first()?;
        let len = len as usize;
        if len == 0 || len > tail.len() {
            self.failed = true;
            return Some(Err(Malformed));
        }
        let (name, rest) = tail.split_at(len);
        self.rest = rest;
        Some(Ok(name))
    }
}

/// Pick the first entry of `preferences` that also appears in `offered`.
///
/// Returns `None` when nothing matches or either list is malformed. Both
/// lists are decoded in full first, so a bad length byte anywhere in either
/// list rules out a selection even when an earlier entry would match.
pub fn select_next_protocol(offered: &ProtocolList, preferences: &ProtocolList) -> Option<Vec<u8>> {
    let offered = offered.to_vec()?;
    let preferences = preferences.to_vec()?;
    preferences
        .into_iter()
        .find(|preference| offered.contains(preference))
}

/// Holds one side's preference list and applies the selection rule.
#[derive(Debug, Clone, Default)]
pub struct Negotiator {
    preferences: ProtocolList,
}

impl Negotiator {
    pub fn new(preferences: ProtocolList) -> Self {
        Self { preferences }
    }

    /// Build from plain names, e.g. `["h2", "http/1.1"]`.
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Ok(Self::new(ProtocolList::encode(names)?))
    }

    /// The list this side advertises, in wire encoding.
    pub fn advertise(&self) -> &ProtocolList {
        &self.preferences
    }

    /// Decoded preference entries, in order.
    pub fn preferences(&self) -> Vec<Vec<u8>> {
        self.preferences.to_vec().unwrap_or_default()
    }

    pub fn is_enabled(&self) -> bool {
        !self.preferences.is_empty()
    }

    /// Server role: pick on behalf of a client whose ordered list is
    /// `client_preferences`. The client's order wins; this side's list is
    /// only the offer.
    pub fn select_for_client(&self, client_preferences: &ProtocolList) -> Option<Vec<u8>> {
        select_next_protocol(&self.preferences, client_preferences)
    }
}
