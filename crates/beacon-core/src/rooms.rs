//! Room subscription tracker.
//!
//! Records which rooms the client *intends* to receive events for, independent
//! of whether a transport is currently live. The tracker never talks to the
//! network itself: it produces [`Envelope`]s that the connection state machine
//! sends when (and only when) it is connected, and [`RoomTracker::replay`]
//! rebuilds server-side membership after every successful (re)connect.
//!
//! How a kind of room is joined on the wire is configuration
//! ([`RoomProtocol`]): post-like rooms use a "join one"/"leave one" pair,
//! conversation-like rooms use a single "join many" instruction and have no
//! leave primitive (the server drops membership on disconnect).

use std::collections::BTreeSet;

use serde_json::Value;

use crate::envelope::Envelope;

/// Kind of server-side broadcast group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RoomKind {
    /// Per-post room (likes, comments, reposts on one post).
    Post,
    /// Per-conversation room (chat messages, typing, read receipts).
    Conversation,
}

impl RoomKind {
    /// Every kind, in replay order.
    pub const ALL: [RoomKind; 2] = [RoomKind::Post, RoomKind::Conversation];
}

/// How join instructions for a room kind are shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinShape {
    /// One instruction per room, payload is the room id.
    One,
    /// One instruction for all rooms, payload is an array of ids.
    Many,
}

/// Wire primitives for one room kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomPrimitives {
    /// Event name of the join instruction.
    pub join_event: String,
    /// Event name of the leave instruction, if the server supports one.
    pub leave_event: Option<String>,
    /// Payload shape of the join instruction.
    pub shape: JoinShape,
}

/// Wire primitives for every room kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomProtocol {
    /// Post rooms.
    pub post: RoomPrimitives,
    /// Conversation rooms.
    pub conversation: RoomPrimitives,
}

impl Default for RoomProtocol {
    fn default() -> Self {
        Self {
            post: RoomPrimitives {
                join_event: "joinPost".to_string(),
                leave_event: Some("leavePost".to_string()),
                shape: JoinShape::One,
            },
            conversation: RoomPrimitives {
                join_event: "joinConversations".to_string(),
                leave_event: None,
                shape: JoinShape::Many,
            },
        }
    }
}

impl RoomProtocol {
    /// Primitives for `kind`.
    pub fn primitives(&self, kind: RoomKind) -> &RoomPrimitives {
        match kind {
            RoomKind::Post => &self.post,
            RoomKind::Conversation => &self.conversation,
        }
    }
}

/// Set of rooms the client wants to be in.
///
/// Ids are kept ordered so replay output is deterministic.
#[derive(Debug, Clone)]
pub struct RoomTracker {
    protocol: RoomProtocol,
    posts: BTreeSet<String>,
    conversations: BTreeSet<String>,
}

impl RoomTracker {
    /// Empty tracker using `protocol` for instruction shapes.
    pub fn new(protocol: RoomProtocol) -> Self {
        Self { protocol, posts: BTreeSet::new(), conversations: BTreeSet::new() }
    }

    fn set(&self, kind: RoomKind) -> &BTreeSet<String> {
        match kind {
            RoomKind::Post => &self.posts,
            RoomKind::Conversation => &self.conversations,
        }
    }

    fn set_mut(&mut self, kind: RoomKind) -> &mut BTreeSet<String> {
        match kind {
            RoomKind::Post => &mut self.posts,
            RoomKind::Conversation => &mut self.conversations,
        }
    }

    /// Record intent to be in `id`. Returns `false` if it was already tracked.
    pub fn join(&mut self, kind: RoomKind, id: &str) -> bool {
        if self.set(kind).contains(id) {
            return false;
        }
        self.set_mut(kind).insert(id.to_string())
    }

    /// Drop intent to be in `id`. Returns `false` if it was not tracked.
    pub fn leave(&mut self, kind: RoomKind, id: &str) -> bool {
        self.set_mut(kind).remove(id)
    }

    /// Whether `id` is tracked.
    pub fn contains(&self, kind: RoomKind, id: &str) -> bool {
        self.set(kind).contains(id)
    }

    /// Tracked ids of `kind`, in order.
    pub fn rooms(&self, kind: RoomKind) -> impl Iterator<Item = &str> {
        self.set(kind).iter().map(String::as_str)
    }

    /// Total number of tracked rooms across kinds.
    pub fn len(&self) -> usize {
        self.posts.len() + self.conversations.len()
    }

    /// True when no rooms are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every room (sign-out).
    pub fn clear(&mut self) {
        self.posts.clear();
        self.conversations.clear();
    }

    /// Instruction joining a single room.
    pub fn join_instruction(&self, kind: RoomKind, id: &str) -> Envelope {
        let primitives = self.protocol.primitives(kind);
        let data = match primitives.shape {
            JoinShape::One => Value::String(id.to_string()),
            JoinShape::Many => Value::Array(vec![Value::String(id.to_string())]),
        };
        Envelope::new(primitives.join_event.clone(), data)
    }

    /// Instruction leaving a single room, if the kind has a leave primitive.
    pub fn leave_instruction(&self, kind: RoomKind, id: &str) -> Option<Envelope> {
        let event = self.protocol.primitives(kind).leave_event.as_ref()?;
        Some(Envelope::new(event.clone(), Value::String(id.to_string())))
    }

    /// Instructions re-joining every tracked room.
    ///
    /// Empty kinds produce nothing; `Many` kinds produce a single instruction.
    pub fn replay(&self) -> Vec<Envelope> {
        let mut out = Vec::new();
        for kind in RoomKind::ALL {
            let set = self.set(kind);
            if set.is_empty() {
                continue;
            }
            let primitives = self.protocol.primitives(kind);
            match primitives.shape {
                JoinShape::One => {
                    out.extend(set.iter().map(|id| self.join_instruction(kind, id)));
                },
                JoinShape::Many => {
                    let ids = set.iter().cloned().map(Value::String).collect();
                    out.push(Envelope::new(primitives.join_event.clone(), Value::Array(ids)));
                },
            }
        }
        out
    }
}

impl Default for RoomTracker {
    fn default() -> Self {
        Self::new(RoomProtocol::default())
    }
}
