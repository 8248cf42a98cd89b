//! Composite clientid and stateid encoding.
//!
//! Identifiers handed to clients are not random tokens: they embed the epoch
//! they were minted in and the cluster node that minted them, so a lookup
//! miss can be classified as stale (older epoch or another node), expired
//! (this epoch, owner gone) or bad (never valid).
//!
//! Clientid (`u64`), most significant bit first:
//!
//! | bits  | width | field                                  |
//! |-------|-------|----------------------------------------|
//! | 63-36 | 28    | server start time (low 24 bits used)   |
//! | 35-32 | 4     | metacluster node id                    |
//! | 31-24 | 8     | cluster node id                        |
//! | 23-0  | 24    | per-epoch counter (client entry id)    |
//!
//! Stateid on the wire is `seqid:u32` followed by 12 opaque bytes, all
//! big-endian:
//!
//! | bytes | field                                                  |
//! |-------|--------------------------------------------------------|
//! | 0-3   | boottime: per-filesystem epoch, full 32-bit boot time  |
//! | 4-7   | ident: table entry id of the owning state              |
//! | 8-11  | tail word, see below                                   |
//!
//! Tail word:
//!
//! | bits  | width | field                                 |
//! |-------|-------|---------------------------------------|
//! | 31-30 | 2     | type tag (1 open, 2 lock, 3 deleg)    |
//! | 29-26 | 4     | metacluster node id                   |
//! | 25-18 | 8     | cluster node id                       |
//! | 17-0  | 18    | lock-owner pid (lock ids only)        |

use crate::config::NodeConfig;
use crate::error::StateError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Window of the server start time embedded in identifiers.
pub const ID_TIME_MASK: u32 = 0x00ff_ffff;
/// Size of a protocol verifier.
pub const VERIFIER_SIZE: usize = 8;
/// Largest per-epoch client counter.
pub const MAX_CLIENT_COUNTER: u32 = 0x00ff_ffff;
/// Mask of the pid field embedded in lock stateids.
pub const PID_MASK: u32 = 0x0003_ffff;

const START_SHIFT: u32 = 36;
const START_MASK: u64 = 0x0fff_ffff;
const MC_SHIFT: u32 = 32;
const CL_SHIFT: u32 = 24;

const TAG_SHIFT: u32 = 30;
const TAIL_MC_SHIFT: u32 = 26;
const TAIL_CL_SHIFT: u32 = 18;

/// Client-supplied verifier.
pub type Verifier = [u8; VERIFIER_SIZE];

/// Truncates a start time to the window embedded in identifiers.
pub fn id_time(start_secs: u64) -> u32 {
    (start_secs as u32) & ID_TIME_MASK
}

/// Where an identifier was minted relative to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOrigin {
    /// Clustering not configured; origin checks are skipped
    NotConfigured,
    /// Minted by this node
    Local,
    /// Minted by another cluster or metacluster member
    Foreign,
}

/// Cluster identity embedded in every identifier this node mints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeIdent {
    configured: bool,
    cluster_node_id: u8,
    metacluster_id: u8,
}

impl NodeIdent {
    /// Builds the identity from configuration.
    pub fn from_config(node: &NodeConfig) -> Self {
        match node.cluster_node_id {
            Some(cl) => Self {
                configured: true,
                cluster_node_id: cl,
                metacluster_id: node.metacluster_id.unwrap_or(0) & 0x0f,
            },
            None => Self::default(),
        }
    }

    /// A clustered identity.
    pub fn clustered(cluster_node_id: u8, metacluster_id: u8) -> Self {
        Self {
            configured: true,
            cluster_node_id,
            metacluster_id: metacluster_id & 0x0f,
        }
    }

    /// Cluster node id.
    pub fn cluster_node_id(&self) -> u8 {
        self.cluster_node_id
    }

    /// Metacluster id, four bits.
    pub fn metacluster_id(&self) -> u8 {
        self.metacluster_id
    }

    /// False when clustering is off and origin checks are skipped.
    pub fn is_configured(&self) -> bool {
        self.configured
    }

    /// Combined node id: cluster id in the low byte, metacluster above it.
    pub fn node_id(&self) -> u16 {
        u16::from(self.cluster_node_id) | (u16::from(self.metacluster_id) << 8)
    }

    /// Classifies the node fields carried by an identifier.
    pub fn origin(&self, cluster_node_id: u8, metacluster_id: u8) -> NodeOrigin {
        if !self.configured {
            NodeOrigin::NotConfigured
        } else if cluster_node_id == self.cluster_node_id && metacluster_id == self.metacluster_id
        {
            NodeOrigin::Local
        } else {
            NodeOrigin::Foreign
        }
    }
}

/// Composite NFSv4 clientid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl ClientId {
    /// Packs a clientid from its fields.
    pub fn pack(start_time: u32, node: &NodeIdent, counter: u32) -> Self {
        let start = u64::from(start_time) & START_MASK;
        let mc = u64::from(node.metacluster_id & 0x0f);
        let cl = u64::from(node.cluster_node_id);
        let ctr = u64::from(counter & MAX_CLIENT_COUNTER);
        ClientId((start << START_SHIFT) | (mc << MC_SHIFT) | (cl << CL_SHIFT) | ctr)
    }

    /// 24-bit start time of the instance that minted the id.
    pub fn start_time(&self) -> u32 {
        ((self.0 >> START_SHIFT) & START_MASK) as u32
    }

    /// Metacluster of the minting node.
    pub fn metacluster_id(&self) -> u8 {
        ((self.0 >> MC_SHIFT) & 0x0f) as u8
    }

    /// Cluster node that minted the id.
    pub fn cluster_node_id(&self) -> u8 {
        ((self.0 >> CL_SHIFT) & 0xff) as u8
    }

    /// Combined node id in [`NodeIdent::node_id`] form.
    pub fn node_id(&self) -> u16 {
        u16::from(self.cluster_node_id()) | (u16::from(self.metacluster_id()) << 8)
    }

    /// Per-epoch counter; equals the client's table entry id.
    pub fn counter(&self) -> u32 {
        (self.0 & u64::from(MAX_CLIENT_COUNTER)) as u32
    }

    /// Wire form.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// SETCLIENTID_CONFIRM verifier: the client counter plus a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfirmVerifier {
    /// Client table entry id
    pub counter: u32,
    /// Bumped on each new registration attempt
    pub generation: u32,
}

impl ConfirmVerifier {
    /// First verifier for client `counter`.
    pub fn new(counter: u32) -> Self {
        Self {
            counter,
            generation: 0,
        }
    }

    /// Verifier handed out for the next registration attempt.
    pub fn next(&self) -> Self {
        Self {
            counter: self.counter,
            generation: self.generation.wrapping_add(1),
        }
    }

    /// Wire form of the verifier.
    pub fn to_bytes(&self) -> Verifier {
        let mut out = [0u8; VERIFIER_SIZE];
        out[0..4].copy_from_slice(&self.counter.to_be_bytes());
        out[4..8].copy_from_slice(&self.generation.to_be_bytes());
        out
    }

    /// Parses the wire form.
    pub fn from_bytes(bytes: &Verifier) -> Self {
        Self {
            counter: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            generation: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// Kind of state a stateid names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateKind {
    /// OPENID
    Open,
    /// LOCKID
    Lock,
    /// DELEGID
    Deleg,
}

impl StateKind {
    fn tag(self) -> u8 {
        match self {
            StateKind::Open => 1,
            StateKind::Lock => 2,
            StateKind::Deleg => 3,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(StateKind::Open),
            2 => Some(StateKind::Lock),
            3 => Some(StateKind::Deleg),
            _ => None,
        }
    }
}

/// Stateid as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateId4 {
    /// Change sequence
    pub seqid: u32,
    /// Opaque identity, see the module docs
    pub other: [u8; 12],
}

impl StateId4 {
    /// The all-zero anonymous stateid.
    pub const ANONYMOUS: StateId4 = StateId4 {
        seqid: 0,
        other: [0; 12],
    };

    /// The all-one read-bypass stateid.
    pub const READ_BYPASS: StateId4 = StateId4 {
        seqid: u32::MAX,
        other: [0xff; 12],
    };

    /// True for either reserved special stateid.
    pub fn is_special(&self) -> bool {
        *self == Self::ANONYMOUS || *self == Self::READ_BYPASS
    }

    /// Decodes the opaque part. Decoding never fails; an unknown type tag
    /// is reported by [`StateId::kind`].
    pub fn decode(&self) -> StateId {
        let o = &self.other;
        let boottime = u32::from_be_bytes([o[0], o[1], o[2], o[3]]);
        let ident = u32::from_be_bytes([o[4], o[5], o[6], o[7]]);
        let tail = u32::from_be_bytes([o[8], o[9], o[10], o[11]]);
        StateId {
            seqid: self.seqid,
            boottime,
            ident,
            tag: (tail >> TAG_SHIFT) as u8 & 0x03,
            metacluster_id: (tail >> TAIL_MC_SHIFT) as u8 & 0x0f,
            cluster_node_id: (tail >> TAIL_CL_SHIFT) as u8,
            pid: tail & PID_MASK,
        }
    }
}

/// Decoded stateid fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId {
    /// Change sequence
    pub seqid: u32,
    /// Epoch verifier of the filesystem that minted it
    pub boottime: u32,
    /// Table entry id of the state
    pub ident: u32,
    tag: u8,
    /// Metacluster of the minting node
    pub metacluster_id: u8,
    /// Cluster node that minted it
    pub cluster_node_id: u8,
    /// Lock-owner pid, zero for open and delegation ids
    pub pid: u32,
}

impl StateId {
    /// Mints a stateid with sequence zero.
    pub fn new(kind: StateKind, boottime: u32, ident: u32, node: &NodeIdent) -> Self {
        Self {
            seqid: 0,
            boottime,
            ident,
            tag: kind.tag(),
            metacluster_id: node.metacluster_id(),
            cluster_node_id: node.cluster_node_id(),
            pid: 0,
        }
    }

    /// Type tag, `None` for a tag no state kind uses.
    pub fn kind(&self) -> Option<StateKind> {
        StateKind::from_tag(self.tag)
    }

    /// Same identity, different kind; used to derive a lock id from an open id.
    pub fn with_kind(mut self, kind: StateKind) -> Self {
        self.tag = kind.tag();
        self
    }

    /// Sets the lock-owner pid.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid & PID_MASK;
        self
    }

    /// Sets the change sequence.
    pub fn with_seqid(mut self, seqid: u32) -> Self {
        self.seqid = seqid;
        self
    }

    /// Advances the change sequence.
    pub fn bump(&mut self) {
        self.seqid = self.seqid.wrapping_add(1);
    }

    /// True when `other` names the same state, ignoring the sequence.
    pub fn same_identity(&self, other: &StateId) -> bool {
        self.boottime == other.boottime
            && self.ident == other.ident
            && self.tag == other.tag
            && self.metacluster_id == other.metacluster_id
            && self.cluster_node_id == other.cluster_node_id
            && self.pid == other.pid
    }

    /// Wire form.
    pub fn encode(&self) -> StateId4 {
        let tail = (u32::from(self.tag & 0x03) << TAG_SHIFT)
            | (u32::from(self.metacluster_id & 0x0f) << TAIL_MC_SHIFT)
            | (u32::from(self.cluster_node_id) << TAIL_CL_SHIFT)
            | (self.pid & PID_MASK);
        let mut other = [0u8; 12];
        other[0..4].copy_from_slice(&self.boottime.to_be_bytes());
        other[4..8].copy_from_slice(&self.ident.to_be_bytes());
        other[8..12].copy_from_slice(&tail.to_be_bytes());
        StateId4 {
            seqid: self.seqid,
            other,
        }
    }
}

/// Classifies a stateid that did not resolve to a live entry.
///
/// Checks in order: reserved special ids, foreign node, type tag, then the
/// embedded epoch against the filesystem's current verifier.
pub fn classify_stateid_miss(
    id: &StateId4,
    expected: StateKind,
    epoch: u32,
    node: &NodeIdent,
) -> StateError {
    if id.is_special() {
        return StateError::BadStateId;
    }
    let decoded = id.decode();
    if node.origin(decoded.cluster_node_id, decoded.metacluster_id) == NodeOrigin::Foreign {
        return StateError::StaleStateId;
    }
    if decoded.kind() != Some(expected) {
        return StateError::BadStateId;
    }
    if decoded.boottime < epoch {
        StateError::StaleStateId
    } else if decoded.boottime == epoch {
        match expected {
            StateKind::Deleg => StateError::BadStateId,
            _ => StateError::Expired,
        }
    } else {
        StateError::BadStateId
    }
}

/// Start times known per cluster node.
///
/// A clientid whose (node id, start time) pair is registered here was
/// minted by a live instance, so a lookup miss means the client expired
/// rather than that the server restarted. Node ids are the combined
/// [`NodeIdent::node_id`] form.
#[derive(Debug, Default)]
pub struct MetaclusterVerifiers {
    tree: RwLock<BTreeMap<u16, BTreeSet<u32>>>,
}

impl MetaclusterVerifiers {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a known instance of `node_id`.
    pub fn insert(&self, node_id: u16, start_time: u32) {
        self.tree
            .write()
            .entry(node_id)
            .or_default()
            .insert(start_time & ID_TIME_MASK);
    }

    /// True when `start_time` is a known instance of `node_id`.
    pub fn contains(&self, node_id: u16, start_time: u32) -> bool {
        self.tree
            .read()
            .get(&node_id)
            .map(|times| times.contains(&(start_time & ID_TIME_MASK)))
            .unwrap_or(false)
    }

    /// Forgets an instance; returns whether it was known.
    pub fn remove(&self, node_id: u16, start_time: u32) -> bool {
        let mut tree = self.tree.write();
        let Some(times) = tree.get_mut(&node_id) else {
            return false;
        };
        let removed = times.remove(&(start_time & ID_TIME_MASK));
        if times.is_empty() {
            tree.remove(&node_id);
        }
        removed
    }
}
