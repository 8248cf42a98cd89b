//! Error types for the NFSv4 state registry

use thiserror::Error;

/// NFSv4 status: OK (success)
pub const NFS4_OK: u32 = 0;
/// NFSv4 status: I/O error
pub const NFS4ERR_IO: u32 = 5;
/// NFSv4 status: invalid argument
pub const NFS4ERR_INVAL: u32 = 22;
/// NFSv4 status: stale filehandle
pub const NFS4ERR_STALE: u32 = 70;
/// NFSv4 status: server fault
pub const NFS4ERR_SERVERFAULT: u32 = 10006;
/// NFSv4 status: retry later
pub const NFS4ERR_DELAY: u32 = 10008;
/// NFSv4 status: lock request denied
pub const NFS4ERR_DENIED: u32 = 10010;
/// NFSv4 status: lease expired
pub const NFS4ERR_EXPIRED: u32 = 10011;
/// NFSv4 status: conflicting lock held
pub const NFS4ERR_LOCKED: u32 = 10012;
/// NFSv4 status: server in grace period
pub const NFS4ERR_GRACE: u32 = 10013;
/// NFSv4 status: share reservation denied
pub const NFS4ERR_SHARE_DENIED: u32 = 10015;
/// NFSv4 status: client id in use by another principal
pub const NFS4ERR_CLID_INUSE: u32 = 10017;
/// NFSv4 status: server out of resources
pub const NFS4ERR_RESOURCE: u32 = 10018;
/// NFSv4 status: filesystem has migrated
pub const NFS4ERR_MOVED: u32 = 10019;
/// NFSv4 status: clientid from a previous server instance
pub const NFS4ERR_STALE_CLIENTID: u32 = 10022;
/// NFSv4 status: stateid from a previous server instance
pub const NFS4ERR_STALE_STATEID: u32 = 10023;
/// NFSv4 status: stateid sequence behind
pub const NFS4ERR_OLD_STATEID: u32 = 10024;
/// NFSv4 status: stateid not valid
pub const NFS4ERR_BAD_STATEID: u32 = 10025;
/// NFSv4 status: owner sequence out of order
pub const NFS4ERR_BAD_SEQID: u32 = 10026;
/// NFSv4 status: a filesystem holding client state has moved
pub const NFS4ERR_LEASE_MOVED: u32 = 10031;
/// NFSv4 status: reclaim outside grace period
pub const NFS4ERR_NO_GRACE: u32 = 10033;
/// NFSv4 status: reclaim not allowed for this client
pub const NFS4ERR_RECLAIM_BAD: u32 = 10034;
/// NFSv4 status: access mode not granted by the open
pub const NFS4ERR_OPENMODE: u32 = 10038;
/// NFSv4 status: callback path is down
pub const NFS4ERR_CB_PATH_DOWN: u32 = 10048;

/// Errors returned by state registry entry points.
#[derive(Error, Debug)]
pub enum StateError {
    /// Clientid minted by a previous server instance or a foreign node
    #[error("stale clientid")]
    StaleClientId,
    /// Stateid minted by a previous epoch or a foreign cluster node
    #[error("stale stateid")]
    StaleStateId,
    /// Identifier from the current epoch whose owner's lease has lapsed
    #[error("lease expired")]
    Expired,
    /// Malformed identifier, wrong type, or sequence ahead of expectation
    #[error("bad stateid")]
    BadStateId,
    /// Stateid sequence behind the current one
    #[error("old stateid")]
    OldStateId,
    /// Owner sequence out of order
    #[error("bad seqid")]
    BadSeqid,
    /// Non-reclaim state creation during a grace window
    #[error("server in grace period")]
    Grace,
    /// Reclaim attempted after the grace window closed
    #[error("no grace period in effect")]
    NoGrace,
    /// Reclaim attempted by a client without a stable-storage record
    #[error("reclaim not permitted for this client")]
    ReclaimBad,
    /// Open-owner used before OPEN_CONFIRM
    #[error("open-owner not confirmed")]
    Unconfirmed,
    /// State used after CLOSE
    #[error("state already closed")]
    Closed,
    /// Conflicting delegation outstanding, retry later
    #[error("delay: conflicting delegation being recalled")]
    Delay,
    /// Share reservation conflicts with another open
    #[error("share reservation denied")]
    ShareDenied,
    /// Open does not grant the requested access
    #[error("access not granted by open mode")]
    OpenMode,
    /// Lock request conflicts with a held lock
    #[error("lock denied")]
    Denied,
    /// Conflicting range lock
    #[error("range locked")]
    Locked,
    /// Clientid registered under a different principal
    #[error("client id in use")]
    ClidInUse,
    /// A filesystem this client holds state on has migrated
    #[error("lease moved")]
    LeaseMoved,
    /// Callback path to the client is down
    #[error("callback path down")]
    CbPathDown,
    /// The filesystem has migrated to another server
    #[error("filesystem moved")]
    Moved,
    /// No state store is registered for the filesystem
    #[error("unknown filesystem {fsid:#x}")]
    UnknownFilesystem {
        /// The filesystem id presented
        fsid: u64,
    },
    /// Invalid argument
    #[error("invalid argument: {reason}")]
    Inval {
        /// What was wrong with the argument
        reason: String,
    },
    /// Out of identifiers or memory
    #[error("resource exhausted: {reason}")]
    Resource {
        /// The exhausted resource
        reason: String,
    },
    /// Internal inconsistency
    #[error("server fault: {reason}")]
    ServerFault {
        /// Details of the fault
        reason: String,
    },
    /// Malformed stable-storage record
    #[error("bad stable-storage record: {reason}")]
    Record {
        /// Why the record was rejected
        reason: String,
    },
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StateError {
    /// Converts the error to an NFSv4 status code for protocol responses.
    pub fn nfs4_status(&self) -> u32 {
        match self {
            StateError::StaleClientId => NFS4ERR_STALE_CLIENTID,
            StateError::StaleStateId => NFS4ERR_STALE_STATEID,
            StateError::Expired => NFS4ERR_EXPIRED,
            StateError::BadStateId => NFS4ERR_BAD_STATEID,
            StateError::OldStateId => NFS4ERR_OLD_STATEID,
            StateError::BadSeqid => NFS4ERR_BAD_SEQID,
            StateError::Grace => NFS4ERR_GRACE,
            StateError::NoGrace => NFS4ERR_NO_GRACE,
            StateError::ReclaimBad => NFS4ERR_RECLAIM_BAD,
            StateError::Unconfirmed => NFS4ERR_BAD_STATEID,
            StateError::Closed => NFS4ERR_OLD_STATEID,
            StateError::Delay => NFS4ERR_DELAY,
            StateError::ShareDenied => NFS4ERR_SHARE_DENIED,
            StateError::OpenMode => NFS4ERR_OPENMODE,
            StateError::Denied => NFS4ERR_DENIED,
            StateError::Locked => NFS4ERR_LOCKED,
            StateError::ClidInUse => NFS4ERR_CLID_INUSE,
            StateError::LeaseMoved => NFS4ERR_LEASE_MOVED,
            StateError::CbPathDown => NFS4ERR_CB_PATH_DOWN,
            StateError::Moved => NFS4ERR_MOVED,
            StateError::UnknownFilesystem { .. } => NFS4ERR_STALE,
            StateError::Inval { .. } => NFS4ERR_INVAL,
            StateError::Resource { .. } => NFS4ERR_RESOURCE,
            StateError::ServerFault { .. } => NFS4ERR_SERVERFAULT,
            StateError::Record { .. } => NFS4ERR_IO,
            StateError::Io(_) => NFS4ERR_IO,
        }
    }
}

/// Result type alias using StateError as the error type.
pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_errors_map_to_distinct_codes() {
        assert_eq!(
            StateError::StaleClientId.nfs4_status(),
            NFS4ERR_STALE_CLIENTID
        );
        assert_eq!(StateError::StaleStateId.nfs4_status(), NFS4ERR_STALE_STATEID);
    }

    #[test]
    fn test_unconfirmed_surfaces_as_bad_stateid() {
        assert_eq!(StateError::Unconfirmed.nfs4_status(), NFS4ERR_BAD_STATEID);
    }

    #[test]
    fn test_closed_surfaces_as_old_stateid() {
        assert_eq!(StateError::Closed.nfs4_status(), NFS4ERR_OLD_STATEID);
    }

    #[test]
    fn test_unknown_filesystem_is_stale() {
        let err = StateError::UnknownFilesystem { fsid: 0x2a };
        assert_eq!(err.to_string(), "unknown filesystem 0x2a");
        assert_eq!(err.nfs4_status(), NFS4ERR_STALE);
        assert_eq!(StateError::Moved.nfs4_status(), NFS4ERR_MOVED);
    }

    #[test]
    fn test_grace_error() {
        let err = StateError::Grace;
        assert_eq!(err.to_string(), "server in grace period");
        assert_eq!(err.nfs4_status(), NFS4ERR_GRACE);
    }

    #[test]
    fn test_record_error_message() {
        let err = StateError::Record {
            reason: "truncated".to_string(),
        };
        assert_eq!(err.to_string(), "bad stable-storage record: truncated");
        assert_eq!(err.nfs4_status(), NFS4ERR_IO);
    }

    #[test]
    fn test_io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: StateError = io_err.into();
        assert!(matches!(err, StateError::Io(_)));
        assert_eq!(err.nfs4_status(), NFS4ERR_IO);
    }
}
