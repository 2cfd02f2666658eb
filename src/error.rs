//! Status taxonomy (§4.2/§6) and the internal wire-layer error type that
//! feeds it.

use thiserror::Error;

/// u32 status code carried as the STATUS parameter and returned from
/// `Client::exec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0x0001_0000,
    Fail = 0x0002_0000,
    Timeout = 0x0003_0000,
    TransportError = 0x0004_0000,
    VersionMismatch = 0x0005_0000,
    TooManyConnections = 0x0006_0000,
    AuthError = 0x0007_0000,
}

impl Status {
    pub fn from_u32(v: u32) -> Option<Status> {
        Some(match v {
            0x0001_0000 => Status::Ok,
            0x0002_0000 => Status::Fail,
            0x0003_0000 => Status::Timeout,
            0x0004_0000 => Status::TransportError,
            0x0005_0000 => Status::VersionMismatch,
            0x0006_0000 => Status::TooManyConnections,
            0x0007_0000 => Status::AuthError,
            _ => return None,
        })
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl From<Status> for u32 {
    fn from(s: Status) -> u32 {
        s as u32
    }
}

/// Errors from the DataBuffer / wire-codec layer, never surfaced to a
/// caller directly — always mapped to a [`Status`] at the dispatch boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("packet shorter than expected")]
    Truncated,
    #[error("bad magic number")]
    BadMagic,
    #[error("version major mismatch")]
    VersionMismatch,
    #[error("parameter record chain overruns the buffer")]
    ChainOverrun,
    #[error("no room left in buffer for {0} more bytes")]
    OutOfRoom(usize),
    #[error("parameter {0:#x} already exists with an incompatible size")]
    SizeConflict(u32),
    #[error("parameter {0:#x} not found")]
    NotFound(u32),
    #[error("string parameter is not NUL-terminated")]
    UnterminatedString,
}

impl From<&WireError> for Status {
    fn from(e: &WireError) -> Status {
        match e {
            WireError::VersionMismatch => Status::VersionMismatch,
            WireError::Truncated
            | WireError::BadMagic
            | WireError::ChainOverrun
            | WireError::UnterminatedString => Status::TransportError,
            WireError::OutOfRoom(_) | WireError::SizeConflict(_) | WireError::NotFound(_) => {
                Status::Fail
            }
        }
    }
}

impl From<WireError> for Status {
    fn from(e: WireError) -> Status {
        Status::from(&e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_u32() {
        for s in [
            Status::Ok,
            Status::Fail,
            Status::Timeout,
            Status::TransportError,
            Status::VersionMismatch,
            Status::TooManyConnections,
            Status::AuthError,
        ] {
            let v: u32 = s.into();
            assert_eq!(Status::from_u32(v), Some(s));
        }
    }

    #[test]
    fn version_mismatch_maps_to_version_mismatch_status() {
        let status: Status = (&WireError::VersionMismatch).into();
        assert_eq!(status, Status::VersionMismatch);
    }
}
