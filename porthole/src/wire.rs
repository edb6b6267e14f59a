//! Wire format for ancillary control segments.
//!
//! Segment format: `[kind:1][reserved:1][length:2][payload:N]`
//!
//! - **kind**: `1` = rights, `2` = credentials
//! - **reserved**: must be zero
//! - **length**: payload size in bytes (little-endian u16)
//! - **payload**: for rights, one little-endian u32 descriptor integer per
//!   entry; for credentials, `{uid, euid, gid, egid, ngroups,
//!   groups[ngroups]}` as little-endian u32s
//!
//! A control buffer is a plain concatenation of segments. The layout is kept
//! bit-compatible with the existing peer-discovery convention, so there is
//! no checksum or framing beyond the header.

use thiserror::Error;

use crate::message::Credentials;

/// Header size: 1 (kind) + 1 (reserved) + 2 (length) = 4 bytes.
pub const SEGMENT_HEADER_SIZE: usize = 4;

/// Kind byte of a rights segment.
pub const KIND_RIGHTS: u8 = 1;

/// Kind byte of a credentials segment.
pub const KIND_CREDENTIALS: u8 = 2;

/// Hard cap on descriptors in one rights segment.
pub const RIGHTS_SEGMENT_LIMIT: usize = 64;

/// Rights-count the decoder sizes its buffer for before reallocating.
const RIGHTS_INLINE_HINT: usize = 16;

/// Hard cap on supplementary groups in one credentials segment.
pub const GROUPS_LIMIT: usize = 32;

/// Wire format error types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WireError {
    /// Not enough bytes left to parse the next header or payload.
    #[error("truncated segment: need {needed} bytes, have {have}")]
    Truncated {
        /// Bytes required to continue parsing.
        needed: usize,
        /// Bytes actually available.
        have: usize,
    },

    /// The kind byte names no known segment type.
    #[error("unknown segment kind: {kind}")]
    UnknownKind {
        /// The offending kind byte.
        kind: u8,
    },

    /// The reserved header byte was non-zero.
    #[error("reserved header byte set: {value:#04x}")]
    ReservedSet {
        /// The offending byte.
        value: u8,
    },

    /// A rights payload length is not a whole number of descriptors.
    #[error("misaligned rights payload: {length} bytes")]
    MisalignedRights {
        /// The payload length from the header.
        length: usize,
    },

    /// A rights segment exceeds the per-message descriptor cap.
    #[error("too many rights: {count} descriptors (max {max})")]
    TooManyRights {
        /// Descriptors in the segment.
        count: usize,
        /// The cap.
        max: usize,
    },

    /// A credentials payload disagrees with its own group count.
    #[error("credentials length mismatch: {length} bytes for {ngroups} groups")]
    CredentialsLength {
        /// The payload length from the header.
        length: usize,
        /// The embedded group count.
        ngroups: usize,
    },

    /// The group count exceeds the cap.
    #[error("too many groups: {count} (max {max})")]
    TooManyGroups {
        /// Groups in the segment.
        count: usize,
        /// The cap.
        max: usize,
    },
}

impl From<WireError> for crate::error::TransportError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::TooManyRights { count, max } => {
                crate::error::TransportError::TooManyDescriptors { count, max }
            }
            other => crate::error::TransportError::InvalidArgument {
                reason: other.to_string(),
            },
        }
    }
}

/// One decoded control segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Descriptor integers, in sender order.
    Rights(Vec<u32>),
    /// A credentials record.
    Credentials(Credentials),
}

/// Encode a rights segment for the given descriptor integers.
///
/// # Errors
///
/// Returns [`WireError::TooManyRights`] past the per-segment cap.
pub fn encode_rights(fds: &[u32]) -> Result<Vec<u8>, WireError> {
    if fds.len() > RIGHTS_SEGMENT_LIMIT {
        return Err(WireError::TooManyRights {
            count: fds.len(),
            max: RIGHTS_SEGMENT_LIMIT,
        });
    }
    let length = fds.len() * 4;
    let mut buf = Vec::with_capacity(SEGMENT_HEADER_SIZE + length);
    buf.push(KIND_RIGHTS);
    buf.push(0);
    buf.extend_from_slice(&(length as u16).to_le_bytes());
    for fd in fds {
        buf.extend_from_slice(&fd.to_le_bytes());
    }
    Ok(buf)
}

/// Encode a credentials segment.
///
/// # Errors
///
/// Returns [`WireError::TooManyGroups`] past the group cap.
pub fn encode_credentials(creds: &Credentials) -> Result<Vec<u8>, WireError> {
    if creds.groups.len() > GROUPS_LIMIT {
        return Err(WireError::TooManyGroups {
            count: creds.groups.len(),
            max: GROUPS_LIMIT,
        });
    }
    let length = 20 + creds.groups.len() * 4;
    let mut buf = Vec::with_capacity(SEGMENT_HEADER_SIZE + length);
    buf.push(KIND_CREDENTIALS);
    buf.push(0);
    buf.extend_from_slice(&(length as u16).to_le_bytes());
    for word in [creds.uid, creds.euid, creds.gid, creds.egid] {
        buf.extend_from_slice(&word.to_le_bytes());
    }
    buf.extend_from_slice(&(creds.groups.len() as u32).to_le_bytes());
    for group in &creds.groups {
        buf.extend_from_slice(&group.to_le_bytes());
    }
    Ok(buf)
}

/// Decode a control buffer into its segments.
///
/// An empty buffer decodes to no segments. Validation here is purely
/// structural; which segment combinations a sender may supply is the
/// transfer engine's call.
///
/// # Errors
///
/// Any structural violation: truncation, unknown kind, reserved byte set,
/// misaligned or oversized payloads.
pub fn decode_segments(buf: &[u8]) -> Result<Vec<Segment>, WireError> {
    let mut segments = Vec::new();
    let mut pos = 0;

    while pos < buf.len() {
        let remaining = buf.len() - pos;
        if remaining < SEGMENT_HEADER_SIZE {
            return Err(WireError::Truncated {
                needed: SEGMENT_HEADER_SIZE,
                have: remaining,
            });
        }

        let kind = buf[pos];
        let reserved = buf[pos + 1];
        let length = u16::from_le_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
        if reserved != 0 {
            return Err(WireError::ReservedSet { value: reserved });
        }

        let payload_start = pos + SEGMENT_HEADER_SIZE;
        if buf.len() - payload_start < length {
            return Err(WireError::Truncated {
                needed: length,
                have: buf.len() - payload_start,
            });
        }
        let payload = &buf[payload_start..payload_start + length];

        let segment = match kind {
            KIND_RIGHTS => Segment::Rights(decode_rights(payload)?),
            KIND_CREDENTIALS => Segment::Credentials(decode_credentials(payload)?),
            other => return Err(WireError::UnknownKind { kind: other }),
        };
        segments.push(segment);
        pos = payload_start + length;
    }

    Ok(segments)
}

fn decode_rights(payload: &[u8]) -> Result<Vec<u32>, WireError> {
    if payload.len() % 4 != 0 {
        return Err(WireError::MisalignedRights {
            length: payload.len(),
        });
    }
    let count = payload.len() / 4;

    // Sized for the common case first; one exact reallocation covers larger
    // segments up to the hard cap.
    let mut fds = if count <= RIGHTS_INLINE_HINT {
        Vec::with_capacity(RIGHTS_INLINE_HINT)
    } else if count <= RIGHTS_SEGMENT_LIMIT {
        Vec::with_capacity(count)
    } else {
        return Err(WireError::TooManyRights {
            count,
            max: RIGHTS_SEGMENT_LIMIT,
        });
    };

    for chunk in payload.chunks_exact(4) {
        fds.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    Ok(fds)
}

fn decode_credentials(payload: &[u8]) -> Result<Credentials, WireError> {
    if payload.len() < 20 {
        return Err(WireError::Truncated {
            needed: 20,
            have: payload.len(),
        });
    }
    let word = |idx: usize| {
        u32::from_le_bytes([
            payload[idx * 4],
            payload[idx * 4 + 1],
            payload[idx * 4 + 2],
            payload[idx * 4 + 3],
        ])
    };
    let ngroups = word(4) as usize;
    if ngroups > GROUPS_LIMIT {
        return Err(WireError::TooManyGroups {
            count: ngroups,
            max: GROUPS_LIMIT,
        });
    }
    if payload.len() != 20 + ngroups * 4 {
        return Err(WireError::CredentialsLength {
            length: payload.len(),
            ngroups,
        });
    }

    let mut groups = Vec::with_capacity(ngroups);
    for idx in 0..ngroups {
        groups.push(word(5 + idx));
    }
    Ok(Credentials {
        uid: word(0),
        euid: word(1),
        gid: word(2),
        egid: word(3),
        groups,
    })
}
