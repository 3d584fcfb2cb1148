//! Replication wire protocol
//!
//! Business cards and every message exchanged between broadcaster, listeners,
//! repliers, masters and client proxies. Messages are serialized with bincode
//! and framed with a CRC32 trailer.
//!
//! Format: [length:4][payload:N][crc32:4]

use crate::config::ReadMode;
use crate::fifo::{FifoTicket, ReadTicket, SessionId, WriteTicket};
use crate::mailbox::{MailboxAddress, PeerId};
use crate::order::OrderToken;
use crate::region::Region;
use crate::version::{BranchId, Version};
use crate::{Error, Result};
use crc32fast::Hasher;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Protocol version; a broadcaster refuses listeners speaking another one
pub const PROTOCOL_VERSION: u32 = 1;

/// Bound shared by every payload type a protocol defines
pub trait Payload: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Payload for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Data-access protocol carried by the replication layer.
///
/// The replication core never looks inside these payloads; it only moves
/// them between the routing layer and replica stores.
pub trait Protocol: Clone + Debug + Send + Sync + 'static {
    /// Query
    type Read: Payload;
    /// Query result
    type ReadResponse: Payload;
    /// Mutation
    type Write: Payload;
    /// Mutation result
    type WriteResponse: Payload;
}

/// Handle of a live broadcaster
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct BroadcasterCard<P: Protocol> {
    /// Peer hosting the broadcaster
    pub peer: PeerId,
    /// Branch the broadcaster owns
    pub branch: BranchId,
    /// Region of the branch
    pub region: Region,
    /// Where listeners register
    pub registrar: MailboxAddress<RegistrarMessage<P>>,
}

/// Handle of a listener's write stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ListenerCard<P: Protocol> {
    /// Peer hosting the listener
    pub peer: PeerId,
    /// Where the broadcaster streams writes
    pub stream: MailboxAddress<StreamWrite<P>>,
}

/// Handle of a replier's read service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ReplierCard<P: Protocol> {
    /// Peer hosting the replier
    pub peer: PeerId,
    /// Where reads are sent
    pub reads: MailboxAddress<ReplierRequest<P>>,
}

/// Handle of a live master
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct MasterCard<P: Protocol> {
    /// Region the master routes for
    pub region: Region,
    /// Where clients send requests; also identifies the master instance
    pub requests: MailboxAddress<MasterRequest<P>>,
}

/// Messages accepted by a broadcaster's registrar
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum RegistrarMessage<P: Protocol> {
    /// A listener asks to join the branch
    Register {
        /// Listener's stream handle
        listener: ListenerCard<P>,
        /// Version of the listener's store
        version: Version,
        /// Region of the listener's store
        region: Region,
        /// [`PROTOCOL_VERSION`] of the listener
        protocol_version: u32,
        /// Where the decision is sent
        reply: MailboxAddress<RegistrationReply>,
    },
    /// A joined listener can now serve reads
    UpgradeReadable {
        /// Listener peer
        peer: PeerId,
        /// Read service handle
        replier: ReplierCard<P>,
    },
    /// A listener is shutting down
    Deregister {
        /// Listener peer
        peer: PeerId,
    },
}

/// Broadcaster's answer to a registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistrationReply {
    /// Listener joined the branch
    Accepted {
        /// Latest version assigned by the broadcaster at join time
        current: Version,
        /// Store contents to install before streaming, when the write log
        /// cannot bridge the gap
        backfill: Option<Backfill>,
    },
    /// Listener could not join. Lineage and region mismatches arrive as
    /// [`Error::BranchLineageRejected`]; anything else is the failure that
    /// interrupted the join.
    Rejected {
        /// Why the join failed
        error: Error,
    },
}

/// Snapshot of a broadcaster's store at an exact version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backfill {
    /// Version the snapshot was taken at
    pub version: Version,
    /// Opaque store snapshot
    pub data: Vec<u8>,
    /// CRC32 of `data`
    pub checksum: u32,
}

impl Backfill {
    /// Wrap a snapshot, computing its checksum
    pub fn new(version: Version, data: Vec<u8>) -> Self {
        let checksum = crc32fast::hash(&data);
        Self {
            version,
            data,
            checksum,
        }
    }

    /// Check the snapshot against its checksum
    pub fn verify(&self) -> Result<()> {
        let computed = crc32fast::hash(&self.data);
        if computed != self.checksum {
            return Err(Error::transport(format!(
                "Backfill checksum mismatch: expected {:x}, got {:x}",
                self.checksum, computed
            )));
        }
        Ok(())
    }
}

/// One write on a listener's stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct StreamWrite<P: Protocol> {
    /// Version assigned by the broadcaster
    pub version: Version,
    /// The write
    pub write: P::Write,
    /// Client order token, carried for diagnostics
    pub order_token: OrderToken,
    /// Where to acknowledge; `None` for catch-up replays
    pub ack_to: Option<MailboxAddress<WriteAck<P>>>,
}

/// Listener's acknowledgement of an applied write
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct WriteAck<P: Protocol> {
    /// Acknowledging peer
    pub peer: PeerId,
    /// Version that was applied
    pub version: Version,
    /// Store's response to the write
    pub response: P::WriteResponse,
}

/// Read sent to a replier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ReplierRequest<P: Protocol> {
    /// The query
    pub read: P::Read,
    /// Where the result goes
    pub reply: MailboxAddress<Result<P::ReadResponse>>,
}

/// Requests accepted by a master
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum MasterRequest<P: Protocol> {
    /// Read through the FIFO gate
    Read {
        /// The query
        read: P::Read,
        /// Consistency level
        mode: ReadMode,
        /// Client order token
        order_token: OrderToken,
        /// Admission ticket
        ticket: ReadTicket,
        /// Where the result goes
        reply: MailboxAddress<Result<P::ReadResponse>>,
    },
    /// Write through the FIFO gate
    Write {
        /// The mutation
        write: P::Write,
        /// Client order token
        order_token: OrderToken,
        /// Admission ticket
        ticket: WriteTicket,
        /// Where the result goes
        reply: MailboxAddress<Result<P::WriteResponse>>,
    },
    /// A ticket the client consumed without sending its operation
    Abandon {
        /// The consumed ticket
        ticket: FifoTicket,
    },
    /// The client session is gone
    Disconnect {
        /// Session to forget
        session: SessionId,
    },
}

/// Encode a message into a CRC-checked frame
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(message)
        .map_err(|e| Error::transport(format!("Serialization failed: {}", e)))?;

    let mut buf = Vec::with_capacity(4 + payload.len() + 4);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);

    // CRC32 of length + payload
    let mut hasher = Hasher::new();
    hasher.update(&buf);
    let crc = hasher.finalize();
    buf.extend_from_slice(&crc.to_le_bytes());

    Ok(buf)
}

/// Decode a frame produced by [`encode_frame`]
pub fn decode_frame<T: DeserializeOwned>(buf: &[u8]) -> Result<T> {
    if buf.len() < 8 {
        // min: length(4) + crc(4)
        return Err(Error::transport("Message too short"));
    }

    // Verify CRC
    let crc_offset = buf.len() - 4;
    let mut stored = [0u8; 4];
    stored.copy_from_slice(&buf[crc_offset..]);
    let stored_crc = u32::from_le_bytes(stored);

    let mut hasher = Hasher::new();
    hasher.update(&buf[..crc_offset]);
    let computed_crc = hasher.finalize();

    if stored_crc != computed_crc {
        return Err(Error::transport(format!(
            "CRC mismatch: expected {:x}, got {:x}",
            stored_crc, computed_crc
        )));
    }

    // Extract payload length
    let mut header = [0u8; 4];
    header.copy_from_slice(&buf[..4]);
    let length = u32::from_le_bytes(header) as usize;
    if buf.len() != 4 + length + 4 {
        return Err(Error::transport("Incomplete message"));
    }

    bincode::deserialize(&buf[4..4 + length])
        .map_err(|e| Error::transport(format!("Deserialization failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::kv::{KvProtocol, KvWrite};

    #[test]
    fn test_stream_write_frame() {
        let msg: StreamWrite<KvProtocol> = StreamWrite {
            version: Version::new(BranchId::new(), 7),
            write: KvWrite::single("a", "1"),
            order_token: OrderToken::ignore(),
            ack_to: None,
        };

        let frame = encode_frame(&msg).unwrap();
        let decoded: StreamWrite<KvProtocol> = decode_frame(&frame).unwrap();
        assert_eq!(decoded.version, msg.version);
        assert_eq!(decoded.write, msg.write);
        assert!(decoded.ack_to.is_none());
    }

    #[test]
    fn test_error_results_cross_the_wire() {
        let reply: Result<u64> = Err(Error::cannot_perform_query("no master"));
        let frame = encode_frame(&reply).unwrap();
        let decoded: Result<u64> = decode_frame(&frame).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_crc_validation() {
        let mut frame = encode_frame(&RegistrationReply::Rejected {
            error: Error::lineage_rejected("diverged"),
        })
        .unwrap();

        // Corrupt the payload
        frame[5] ^= 0xFF;

        let result: Result<RegistrationReply> = decode_frame(&frame);
        assert!(result.unwrap_err().to_string().contains("CRC"));
    }

    #[test]
    fn test_truncated_frame() {
        let result: Result<u32> = decode_frame(&[1, 2, 3]);
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[test]
    fn test_backfill_checksum() {
        let mut backfill = Backfill::new(Version::zero(), vec![1, 2, 3, 4]);
        assert!(backfill.verify().is_ok());
        backfill.data[0] = 9;
        assert!(backfill.verify().is_err());
    }
}
