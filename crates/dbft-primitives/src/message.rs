//! The six consensus payload kinds and their signed wire envelope.
//!
//! The encoding is deterministic and canonical: little-endian integers, no
//! optional framing, and a strict reject of trailing bytes. Two distinct
//! byte strings never decode to equal values, which makes the envelope hash
//! a safe dedup key.

use crate::codec::{ByteReader, CodecError};
use crate::{Height, ValidatorIndex, View};
use alloy_primitives::{keccak256, B256};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

/// Category tag carried by every consensus envelope.
pub const PAYLOAD_CATEGORY: &str = "dBFT";

const SIGNATURE_LEN: usize = 64;

/// Proposal slot within a view: each view has two authorized proposers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProposalSlot {
    /// Slot 0, owned by the priority primary.
    Priority,
    /// Slot 1, owned by the fallback primary.
    Fallback,
}

impl ProposalSlot {
    pub const ALL: [ProposalSlot; 2] = [ProposalSlot::Priority, ProposalSlot::Fallback];

    pub fn as_u8(self) -> u8 {
        match self {
            ProposalSlot::Priority => 0,
            ProposalSlot::Fallback => 1,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(ProposalSlot::Priority),
            1 => Ok(ProposalSlot::Fallback),
            _ => Err(CodecError::MalformedPayload("unknown proposal slot")),
        }
    }

    pub fn index(self) -> usize {
        self.as_u8() as usize
    }
}

/// Why a validator asked for a view change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeViewReason {
    Timeout,
    ChangeAgreement,
    TxNotFound,
    TxRejectedByPolicy,
    TxInvalid,
    BlockRejectedByPolicy,
}

impl ChangeViewReason {
    pub fn as_u8(self) -> u8 {
        match self {
            ChangeViewReason::Timeout => 0,
            ChangeViewReason::ChangeAgreement => 1,
            ChangeViewReason::TxNotFound => 2,
            ChangeViewReason::TxRejectedByPolicy => 3,
            ChangeViewReason::TxInvalid => 4,
            ChangeViewReason::BlockRejectedByPolicy => 5,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(ChangeViewReason::Timeout),
            1 => Ok(ChangeViewReason::ChangeAgreement),
            2 => Ok(ChangeViewReason::TxNotFound),
            3 => Ok(ChangeViewReason::TxRejectedByPolicy),
            4 => Ok(ChangeViewReason::TxInvalid),
            5 => Ok(ChangeViewReason::BlockRejectedByPolicy),
            _ => Err(CodecError::MalformedPayload("unknown change-view reason")),
        }
    }
}

/// Wire discriminant of each payload kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadKind {
    ChangeView,
    PrepareRequest,
    PrepareResponse,
    Commit,
    RecoveryRequest,
    RecoveryMessage,
}

impl PayloadKind {
    pub fn as_u8(self) -> u8 {
        match self {
            PayloadKind::ChangeView => 0x00,
            PayloadKind::PrepareRequest => 0x20,
            PayloadKind::PrepareResponse => 0x21,
            PayloadKind::Commit => 0x30,
            PayloadKind::RecoveryRequest => 0x40,
            PayloadKind::RecoveryMessage => 0x41,
        }
    }

    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0x00 => Ok(PayloadKind::ChangeView),
            0x20 => Ok(PayloadKind::PrepareRequest),
            0x21 => Ok(PayloadKind::PrepareResponse),
            0x30 => Ok(PayloadKind::Commit),
            0x40 => Ok(PayloadKind::RecoveryRequest),
            0x41 => Ok(PayloadKind::RecoveryMessage),
            _ => Err(CodecError::MalformedPayload("unknown payload kind")),
        }
    }
}

/// Proposal for a slot, authored only by that slot's primary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub slot: ProposalSlot,
    pub timestamp: u64,
    pub nonce: u64,
    /// Ordered transaction hash list the proposer commits to.
    pub tx_hashes: Vec<B256>,
}

/// Acknowledges one specific prepare request by its envelope hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub slot: ProposalSlot,
    pub request_hash: B256,
}

/// Request to move to the next view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeView {
    pub reason: ChangeViewReason,
    pub new_view: View,
    pub timestamp: u64,
}

/// Commit to a slot's block header, carrying the header signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub slot: ProposalSlot,
    /// Signature over the block header bytes of the committed draft.
    pub signature: Signature,
}

/// Ask peers for a recovery bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRequest {
    pub timestamp: u64,
}

/// Bundle of signed envelopes sufficient to bootstrap a lagging peer.
///
/// Constituents are replayed through the normal handlers in this field
/// order, so that requests land before the responses that reference them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryMessage {
    pub change_views: Vec<Envelope>,
    pub prepare_requests: Vec<Envelope>,
    pub prepare_responses: Vec<Envelope>,
    pub commits: Vec<Envelope>,
}

/// One of the six consensus payload kinds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusPayload {
    PrepareRequest(PrepareRequest),
    PrepareResponse(PrepareResponse),
    ChangeView(ChangeView),
    Commit(Commit),
    RecoveryRequest(RecoveryRequest),
    RecoveryMessage(RecoveryMessage),
}

impl ConsensusPayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            ConsensusPayload::ChangeView(_) => PayloadKind::ChangeView,
            ConsensusPayload::PrepareRequest(_) => PayloadKind::PrepareRequest,
            ConsensusPayload::PrepareResponse(_) => PayloadKind::PrepareResponse,
            ConsensusPayload::Commit(_) => PayloadKind::Commit,
            ConsensusPayload::RecoveryRequest(_) => PayloadKind::RecoveryRequest,
            ConsensusPayload::RecoveryMessage(_) => PayloadKind::RecoveryMessage,
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            ConsensusPayload::PrepareRequest(req) => {
                out.push(req.slot.as_u8());
                out.extend_from_slice(&req.timestamp.to_le_bytes());
                out.extend_from_slice(&req.nonce.to_le_bytes());
                out.extend_from_slice(&(req.tx_hashes.len() as u16).to_le_bytes());
                for hash in &req.tx_hashes {
                    out.extend_from_slice(hash.as_slice());
                }
            }
            ConsensusPayload::PrepareResponse(resp) => {
                out.push(resp.slot.as_u8());
                out.extend_from_slice(resp.request_hash.as_slice());
            }
            ConsensusPayload::ChangeView(cv) => {
                out.push(cv.reason.as_u8());
                out.push(cv.new_view);
                out.extend_from_slice(&cv.timestamp.to_le_bytes());
            }
            ConsensusPayload::Commit(commit) => {
                out.push(commit.slot.as_u8());
                out.extend_from_slice(&commit.signature.to_bytes());
            }
            ConsensusPayload::RecoveryRequest(req) => {
                out.extend_from_slice(&req.timestamp.to_le_bytes());
            }
            ConsensusPayload::RecoveryMessage(msg) => {
                for section in [
                    &msg.change_views,
                    &msg.prepare_requests,
                    &msg.prepare_responses,
                    &msg.commits,
                ] {
                    out.extend_from_slice(&(section.len() as u16).to_le_bytes());
                    for envelope in section {
                        let bytes = envelope.to_bytes();
                        out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                        out.extend_from_slice(&bytes);
                    }
                }
            }
        }
    }

    fn decode_body(kind: PayloadKind, reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        match kind {
            PayloadKind::PrepareRequest => {
                let slot = ProposalSlot::from_u8(reader.read_u8()?)?;
                let timestamp = reader.read_u64()?;
                let nonce = reader.read_u64()?;
                let count = reader.read_u16()? as usize;
                let mut tx_hashes = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    tx_hashes.push(reader.read_b256()?);
                }
                Ok(ConsensusPayload::PrepareRequest(PrepareRequest {
                    slot,
                    timestamp,
                    nonce,
                    tx_hashes,
                }))
            }
            PayloadKind::PrepareResponse => {
                let slot = ProposalSlot::from_u8(reader.read_u8()?)?;
                let request_hash = reader.read_b256()?;
                Ok(ConsensusPayload::PrepareResponse(PrepareResponse {
                    slot,
                    request_hash,
                }))
            }
            PayloadKind::ChangeView => {
                let reason = ChangeViewReason::from_u8(reader.read_u8()?)?;
                let new_view = reader.read_u8()?;
                let timestamp = reader.read_u64()?;
                Ok(ConsensusPayload::ChangeView(ChangeView {
                    reason,
                    new_view,
                    timestamp,
                }))
            }
            PayloadKind::Commit => {
                let slot = ProposalSlot::from_u8(reader.read_u8()?)?;
                let bytes = reader.read_bytes(SIGNATURE_LEN)?;
                let mut buf = [0u8; SIGNATURE_LEN];
                buf.copy_from_slice(bytes);
                Ok(ConsensusPayload::Commit(Commit {
                    slot,
                    signature: Signature::from_bytes(&buf),
                }))
            }
            PayloadKind::RecoveryRequest => {
                let timestamp = reader.read_u64()?;
                Ok(ConsensusPayload::RecoveryRequest(RecoveryRequest {
                    timestamp,
                }))
            }
            PayloadKind::RecoveryMessage => {
                let expected = [
                    PayloadKind::ChangeView,
                    PayloadKind::PrepareRequest,
                    PayloadKind::PrepareResponse,
                    PayloadKind::Commit,
                ];
                let mut sections: Vec<Vec<Envelope>> = Vec::with_capacity(4);
                for kind in expected {
                    let count = reader.read_u16()? as usize;
                    let mut section = Vec::with_capacity(count.min(1024));
                    for _ in 0..count {
                        let len = reader.read_u32()? as usize;
                        let bytes = reader.read_bytes(len)?;
                        let envelope = Envelope::from_bytes(bytes)?;
                        if envelope.kind() != kind {
                            return Err(CodecError::MalformedPayload(
                                "recovery section kind mismatch",
                            ));
                        }
                        section.push(envelope);
                    }
                    sections.push(section);
                }
                let commits = sections.pop().unwrap_or_default();
                let prepare_responses = sections.pop().unwrap_or_default();
                let prepare_requests = sections.pop().unwrap_or_default();
                let change_views = sections.pop().unwrap_or_default();
                Ok(ConsensusPayload::RecoveryMessage(RecoveryMessage {
                    change_views,
                    prepare_requests,
                    prepare_responses,
                    commits,
                }))
            }
        }
    }
}

/// Signed wire envelope around a consensus payload.
///
/// The signature covers everything before it: category tag, height, origin
/// index, kind, view and the payload body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub height: Height,
    pub validator_index: ValidatorIndex,
    pub view: View,
    pub payload: ConsensusPayload,
    pub signature: Signature,
}

impl Envelope {
    /// Builds and signs an envelope with the local validator key.
    pub fn new_signed(
        height: Height,
        validator_index: ValidatorIndex,
        view: View,
        payload: ConsensusPayload,
        key: &SigningKey,
    ) -> Self {
        let unsigned = Self::unsigned_bytes(height, validator_index, view, &payload);
        let signature = key.sign(&unsigned);
        Self {
            height,
            validator_index,
            view,
            payload,
            signature,
        }
    }

    pub fn kind(&self) -> PayloadKind {
        self.payload.kind()
    }

    fn unsigned_bytes(
        height: Height,
        validator_index: ValidatorIndex,
        view: View,
        payload: &ConsensusPayload,
    ) -> Vec<u8> {
        let category = PAYLOAD_CATEGORY.as_bytes();
        let mut out = Vec::with_capacity(64);
        out.push(category.len() as u8);
        out.extend_from_slice(category);
        out.extend_from_slice(&height.to_le_bytes());
        out.extend_from_slice(&validator_index.to_le_bytes());
        out.push(payload.kind().as_u8());
        out.push(view);
        payload.encode_body(&mut out);
        out
    }

    /// Full canonical encoding, signature included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out =
            Self::unsigned_bytes(self.height, self.validator_index, self.view, &self.payload);
        out.extend_from_slice(&self.signature.to_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        let mut reader = ByteReader::new(data);

        let category_len = reader.read_u8()? as usize;
        let category = reader.read_bytes(category_len)?;
        if category != PAYLOAD_CATEGORY.as_bytes() {
            return Err(CodecError::MalformedPayload("wrong payload category"));
        }

        let height = reader.read_u32()?;
        let validator_index = reader.read_u16()?;
        let kind = PayloadKind::from_u8(reader.read_u8()?)?;
        let view = reader.read_u8()?;
        let payload = ConsensusPayload::decode_body(kind, &mut reader)?;

        if reader.remaining() != SIGNATURE_LEN {
            return Err(CodecError::MalformedPayload("bad signature length"));
        }
        let mut sig = [0u8; SIGNATURE_LEN];
        sig.copy_from_slice(reader.read_bytes(SIGNATURE_LEN)?);
        reader.finish()?;

        Ok(Self {
            height,
            validator_index,
            view,
            payload,
            signature: Signature::from_bytes(&sig),
        })
    }

    /// Verifies the envelope signature against the origin's public key.
    pub fn verify(&self, key: &VerifyingKey) -> Result<(), CodecError> {
        let unsigned =
            Self::unsigned_bytes(self.height, self.validator_index, self.view, &self.payload);
        key.verify_strict(&unsigned, &self.signature)
            .map_err(|_| CodecError::BadSignature {
                validator_index: self.validator_index,
            })
    }

    /// Keccak hash of the canonical encoding; the per-height dedup key.
    pub fn hash(&self) -> B256 {
        keccak256(self.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(index: u8) -> SigningKey {
        let mut bytes = [0u8; 32];
        bytes[0] = index;
        bytes[31] = 0xED;
        SigningKey::from_bytes(&bytes)
    }

    fn roundtrip(payload: ConsensusPayload) -> Envelope {
        let key = test_key(3);
        let envelope = Envelope::new_signed(10, 3, 1, payload, &key);
        let decoded =
            Envelope::from_bytes(&envelope.to_bytes()).expect("canonical bytes should decode");
        assert_eq!(decoded, envelope);
        decoded
            .verify(&key.verifying_key())
            .expect("self-signed envelope should verify");
        decoded
    }

    #[test]
    fn test_prepare_request_roundtrip() {
        let decoded = roundtrip(ConsensusPayload::PrepareRequest(PrepareRequest {
            slot: ProposalSlot::Priority,
            timestamp: 1_700_000_000_123,
            nonce: 7,
            tx_hashes: vec![B256::repeat_byte(0xAA), B256::repeat_byte(0xBB)],
        }));
        assert_eq!(decoded.kind(), PayloadKind::PrepareRequest);
    }

    #[test]
    fn test_prepare_response_roundtrip() {
        roundtrip(ConsensusPayload::PrepareResponse(PrepareResponse {
            slot: ProposalSlot::Fallback,
            request_hash: B256::repeat_byte(0xCD),
        }));
    }

    #[test]
    fn test_change_view_roundtrip() {
        roundtrip(ConsensusPayload::ChangeView(ChangeView {
            reason: ChangeViewReason::TxInvalid,
            new_view: 2,
            timestamp: 99,
        }));
    }

    #[test]
    fn test_commit_roundtrip() {
        let sig = test_key(1).sign(b"header bytes");
        roundtrip(ConsensusPayload::Commit(Commit {
            slot: ProposalSlot::Priority,
            signature: sig,
        }));
    }

    #[test]
    fn test_recovery_request_roundtrip() {
        roundtrip(ConsensusPayload::RecoveryRequest(RecoveryRequest {
            timestamp: 123,
        }));
    }

    #[test]
    fn test_recovery_message_roundtrip() {
        let key = test_key(0);
        let cv = Envelope::new_signed(
            10,
            0,
            0,
            ConsensusPayload::ChangeView(ChangeView {
                reason: ChangeViewReason::Timeout,
                new_view: 1,
                timestamp: 5,
            }),
            &key,
        );
        let commit = Envelope::new_signed(
            10,
            0,
            0,
            ConsensusPayload::Commit(Commit {
                slot: ProposalSlot::Priority,
                signature: key.sign(b"header"),
            }),
            &key,
        );
        roundtrip(ConsensusPayload::RecoveryMessage(RecoveryMessage {
            change_views: vec![cv],
            prepare_requests: vec![],
            prepare_responses: vec![],
            commits: vec![commit],
        }));
    }

    #[test]
    fn test_envelope_layout_prefix() {
        let key = test_key(2);
        let envelope = Envelope::new_signed(
            0x0A0B0C0D,
            0x0102,
            3,
            ConsensusPayload::RecoveryRequest(RecoveryRequest { timestamp: 0 }),
            &key,
        );
        let bytes = envelope.to_bytes();
        assert_eq!(bytes[0], 4);
        assert_eq!(&bytes[1..5], b"dBFT");
        assert_eq!(&bytes[5..9], &0x0A0B0C0Du32.to_le_bytes());
        assert_eq!(&bytes[9..11], &0x0102u16.to_le_bytes());
        assert_eq!(bytes[11], PayloadKind::RecoveryRequest.as_u8());
        assert_eq!(bytes[12], 3);
    }

    #[test]
    fn test_wrong_category_rejected() {
        let key = test_key(0);
        let envelope = Envelope::new_signed(
            1,
            0,
            0,
            ConsensusPayload::RecoveryRequest(RecoveryRequest { timestamp: 0 }),
            &key,
        );
        let mut bytes = envelope.to_bytes();
        bytes[1] = b'x';
        assert_eq!(
            Envelope::from_bytes(&bytes),
            Err(CodecError::MalformedPayload("wrong payload category"))
        );
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let key = test_key(0);
        let envelope = Envelope::new_signed(
            1,
            0,
            0,
            ConsensusPayload::RecoveryRequest(RecoveryRequest { timestamp: 0 }),
            &key,
        );
        let mut bytes = envelope.to_bytes();
        bytes[11] = 0x7F;
        assert_eq!(
            Envelope::from_bytes(&bytes),
            Err(CodecError::MalformedPayload("unknown payload kind"))
        );
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let key = test_key(0);
        let envelope = Envelope::new_signed(
            1,
            0,
            0,
            ConsensusPayload::RecoveryRequest(RecoveryRequest { timestamp: 0 }),
            &key,
        );
        let mut bytes = envelope.to_bytes();
        bytes.push(0);
        assert!(Envelope::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_tampered_body_fails_verification() {
        let key = test_key(0);
        let envelope = Envelope::new_signed(
            1,
            0,
            0,
            ConsensusPayload::RecoveryRequest(RecoveryRequest { timestamp: 7 }),
            &key,
        );
        let mut bytes = envelope.to_bytes();
        // Flip a timestamp byte inside the signed region.
        bytes[13] ^= 0xFF;
        let tampered = Envelope::from_bytes(&bytes).expect("still well-formed");
        assert_eq!(
            tampered.verify(&key.verifying_key()),
            Err(CodecError::BadSignature { validator_index: 0 })
        );
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let key = test_key(0);
        let envelope = Envelope::new_signed(
            1,
            0,
            0,
            ConsensusPayload::RecoveryRequest(RecoveryRequest { timestamp: 7 }),
            &key,
        );
        assert!(envelope.verify(&test_key(1).verifying_key()).is_err());
    }

    #[test]
    fn test_recovery_section_kind_mismatch_rejected() {
        let key = test_key(0);
        // A commit envelope placed in the change-view section.
        let commit = Envelope::new_signed(
            10,
            0,
            0,
            ConsensusPayload::Commit(Commit {
                slot: ProposalSlot::Priority,
                signature: key.sign(b"header"),
            }),
            &key,
        );
        let bundle = Envelope::new_signed(
            10,
            0,
            0,
            ConsensusPayload::RecoveryMessage(RecoveryMessage {
                change_views: vec![commit],
                prepare_requests: vec![],
                prepare_responses: vec![],
                commits: vec![],
            }),
            &key,
        );
        assert_eq!(
            Envelope::from_bytes(&bundle.to_bytes()),
            Err(CodecError::MalformedPayload("recovery section kind mismatch"))
        );
    }

    #[test]
    fn test_hash_is_replay_stable() {
        let key = test_key(0);
        let envelope = Envelope::new_signed(
            1,
            0,
            0,
            ConsensusPayload::RecoveryRequest(RecoveryRequest { timestamp: 7 }),
            &key,
        );
        let decoded = Envelope::from_bytes(&envelope.to_bytes()).unwrap();
        assert_eq!(envelope.hash(), decoded.hash());
    }
}
