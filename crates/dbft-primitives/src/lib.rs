//! Primitive types shared by the dBFT consensus core: the signed payload
//! envelope and its deterministic wire codec, the block model, and the
//! transaction record the core reasons about.

pub mod block;
pub mod codec;
pub mod message;
pub mod transaction;

/// Block height: the chain index of the block a round is producing.
pub type Height = u32;

/// View number within a height. Starts at 0, bumped by each view change.
pub type View = u8;

/// Index of a validator in the ordered epoch set.
pub type ValidatorIndex = u16;

pub use block::{merkle_root, Block, BlockHeader, Witness};
pub use codec::{ByteReader, CodecError};
pub use message::{
    ChangeView, ChangeViewReason, Commit, ConsensusPayload, Envelope, PayloadKind,
    PrepareRequest, PrepareResponse, ProposalSlot, RecoveryMessage, RecoveryRequest,
    PAYLOAD_CATEGORY,
};
pub use transaction::{Transaction, VerificationContext};
