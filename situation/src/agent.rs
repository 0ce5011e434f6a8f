//! Agent identity embedded in the binary. The 16 bytes below are a
//! placeholder pattern; the self-update path patches them in the downloaded
//! binary so an updated agent keeps its identity.

use uuid::Uuid;

/// Placeholder value, replaced in the binary image at update time.
pub const DEFAULT_ID: [u8; 16] = [
    0xca, 0xfe, 0xca, 0xfe, 0xca, 0xfe, 0xca, 0xfe,
    0xca, 0xfe, 0xca, 0xfe, 0xca, 0xfe, 0xca, 0xfe,
];

#[used]
static AGENT_ID: [u8; 16] = DEFAULT_ID;

/// The agent UUID. Read through a black box so the bytes stay patchable in
/// the emitted binary instead of being folded into call sites.
pub fn agent() -> Uuid {
    Uuid::from_bytes(*std::hint::black_box(&AGENT_ID))
}
