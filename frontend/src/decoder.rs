use lib86_core::{DecodeCtx, DecodeError, DecodedInsn};

/// The instruction decoder library's contract. Bytes are
/// handed over already fetched (fetch is the translator's job, since
/// it must cross page boundaries and may fault); the decoder turns
/// them into one [`DecodedInsn`].
pub trait Decoder {
    fn decode_one(&mut self, bytes: &[u8], ctx: &DecodeCtx) -> Result<DecodedInsn, DecodeError>;
}
