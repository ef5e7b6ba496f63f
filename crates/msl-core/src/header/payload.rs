//! Payload chunks.
//!
//! Chunks carry the message id, a sequence number starting at 1 and an
//! end-of-message flag set on the last chunk only. Each chunk is encrypted
//! and signed independently with the message context.

use msl_crypto::CryptoContext;
use msl_proto::{EncoderFormat, PayloadData, PayloadEnvelope};

use crate::{env::Environment, error::MslError};

pub(crate) fn encode_chunks(
    message_id: u64,
    payload: &[u8],
    ctx: &dyn CryptoContext,
    env: &dyn Environment,
    format: EncoderFormat,
    chunk_size: usize,
) -> Result<Vec<PayloadEnvelope>, MslError> {
    let chunks: Vec<&[u8]> =
        if payload.is_empty() { vec![payload] } else { payload.chunks(chunk_size.max(1)).collect() };
    let last = chunks.len() - 1;

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, chunk)| {
            let data = PayloadData {
                sequence_number: i as u64 + 1,
                message_id,
                end_of_message: i == last,
                data: chunk.to_vec(),
            };
            let plain = format.encode(&data)?;
            let payload = ctx.encrypt(&plain, &env.entropy())?;
            let signature = ctx.sign(&payload)?;
            Ok(PayloadEnvelope { payload, signature })
        })
        .collect()
}

pub(crate) fn decode_chunks(
    message_id: u64,
    chunks: &[PayloadEnvelope],
    ctx: &dyn CryptoContext,
) -> Result<Vec<u8>, MslError> {
    if chunks.is_empty() {
        return Err(MslError::message("message without payload chunks").with_message_id(message_id));
    }

    let mut payload = Vec::new();
    for (i, chunk) in chunks.iter().enumerate() {
        if !ctx.verify(&chunk.payload, &chunk.signature) {
            return Err(MslError::crypto(format!("payload chunk {} signature", i + 1)).with_message_id(message_id));
        }
        let plain = ctx
            .decrypt(&chunk.payload)
            .map_err(|e| MslError::crypto(format!("payload chunk {}: {e}", i + 1)).with_message_id(message_id))?;
        let data: PayloadData = msl_proto::decode(&plain)?;

        if data.message_id != message_id {
            return Err(MslError::message(format!(
                "payload chunk for message {} in message {message_id}",
                data.message_id
            ))
            .with_message_id(message_id));
        }
        let expected = i as u64 + 1;
        if data.sequence_number != expected {
            return Err(MslError::message(format!(
                "payload chunk {} where {expected} was expected",
                data.sequence_number
            ))
            .with_message_id(message_id));
        }
        let is_last = i == chunks.len() - 1;
        if data.end_of_message != is_last {
            return Err(MslError::message(format!("end of message flag on chunk {expected} of {}", chunks.len()))
                .with_message_id(message_id));
        }
        payload.extend_from_slice(&data.data);
    }
    Ok(payload)
}
