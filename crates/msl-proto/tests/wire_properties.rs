//! Property-based tests for wire structures
//!
//! Decoding is fed arbitrary bytes (it must fail cleanly, never panic) and
//! structural validation is checked against generated lifecycle fields.

use msl_proto::{
    EncoderFormat, EntityAuthData, HeaderData, KeyRequestData, MAX_COUNTER, MasterTokenData,
    ProtocolError, SymmetricKeyId, TokenEnvelope, WireMessage, next_counter,
};
use proptest::prelude::*;

/// Strategy for generating token envelopes with arbitrary contents
fn arbitrary_envelope() -> impl Strategy<Value = TokenEnvelope> {
    (prop::collection::vec(any::<u8>(), 0..64), prop::collection::vec(any::<u8>(), 0..64))
        .prop_map(|(tokendata, signature)| TokenEnvelope { tokendata, signature })
}

/// Strategy for generating header data
fn arbitrary_header_data() -> impl Strategy<Value = HeaderData> {
    (
        0..=MAX_COUNTER,
        prop::option::of(0..=MAX_COUNTER),
        any::<bool>(),
        prop::option::of(arbitrary_envelope()),
        prop::collection::vec(arbitrary_envelope(), 0..4),
    )
        .prop_map(|(message_id, non_replayable_id, renewable, user_id_token, service_tokens)| {
            HeaderData {
                sender: Some("device".to_string()),
                timestamp: 1_700_000_000,
                message_id,
                non_replayable_id,
                renewable,
                handshake: false,
                key_request_data: vec![KeyRequestData::SymmetricWrapped { key_id: SymmetricKeyId::Psk }],
                key_response_data: None,
                user_auth_data: None,
                user_id_token,
                service_tokens,
            }
        })
}

#[test]
fn prop_decode_arbitrary_bytes_never_panics() {
    proptest!(|(bytes in prop::collection::vec(any::<u8>(), 0..512))| {
        let _ = WireMessage::decode(&bytes);
    });
}

#[test]
fn prop_header_data_identical_across_encodings() {
    proptest!(|(data in arbitrary_header_data())| {
        let cbor = EncoderFormat::Cbor.encode(&data).expect("encode should succeed");
        let json = EncoderFormat::Json.encode(&data).expect("encode should succeed");

        let from_cbor: HeaderData = msl_proto::decode(&cbor).expect("decode should succeed");
        let from_json: HeaderData = msl_proto::decode(&json).expect("decode should succeed");

        // PROPERTY: Both encodings carry the same token set and ids
        prop_assert_eq!(&from_cbor, &data);
        prop_assert_eq!(from_json, from_cbor);
    });
}

#[test]
fn prop_master_token_window_validation() {
    proptest!(|(renewal_window in any::<u64>(), expiration in any::<u64>(), sequence in 0..=MAX_COUNTER)| {
        let data = MasterTokenData {
            renewal_window,
            expiration,
            sequence_number: sequence,
            serial_number: 1,
            session_data: vec![],
        };

        // PROPERTY: Validation accepts exactly the windows that precede expiration
        prop_assert_eq!(data.validate().is_ok(), renewal_window < expiration);
    });
}

#[test]
fn prop_counter_stays_in_range() {
    proptest!(|(value in 0..=MAX_COUNTER)| {
        let next = next_counter(value);
        prop_assert!(next <= MAX_COUNTER);
        prop_assert!(next == value + 1 || (value == MAX_COUNTER && next == 0));
    });
}

#[test]
fn truncated_message_is_decode_error() {
    let message = WireMessage {
        header: msl_proto::HeaderEnvelope::Error {
            entity_auth: EntityAuthData::Psk { identity: "device".to_string() },
            errordata: vec![0; 16],
            signature: vec![0; 32],
        },
        payloads: vec![],
    };
    let bytes = message.encode(EncoderFormat::Cbor).expect("encode should succeed");

    let result = WireMessage::decode(&bytes[..bytes.len() / 2]);
    assert!(matches!(result, Err(ProtocolError::CborDecode(_))));
}
