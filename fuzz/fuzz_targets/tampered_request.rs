//! Fuzz target for integrity of protected requests
//!
//! Builds a valid PSK-authenticated request, applies arbitrary byte edits
//! and checks that the server either rejects it or recovers exactly the
//! original payload.
//!
//! # Invariants
//!
//! - Never panics
//! - A tampered request is never accepted with a different payload

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use msl_core::{
    EntityAuthRegistry, FixedEnv, HeaderAuth, MessageContexts, MessageHeader, MslConfig, PskEntityAuth,
};
use msl_crypto::{AsymmetricCryptoContext, AsymmetricMode, SymmetricCryptoContext};
use msl_proto::EntityAuthData;
use msl_server::MslServer;

#[derive(Debug, Arbitrary)]
struct Edit {
    position: u16,
    value: u8,
}

#[derive(Debug, Arbitrary)]
struct Input {
    payload: Vec<u8>,
    message_id: u32,
    edits: Vec<Edit>,
    truncate: Option<u16>,
}

fn psk() -> SymmetricCryptoContext {
    SymmetricCryptoContext::new("device-1", [7; 32], [8; 32]).with_wrap_key([9; 32])
}

fuzz_target!(|input: Input| {
    let env = std::sync::Arc::new(FixedEnv::new(1_700_000_000, 1));
    let signer = AsymmetricCryptoContext::new("server", AsymmetricMode::SignVerify).with_signing_key([11; 32]);
    let Ok(server) = MslServer::builder("server", signer, SymmetricCryptoContext::new("issuer", [1; 32], [2; 32]))
        .env(env.clone())
        .entity_auth(EntityAuthRegistry::new().with(PskEntityAuth::new().with_entity("device-1", psk())))
        .build()
    else {
        return;
    };

    let header = MessageHeader::new(
        HeaderAuth::EntityAuth(EntityAuthData::Psk { identity: "device-1".to_string() }),
        u64::from(input.message_id),
    );
    let Ok(mut bytes) = header.encode(MessageContexts::single(&psk()), &input.payload, env.as_ref(), &MslConfig::default())
    else {
        return;
    };

    let original = bytes.clone();
    for edit in &input.edits {
        if bytes.is_empty() {
            break;
        }
        let position = usize::from(edit.position) % bytes.len();
        bytes[position] = edit.value;
    }
    if let Some(len) = input.truncate {
        bytes.truncate(usize::from(len));
    }

    if let Ok(request) = server.receive(&bytes) {
        assert_eq!(request.payload(), input.payload.as_slice(), "tampered payload accepted");
        if bytes != original {
            assert_eq!(request.message_id(), u64::from(input.message_id));
        }
    }
});
