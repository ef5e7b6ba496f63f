//! Fuzz target for responder-side message validation
//!
//! Feeds arbitrary bytes through the full receive path of a configured
//! server, including the error header it answers with.
//!
//! # Invariants
//!
//! - Never panics
//! - Garbage is never accepted as a request
//! - Every rejection still yields a signed error header

#![no_main]

use std::sync::{Arc, LazyLock};

use libfuzzer_sys::fuzz_target;
use msl_core::{EntityAuthRegistry, FixedEnv, PskEntityAuth};
use msl_crypto::{AsymmetricCryptoContext, AsymmetricMode, SymmetricCryptoContext};
use msl_server::{MslServer, Reply};

static SERVER: LazyLock<MslServer> = LazyLock::new(|| {
    let psk = SymmetricCryptoContext::new("device-1", [7; 32], [8; 32]).with_wrap_key([9; 32]);
    let signer = AsymmetricCryptoContext::new("server", AsymmetricMode::SignVerify).with_signing_key([11; 32]);
    MslServer::builder("server", signer, SymmetricCryptoContext::new("issuer", [1; 32], [2; 32]))
        .env(Arc::new(FixedEnv::new(1_700_000_000, 1)))
        .entity_auth(EntityAuthRegistry::new().with(PskEntityAuth::new().with_entity("device-1", psk)))
        .build()
        .expect("fuzz server configuration is valid")
});

fuzz_target!(|data: &[u8]| {
    let _ = SERVER.receive(data);
    let response = SERVER.handle(data, |request| Ok(Reply::new(request.payload())));
    assert!(response.is_ok(), "error header must always be produced");
});
