//! Fuzz target for wire structure decoding
//!
//! Arbitrary bytes decoded as every top-level wire structure, in whichever
//! encoding the decoder detects. Decoding must never panic; invalid input
//! returns an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use msl_proto::{
    ErrorData, HeaderData, KeyRequestData, KeyResponseData, MasterTokenData, PayloadData, ServiceTokenData,
    UserIdTokenData, WireMessage, decode,
};

fuzz_target!(|data: &[u8]| {
    let _ = decode::<WireMessage>(data);
    let _ = decode::<HeaderData>(data);
    let _ = decode::<ErrorData>(data);
    let _ = decode::<PayloadData>(data);
    let _ = decode::<MasterTokenData>(data);
    let _ = decode::<UserIdTokenData>(data);
    let _ = decode::<ServiceTokenData>(data);
    let _ = decode::<KeyRequestData>(data);
    let _ = decode::<KeyResponseData>(data);
});
