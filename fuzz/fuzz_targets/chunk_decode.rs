#![no_main]
use arbitrary::Arbitrary;
use core_crypto::aead;
use core_packet::chunk;
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    payload: Vec<u8>,
    key: [u8; 32],
}

fuzz_target!(|inp: Input| {
    // Chunk metadata parsing over arbitrary payloads.
    let _ = chunk::decode(&inp.payload);

    // The AEAD wire decoder must handle arbitrary ciphertexts gracefully.
    let _ = aead::open_prefixed(&inp.key, &inp.payload);
});
