#![no_main]
use core_packet::Packet;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary bytes must either succeed or return a defined error.
    if let Ok(packet) = Packet::from_bytes(data) {
        // A successful decode must re-encode to the same bytes.
        assert_eq!(packet.to_bytes().as_ref(), data);
    }
});
