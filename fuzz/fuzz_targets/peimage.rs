#![no_main]

use libfuzzer_sys::fuzz_target;
use peweld::PeImage;

fuzz_target!(|data: &[u8]| {
    if let Ok(mut image) = PeImage::parse(data) {
        let _ = image.to_bytes();
    }
});
