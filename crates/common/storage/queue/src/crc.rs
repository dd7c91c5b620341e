// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! CRC-32 (IEEE) over journal frames.
//!
//! The checksum covers the length prefix as well as the payload, so a torn
//! length field is caught the same way as a torn payload.

use crc32fast::Hasher;

#[inline]
pub(crate) fn frame_crc(length: u32, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&length.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

#[inline]
pub(crate) fn verify_frame_crc(length: u32, payload: &[u8], stored: u32) -> bool {
    frame_crc(length, payload) == stored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_covers_length_and_payload() {
        let payload = b"\x01payload";
        let length = payload.len() as u32;
        let crc = frame_crc(length, payload);

        assert_eq!(crc, frame_crc(length, payload));
        assert!(verify_frame_crc(length, payload, crc));
        assert!(!verify_frame_crc(length + 1, payload, crc));
        assert!(!verify_frame_crc(length, b"\x01pAyload", crc));
        assert!(!verify_frame_crc(length, payload, crc ^ 1));
    }
}
