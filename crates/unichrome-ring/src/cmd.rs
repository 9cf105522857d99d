//! Command-stream encodings shared by the ring producer, the software fetch
//! model, and the register-port verifier.
//!
//! Dwords with the top byte in the privileged range drive the fetch engine
//! itself: pause traps, jumps, fence writes. Everything below that range is
//! engine payload the producer forwards untouched.

use unichrome_mm::Pages;
use unichrome_types::Error;

pub const DWORD: u32 = 4;

const HDR_SHIFT: u32 = 24;
const TARGET_MASK: u32 = 0x00FF_FFFF;

pub const HDR_PAUSE: u32 = 0xC0;
pub const HDR_JUMP: u32 = 0xC1;
pub const HDR_NOP: u32 = 0xC2;
pub const HDR_FENCE: u32 = 0xC3;

pub fn pause() -> u32 {
    HDR_PAUSE << HDR_SHIFT
}

pub fn nop() -> u32 {
    HDR_NOP << HDR_SHIFT
}

/// Fence-write header; the following dword carries the sequence number.
pub fn fence_header() -> u32 {
    HDR_FENCE << HDR_SHIFT
}

/// Jump to a dword-aligned ring offset.
pub fn jump(target: u32) -> u32 {
    debug_assert_eq!(target % DWORD, 0);
    (HDR_JUMP << HDR_SHIFT) | ((target / DWORD) & TARGET_MASK)
}

pub fn jump_target(dword: u32) -> u32 {
    (dword & TARGET_MASK) * DWORD
}

pub fn header(dword: u32) -> u32 {
    dword >> HDR_SHIFT
}

pub fn is_privileged(dword: u32) -> bool {
    matches!(header(dword), HDR_PAUSE..=HDR_FENCE)
}

/// Check a user stream destined for the register port: dword-granular and
/// nothing privileged. The register port has no pause/jump machinery, so a
/// privileged dword there would desynchronize the fetch engine.
pub fn verify_stream(cmds: &[u8]) -> Result<(), Error> {
    if cmds.is_empty() || cmds.len() % DWORD as usize != 0 {
        return Err(Error::InvalidArgument {
            what: "command stream not dword-granular",
        });
    }
    for chunk in cmds.chunks_exact(DWORD as usize) {
        let dword = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if is_privileged(dword) {
            return Err(Error::ProtocolViolation {
                what: "privileged command in user stream",
            });
        }
    }
    Ok(())
}

pub fn write_dword(pages: &Pages, offset: u64, value: u32) {
    pages.write(offset, &value.to_le_bytes());
}

pub fn read_dword(pages: &Pages, offset: u64) -> u32 {
    let mut buf = [0u8; 4];
    pages.read(offset, &mut buf);
    u32::from_le_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_round_trips_aligned_offsets() {
        for target in [0u32, 4, 0x100, 0x3FFFFC] {
            assert_eq!(jump_target(jump(target)), target);
        }
    }

    #[test]
    fn verifier_rejects_privileged_dwords() {
        let ok = [0x1234_0000u32.to_le_bytes(), 0x0000_0001u32.to_le_bytes()].concat();
        assert_eq!(verify_stream(&ok), Ok(()));

        let bad = pause().to_le_bytes();
        assert_eq!(
            verify_stream(&bad),
            Err(Error::ProtocolViolation {
                what: "privileged command in user stream"
            })
        );
    }

    #[test]
    fn verifier_rejects_ragged_streams() {
        assert!(matches!(
            verify_stream(&[1, 2, 3]),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            verify_stream(&[]),
            Err(Error::InvalidArgument { .. })
        ));
    }
}
