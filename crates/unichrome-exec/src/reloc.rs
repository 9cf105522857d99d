//! Relocation patching.
//!
//! Patches run against the scratch copy of the command buffer, after
//! validation has fixed every buffer's GPU address. Each kind encodes the
//! address the way the consuming engine expects; nothing here reads the
//! caller's memory.

use unichrome_types::Error;

use crate::request::{ClipRect, RelocKind, Relocation};

fn get_dword(cmds: &[u8], index: u32) -> Result<u32, Error> {
    let at = index as usize * 4;
    let bytes = cmds
        .get(at..at + 4)
        .ok_or(Error::InvalidArgument {
            what: "relocation outside the command buffer",
        })?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn put_dword(cmds: &mut [u8], index: u32, value: u32) -> Result<(), Error> {
    let at = index as usize * 4;
    let bytes = cmds
        .get_mut(at..at + 4)
        .ok_or(Error::InvalidArgument {
            what: "relocation outside the command buffer",
        })?;
    bytes.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn addr32(gpu_offset: u64, delta: u64) -> Result<u32, Error> {
    let addr = gpu_offset.checked_add(delta).ok_or(Error::InvalidArgument {
        what: "relocation delta overflow",
    })?;
    u32::try_from(addr).map_err(|_| Error::InvalidArgument {
        what: "relocation address beyond the 32-bit aperture",
    })
}

/// Patch one relocation into `cmds`, with the target buffer now known to
/// live at `gpu_offset`.
pub fn apply(cmds: &mut [u8], reloc: &Relocation, gpu_offset: u64) -> Result<(), Error> {
    let addr = addr32(gpu_offset, reloc.delta)?;
    let at = reloc.offset;
    match reloc.kind {
        RelocKind::Blit2d { bpp, pos } => {
            // The 2D engine takes a 32-byte-aligned base; the remainder is
            // expressed in pixels and folded into the position field.
            let pixel_rem = match bpp {
                32 => (addr & 0x1f) >> 2,
                16 => (addr & 0x1f) >> 1,
                8 => addr & 0x1f,
                _ => {
                    return Err(Error::InvalidArgument {
                        what: "unsupported 2D relocation depth",
                    })
                }
            };
            put_dword(cmds, at, (addr & !0x1f) >> 3)?;
            put_dword(cmds, at + 1, pos.wrapping_add(pixel_rem))?;
        }
        RelocKind::ZBuffer => {
            put_dword(cmds, at, addr >> 5)?;
        }
        RelocKind::DstBuffer => {
            put_dword(cmds, at, addr >> 3)?;
        }
        RelocKind::TexBaseHiLo { mips } => {
            if mips == 0 {
                return Err(Error::InvalidArgument {
                    what: "texture relocation without mip levels",
                });
            }
            // Per-mip dwords carry intra-buffer offsets; the shared high
            // nibble lives one dword past the last mip.
            let lo = addr & 0x0FFF_FFFF;
            for mip in 0..mips {
                let existing = get_dword(cmds, at + mip)?;
                put_dword(cmds, at + mip, existing.wrapping_add(lo))?;
            }
            let existing = get_dword(cmds, at + mips)?;
            put_dword(cmds, at + mips, (existing & !0xF) | (addr >> 28))?;
        }
        RelocKind::YuvPlanar { planes, shift } => {
            if planes == 0 || shift > 31 {
                return Err(Error::InvalidArgument {
                    what: "malformed planar relocation",
                });
            }
            // Each plane dword holds its byte offset from the buffer base.
            for plane in 0..planes {
                let plane_offset = get_dword(cmds, at + plane)?;
                let base = u64::from(addr) + u64::from(plane_offset);
                put_dword(cmds, at + plane, (base >> shift) as u32)?;
            }
        }
    }
    Ok(())
}

/// Rewrite the two clip dwords for one replay pass.
pub fn patch_clip(cmds: &mut [u8], clip_offset: u32, rect: ClipRect) -> Result<(), Error> {
    let [tl, br] = rect.encode();
    put_dword(cmds, clip_offset, tl)?;
    put_dword(cmds, clip_offset + 1, br)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn dwords(cmds: &[u8]) -> Vec<u32> {
        cmds.chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[test]
    fn blit2d_splits_base_and_pixel_position() {
        let mut cmds = vec![0u8; 16];
        apply(
            &mut cmds,
            &Relocation {
                buf_index: 0,
                offset: 0,
                delta: 0,
                kind: RelocKind::Blit2d { bpp: 32, pos: 100 },
            },
            0x1000,
        )
        .unwrap();
        let d = dwords(&cmds);
        assert_eq!(d[0], (0x1000 & !0x1f) >> 3);
        assert_eq!(d[1], 100 + ((0x1000 & 0x1f) >> 2));
    }

    #[test]
    fn blit2d_folds_unaligned_remainders_by_depth() {
        for (bpp, expect_pos) in [(32u32, 7 + 4), (16, 7 + 8), (8, 7 + 16)] {
            let mut cmds = vec![0u8; 8];
            apply(
                &mut cmds,
                &Relocation {
                    buf_index: 0,
                    offset: 0,
                    delta: 0x10,
                    kind: RelocKind::Blit2d { bpp, pos: 7 },
                },
                0x2000,
            )
            .unwrap();
            let d = dwords(&cmds);
            assert_eq!(d[0], 0x2000 >> 3, "bpp {bpp}");
            assert_eq!(d[1], expect_pos, "bpp {bpp}");
        }
    }

    #[test]
    fn tex_relocation_adds_base_to_each_mip() {
        // Two mip dwords carrying intra-buffer offsets, then the hi field.
        let mut cmds = Vec::new();
        for dword in [0x100u32, 0x180, 0xFFFF_FFF0] {
            cmds.extend_from_slice(&dword.to_le_bytes());
        }
        apply(
            &mut cmds,
            &Relocation {
                buf_index: 0,
                offset: 0,
                delta: 0,
                kind: RelocKind::TexBaseHiLo { mips: 2 },
            },
            0x1234_5678,
        )
        .unwrap();
        let d = dwords(&cmds);
        assert_eq!(d[0], 0x100 + 0x0234_5678);
        assert_eq!(d[1], 0x180 + 0x0234_5678);
        assert_eq!(d[2], 0xFFFF_FFF0 | 0x1);
    }

    #[test]
    fn yuv_relocation_shifts_each_plane_base() {
        let mut cmds = Vec::new();
        for dword in [0u32, 0x1000, 0x1400] {
            cmds.extend_from_slice(&dword.to_le_bytes());
        }
        apply(
            &mut cmds,
            &Relocation {
                buf_index: 0,
                offset: 0,
                delta: 0,
                kind: RelocKind::YuvPlanar {
                    planes: 3,
                    shift: 4,
                },
            },
            0x8000,
        )
        .unwrap();
        let d = dwords(&cmds);
        assert_eq!(d[0], 0x8000 >> 4);
        assert_eq!(d[1], (0x8000 + 0x1000) >> 4);
        assert_eq!(d[2], (0x8000 + 0x1400) >> 4);
    }

    #[test]
    fn out_of_buffer_patch_is_rejected() {
        let mut cmds = vec![0u8; 8];
        assert!(matches!(
            apply(
                &mut cmds,
                &Relocation {
                    buf_index: 0,
                    offset: 1,
                    delta: 0,
                    kind: RelocKind::Blit2d { bpp: 32, pos: 0 },
                },
                0,
            ),
            Err(Error::InvalidArgument { .. })
        ));
    }
}
