//! PixelPacker: planar pictures into the packed 10-bit wire buffer.

pub mod v210;

pub use v210::{pack_words, row_bytes};

use bytes::Bytes;
use std::sync::Arc;

use crate::error::{OutputError, Result};
use crate::frame::{PackedUnit, Picture, PictureData, PictureFormat};

/// Pack a planar picture into a wire-format unit.
///
/// Deterministic and side-effect-free; side data is carried through
/// verbatim. 4:2:0 chroma is not filtered up to 4:2:2 - chroma lines are
/// reused across two (progressive) or four (interlaced) luma lines.
pub fn pack_picture(pic: &Picture) -> Result<PackedUnit> {
    let meta = &pic.meta;
    let (width, height) = (meta.width as usize, meta.height as usize);
    if width % 2 != 0 {
        return Err(OutputError::Precondition(format!(
            "wire packing needs an even width, got {width}"
        )));
    }

    let stride = row_bytes(meta.width);
    let mut out = Vec::new();
    out.try_reserve_exact(stride * height)
        .map_err(|e| OutputError::ResourceExhaustion(format!("packed buffer: {e}")))?;
    out.resize(stride * height, 0);

    match (&pic.data, meta.format) {
        (PictureData::Planes10(planes), PictureFormat::Yuv422p10) => {
            let (y, u, v) = planes10(planes, width, height)?;
            for h in 0..height {
                v210::pack_row_10(
                    &y[h * width..],
                    &u[h * (width / 2)..],
                    &v[h * (width / 2)..],
                    width,
                    &mut out[h * stride..(h + 1) * stride],
                );
            }
        }
        (PictureData::Planes8(planes), PictureFormat::Yuv422p | PictureFormat::Yuv420p) => {
            let (y, u, v) = planes8(planes, width, height, meta.format)?;
            for h in 0..height {
                let cr = chroma_row(meta.format, meta.interlaced, h);
                v210::pack_row_8(
                    &y[h * width..],
                    &u[cr * (width / 2)..],
                    &v[cr * (width / 2)..],
                    width,
                    &mut out[h * stride..(h + 1) * stride],
                );
            }
        }
        _ => {
            return Err(OutputError::Precondition(format!(
                "cannot pack {:?} from this sample storage",
                meta.format
            )))
        }
    }

    Ok(PackedUnit {
        data: Bytes::from(out),
        width: meta.width,
        height: meta.height,
        pts: meta.pts,
        side_data: pic.side_data.clone(),
    })
}

/// Source chroma line for luma line `h`. 4:2:2 maps straight through; 4:2:0
/// reuses each chroma line across the field structure instead of filtering.
fn chroma_row(format: PictureFormat, interlaced: bool, h: usize) -> usize {
    if format != PictureFormat::Yuv420p {
        return h;
    }
    if interlaced {
        (h / 4) * 2 + (h % 2)
    } else {
        h / 2
    }
}

fn planes10<'a>(
    planes: &'a [Arc<[u16]>],
    width: usize,
    height: usize,
) -> Result<(&'a [u16], &'a [u16], &'a [u16])> {
    if planes.len() != 3 {
        return Err(OutputError::Precondition(format!(
            "expected 3 planes, got {}",
            planes.len()
        )));
    }
    let need = [width * height, width / 2 * height, width / 2 * height];
    for (i, (p, n)) in planes.iter().zip(need).enumerate() {
        if p.len() < n {
            return Err(OutputError::Precondition(format!(
                "plane {i} holds {} samples, needs {n}",
                p.len()
            )));
        }
    }
    Ok((&planes[0], &planes[1], &planes[2]))
}

fn planes8<'a>(
    planes: &'a [Bytes],
    width: usize,
    height: usize,
    format: PictureFormat,
) -> Result<(&'a [u8], &'a [u8], &'a [u8])> {
    if planes.len() != 3 {
        return Err(OutputError::Precondition(format!(
            "expected 3 planes, got {}",
            planes.len()
        )));
    }
    let chroma_height = if format == PictureFormat::Yuv420p {
        height / 2
    } else {
        height
    };
    let need = [
        width * height,
        width / 2 * chroma_height,
        width / 2 * chroma_height,
    ];
    for (i, (p, n)) in planes.iter().zip(need).enumerate() {
        if p.len() < n {
            return Err(OutputError::Precondition(format!(
                "plane {i} holds {} bytes, needs {n}",
                p.len()
            )));
        }
    }
    Ok((&planes[0], &planes[1], &planes[2]))
}
